//! `scproto`: the two wire protocols spoken by the chat server.
//!
//! - `ao`: the legacy delimited form. Frames are `header#field#...#%` with a
//!   four-symbol escape table for the reserved bytes.
//! - `sc`: JSON envelopes `{"header": ..., "data": ...}` carried as
//!   WebSocket text messages.
//!
//! Codecs here are IO-free: they work on byte slices and strings. Framing
//! (finding the `%` boundaries on a stream) lives in `scio`.

pub mod ao;
pub mod sc;

#[derive(Debug, Clone)]
pub enum ProtoError {
    /// The frame is structurally invalid for the protocol.
    Malformed(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::Malformed(s) => write!(f, "malformed packet: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}
