//! `scio`: async stream IO used by the chat server.
//!
//! - `frame`: reader/writer for the legacy `%`-delimited wire transport.
//! - `line`: newline-delimited reader, used by the control endpoint.

pub mod frame;
pub mod line;
