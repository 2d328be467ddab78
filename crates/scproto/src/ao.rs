//! The legacy delimited packet form.
//!
//! A frame is `header#c1#c2#...#%`. `#` separates fields, `%` terminates the
//! frame, so neither may appear raw inside a field; the same goes for `&`
//! (pair sub-fields) and `$`. Reserved bytes travel escaped:
//! `%` -> `<percent>`, `&` -> `<and>`, `#` -> `<num>`, `$` -> `<dollar>`.

use crate::ProtoError;

/// The canonical "stop the music" track.
pub const SONG_STOP: &str = "~stop.mp3";

/// Section selectors for the area-update (`ARUP`) broadcast.
pub const UPDATE_PLAYER: u8 = 1 << 0;
pub const UPDATE_STATUS: u8 = 1 << 1;
pub const UPDATE_MANAGER: u8 = 1 << 2;
pub const UPDATE_LOCK: u8 = 1 << 3;
pub const UPDATE_ALL: u8 = 0b1111;

/// Song effect bits for the `MC` packet.
pub const EFFECT_FADE_IN: u8 = 1 << 0;
pub const EFFECT_FADE_OUT: u8 = 1 << 1;
pub const EFFECT_SYNC: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAo {
    pub header: String,
    pub contents: Vec<String>,
}

/// Decode one frame payload (terminator already stripped by the framer, or
/// still present as a trailing `%` for message-based transports).
///
/// The last `#`-separated token is the frame trailer, not a field, and is
/// discarded. Field contents are unescaped.
pub fn decode(raw: &[u8]) -> Result<PacketAo, ProtoError> {
    let s = String::from_utf8_lossy(raw);
    let parts: Vec<&str> = s.split('#').collect();
    if parts.len() < 2 {
        return Err(ProtoError::Malformed("missing field separator"));
    }
    Ok(PacketAo {
        header: parts[0].to_string(),
        contents: parts[1..parts.len() - 1]
            .iter()
            .map(|p| unescape(p))
            .collect(),
    })
}

/// Assemble a full frame, escaping each content field.
///
/// The header is a protocol constant and is never escaped.
pub fn encode(header: &str, contents: &[&str]) -> String {
    if contents.is_empty() {
        return format!("{header}#%");
    }
    let mut out = String::with_capacity(header.len() + contents.len() * 8 + 2);
    out.push_str(header);
    for c in contents {
        out.push('#');
        out.push_str(&escape(c));
    }
    out.push_str("#%");
    out
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("<percent>"),
            '&' => out.push_str("<and>"),
            '#' => out.push_str("<num>"),
            '$' => out.push_str("<dollar>"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    s.replace("<percent>", "%")
        .replace("<and>", "&")
        .replace("<num>", "#")
        .replace("<dollar>", "$")
}
