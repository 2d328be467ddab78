//! The JSON envelope protocol.
//!
//! Every message is one WebSocket text frame holding a single object with a
//! `header` string and a free-form `data` value. The server never re-encodes
//! `data` on the way through; it re-marshals only when a typed handler needs
//! the payload.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketSc {
    pub header: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub fn decode(raw: &[u8]) -> Result<PacketSc, serde_json::Error> {
    serde_json::from_slice(raw)
}

pub fn encode<T: Serialize>(header: &str, data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&PacketSc {
        header: header.to_string(),
        data: serde_json::to_value(data)?,
    })
}

// Client payloads.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataHelloClient {
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub identifier: String,
}

// Server payloads.

#[derive(Debug, Clone, Serialize)]
pub struct DataHelloServer {
    pub application: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub playercount: usize,
    pub url: String,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MusicCategory {
    pub category: String,
    pub songs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataOoc {
    pub username: String,
    pub message: String,
    pub server: bool,
}
