//! The JSON-envelope (SC) protocol dispatcher.
//!
//! Dispatch is by the envelope's `header` string; unknown headers are
//! ignored. The handler set mirrors the legacy dispatcher and grows the
//! same way: add a match arm and a typed payload.

use std::sync::Arc;

use scproto::sc::PacketSc;
use tracing::debug;

use crate::client::Client;
use crate::server::Server;

impl Server {
    pub async fn handle_packet_sc(&self, c: &Arc<Client>, pkt: PacketSc) {
        match pkt.header.as_str() {
            "hello" => self.handle_hello(c, pkt).await,
            _ => {}
        }
    }

    /// Capability exchange: character list, taken list, music list.
    async fn handle_hello(&self, c: &Arc<Client>, pkt: PacketSc) {
        let hello: scproto::sc::DataHelloClient = match serde_json::from_value(pkt.data) {
            Ok(h) => h,
            Err(e) => {
                debug!(addr = %c.addr(), err = %e, "bad 'hello' payload");
                return;
            }
        };
        if !hello.identifier.is_empty() {
            c.set_ident(&hello.identifier);
        }

        let room = &self.rooms[0];
        c.write_sc("CHARLIST", &room.chars()).await;
        c.write_sc("CHARLISTTAKEN", &room.taken()).await;

        let cats: Vec<scproto::sc::MusicCategory> = room
            .music()
            .into_iter()
            .map(|cat| scproto::sc::MusicCategory {
                category: cat.name,
                songs: cat.songs,
            })
            .collect();
        c.write_sc("MUSICLIST", &cats).await;
    }
}
