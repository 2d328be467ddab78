//! The server orchestrator: owns the configuration, the credential store,
//! the rooms, the UID pool and the client registry, and implements the
//! lifecycle operations (moves, kicks, removal) and broadcast fan-out.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::client::Client;
use crate::client::ClientKind;
use crate::client::ClientList;
use crate::config;
use crate::db::Database;
use crate::perms;
use crate::perms::Role;
use crate::room;
use crate::room::Room;
use crate::uid;
use crate::uid::UidHeap;

pub struct Server {
    pub config: config::ServerConfig,
    pub db: Database,
    pub roles: Vec<Role>,
    /// Role granted to room managers by /manage.
    pub mgr_role: Role,
    pub rooms: Vec<Arc<Room>>,
    pub uid_heap: UidHeap,
    pub clients: ClientList,

    fatal_tx: mpsc::Sender<anyhow::Error>,
    fatal_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
}

impl Server {
    /// Build the server from configuration. Fails on an empty room list, a
    /// bad role table, a missing manager role or an unopenable database.
    pub fn new(bundle: config::Bundle, db: Database) -> anyhow::Result<Arc<Server>> {
        let rooms = room::make_rooms(&bundle.rooms, &bundle.characters, &bundle.music)?;
        let roles = perms::make_roles(&bundle.roles)?;
        let mgr_role = roles
            .iter()
            .find(|r| r.name == bundle.server.manager_role)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "manager role '{}' not in roles list",
                    bundle.server.manager_role
                )
            })?;

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Ok(Arc::new(Server {
            uid_heap: UidHeap::new(bundle.server.max_players),
            config: bundle.server,
            db,
            roles,
            mgr_role,
            rooms,
            clients: ClientList::new(),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }))
    }

    /// Run the listeners until one of them reports a fatal error.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(name = %self.config.name, "starting server");
        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("server already running"))?;

        if self.config.ws_port > 0 {
            tokio::spawn(crate::net::listen_ws(self.clone()));
        }
        if self.config.legacy_port > 0 {
            tokio::spawn(crate::net::listen_tcp(self.clone()));
        }
        if self.config.control_port > 0 {
            tokio::spawn(crate::control::listen(self.clone()));
        }

        match fatal_rx.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Report an unrecoverable error up to `run`.
    pub async fn fatal(&self, err: anyhow::Error) {
        let _ = self.fatal_tx.send(err).await;
    }

    /// Find a joined client by UID.
    pub fn get_by_uid(&self, id: i32) -> Option<Arc<Client>> {
        if id == uid::UNJOINED {
            return None;
        }
        self.clients.clients().into_iter().find(|c| c.uid() == id)
    }

    /// All clients sharing an IPID.
    pub fn get_by_ipid(&self, ipid: &str) -> Vec<Arc<Client>> {
        self.clients
            .clients()
            .into_iter()
            .filter(|c| c.ipid() == ipid)
            .collect()
    }

    pub fn get_room_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.iter().find(|r| r.name() == name).cloned()
    }

    pub fn get_clients_in_room(&self, room: &Arc<Room>) -> Vec<Arc<Client>> {
        self.clients
            .clients()
            .into_iter()
            .filter(|c| c.room().is_some_and(|r| Arc::ptr_eq(&r, room)))
            .collect()
    }

    /// Send a legacy frame to every legacy client in a room.
    pub async fn write_to_room_ao(&self, room: &Arc<Room>, header: &str, contents: &[String]) {
        for c in self.get_clients_in_room(room) {
            if c.kind() == ClientKind::Ao {
                c.write_ao_list(header, contents).await;
            }
        }
    }

    /// Send a legacy frame to every legacy client on the server.
    pub async fn write_to_all_ao(&self, header: &str, contents: &[String]) {
        for c in self.clients.clients() {
            if c.kind() == ClientKind::Ao {
                c.write_ao_list(header, contents).await;
            }
        }
    }

    pub async fn send_ooc_to_room(&self, room: &Arc<Room>, username: &str, msg: &str, server: bool) {
        for c in self.get_clients_in_room(room) {
            c.send_ooc(username, msg, server).await;
        }
    }

    /// A server-sourced OOC line to everyone in a room.
    pub async fn send_server_message_to_room(&self, room: &Arc<Room>, msg: &str) {
        room.log_event(
            room::Event::ServerMsg,
            &format!("{}: {}", self.config.username, msg),
        );
        self.send_ooc_to_room(room, &self.config.username, msg, true)
            .await;
    }

    /// A server-sourced OOC line to one client.
    pub async fn send_server_message(&self, c: &Client, msg: &str) {
        c.send_ooc(&self.config.username, msg, true).await;
    }

    /// Send ARUP summaries to every joined client.
    pub async fn send_room_update_all_ao(&self, sections: u8) {
        for c in self.clients.clients_joined() {
            if c.kind() == ClientKind::Ao {
                c.send_room_update_ao(sections).await;
            }
        }
    }

    /// Move a client to another room, enforcing the lock/invite rules and
    /// carrying the character over by name where possible.
    pub async fn move_client(&self, c: &Arc<Client>, dst: &Arc<Room>) {
        let Some(cur) = c.room() else {
            return;
        };
        if Arc::ptr_eq(&cur, dst) {
            self.send_server_message(c, "You are already in this room!")
                .await;
            return;
        }

        let uid = c.uid();
        if cur.is_manager(uid) {
            cur.remove_manager(uid);
            c.remove_role(&self.mgr_role);
            self.send_server_message_to_room(
                &cur,
                &format!("{} is no longer managing this room.", c.short_string()),
            )
            .await;
        }

        if dst.lock_state() == room::LockState::Locked && !dst.is_invited(uid) {
            dst.log_event(
                room::Event::Fail,
                &format!("{} tried to enter uninvited.", c.long_string()),
            );
            self.send_server_message(c, "You are not invited to this room!")
                .await;
            return;
        }

        self.send_server_message(
            c,
            &format!(
                "Moved to [{}] {}. Description: {}",
                dst.id(),
                dst.name(),
                dst.desc()
            ),
        )
        .await;

        // Carry the character by name; fall back to spectating.
        let mut new_cid = match dst.cid_by_name(&cur.name_by_cid(c.cid())) {
            Some(cid) => cid,
            None => {
                self.send_server_message(
                    c,
                    "Your character is not in this room's list. Changing to Spectator.",
                )
                .await;
                room::SPECTATOR_CID
            }
        };
        if !dst.enter(new_cid, uid) {
            self.send_server_message(
                c,
                "Your character in this room is taken. Changing to Spectator.",
            )
            .await;
            new_cid = room::SPECTATOR_CID;
            dst.enter(new_cid, uid);
        }

        self.send_server_message_to_room(
            dst,
            &format!(
                "{} enters from [{}] {}.",
                c.short_string(),
                cur.id(),
                cur.name()
            ),
        )
        .await;
        dst.log_event(
            room::Event::Enter,
            &format!(
                "{} enters from [{}] {}.",
                c.long_string(),
                cur.id(),
                cur.name()
            ),
        );
        c.set_room(Some(dst.clone()));

        cur.leave(uid);
        self.send_server_message_to_room(
            &cur,
            &format!(
                "{} leaves to [{}] {}.",
                c.short_string(),
                dst.id(),
                dst.name()
            ),
        )
        .await;
        cur.log_event(
            room::Event::Exit,
            &format!("{} leaves to [{}] {}.", c.long_string(), dst.id(), dst.name()),
        );

        c.update().await;
        c.change_char(new_cid).await;

        if c.kind() == ClientKind::Ao {
            c.send_room_update_ao(scproto::ao::UPDATE_ALL & !scproto::ao::UPDATE_PLAYER)
                .await;
        }
        self.send_room_update_all_ao(scproto::ao::UPDATE_PLAYER).await;
    }

    /// Kick: notify, then remove.
    pub async fn kick_client(&self, c: &Arc<Client>, reason: &str) {
        c.notify_kick(reason).await;
        self.remove_client(c).await;
    }

    /// Disconnect a client and release everything it held: room slot, UID,
    /// registry entry, transport.
    pub async fn remove_client(&self, c: &Arc<Client>) {
        if let Some(cur) = c.room() {
            let uid = c.uid();
            if cur.is_manager(uid) {
                cur.remove_manager(uid);
                c.remove_role(&self.mgr_role);
                self.send_server_message_to_room(
                    &cur,
                    &format!("{} is no longer managing this room.", c.short_string()),
                )
                .await;
            }
            cur.log_event(
                room::Event::Exit,
                &format!("{} disconnected.", c.long_string()),
            );
            cur.leave(uid);
            c.set_room(None);
            // No disconnect message for someone who never picked a character.
            if c.char_picked() {
                self.send_server_message_to_room(
                    &cur,
                    &format!("{} has disconnected.", c.short_string()),
                )
                .await;
            }
        }
        if c.uid() != uid::UNJOINED {
            info!(uid = c.uid(), ipid = %c.ipid(), "client left");
            self.uid_heap.free(c.uid());
            c.set_uid(uid::UNJOINED);
        }
        c.disconnect();
        self.clients.remove(c);
        self.send_room_update_all_ao(scproto::ao::UPDATE_PLAYER).await;
    }
}

#[cfg(test)]
pub mod testutil {
    //! Shared fixtures for the dispatcher and command tests.

    use super::*;
    use crate::client::Outbound;
    use tokio::sync::mpsc;

    pub fn test_bundle() -> config::Bundle {
        config::Bundle {
            server: config::ServerConfig {
                max_players: 10,
                ..Default::default()
            },
            rooms: config::RoomList {
                rooms: vec![
                    config::RoomConfig {
                        name: "Courtroom".to_string(),
                        adjacent_rooms: vec!["Lobby".to_string()],
                        ..Default::default()
                    },
                    config::RoomConfig {
                        name: "Lobby".to_string(),
                        adjacent_rooms: vec!["Courtroom".to_string()],
                        allow_iniswap: false,
                        allow_blankpost: false,
                        ..Default::default()
                    },
                ],
            },
            characters: config::Characters {
                lists: vec![config::CharList {
                    name: "main".to_string(),
                    characters: vec![
                        "Phoenix".to_string(),
                        "Edgeworth".to_string(),
                        "Maya".to_string(),
                        "Franziska".to_string(),
                    ],
                }],
            },
            music: config::Music {
                categories: vec![config::SongCategory {
                    name: "Trial".to_string(),
                    songs: vec!["objection.mp3".to_string(), "pursuit.mp3".to_string()],
                }],
            },
            roles: config::Roles {
                roles: vec![
                    config::RoleConfig {
                        name: "Admin".to_string(),
                        permissions: vec!["all".to_string()],
                    },
                    config::RoleConfig {
                        name: "Moderator".to_string(),
                        permissions: vec![
                            "see_ipids".to_string(),
                            "hear_modcall".to_string(),
                            "mute".to_string(),
                            "kick".to_string(),
                            "ban".to_string(),
                            "unban".to_string(),
                            "background".to_string(),
                        ],
                    },
                    config::RoleConfig {
                        name: "Manager".to_string(),
                        permissions: vec!["status".to_string(), "lock".to_string()],
                    },
                ],
            },
        }
    }

    pub fn test_server() -> Arc<Server> {
        let db = Database::open_in_memory().expect("in-memory db");
        Server::new(test_bundle(), db).expect("test server")
    }

    /// A registered client with a captured outbound channel.
    pub fn connect(srv: &Arc<Server>, kind: ClientKind, ip: &str) -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        let addr = format!("{ip}:40000").parse().expect("addr");
        let (c, rx) = Client::new(addr, kind);
        srv.clients.add(c.clone());
        (c, rx)
    }

    /// Drive the AO join sequence far enough to be joined in room 0.
    pub async fn join(srv: &Arc<Server>, c: &Arc<Client>) {
        let uid = srv.uid_heap.take().expect("uid available");
        srv.rooms[0].enter(room::SPECTATOR_CID, uid);
        c.set_uid(uid);
        c.set_cid(room::SPECTATOR_CID);
        c.set_charname("Spectator");
        c.set_room(Some(srv.rooms[0].clone()));
    }

    pub fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Frame(f) = msg {
                out.push(f);
            }
        }
        out
    }
}
