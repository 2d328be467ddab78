//! Client sessions and the connected-client registry.
//!
//! A `Client` is one connection's identity and state. The connection's read
//! half stays with its network task; the client owns only the write side,
//! an mpsc channel drained by a per-connection writer task, so writes from
//! any task serialize in FIFO order.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing::trace;

use crate::perms;
use crate::perms::Mask;
use crate::perms::Role;
use crate::room::Room;
use crate::room::SPECTATOR_CID;
use crate::uid;

/// Which protocol the connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Undetermined,
    Ao,
    Sc,
}

// Situational mute bits.
pub const MUTED_IC: u8 = 1 << 0;
pub const MUTED_OOC: u8 = 1 << 1;
pub const MUTED_MUSIC: u8 = 1 << 2;
pub const MUTED_JUDGE: u8 = 1 << 3;
pub const MUTED_ALL: u8 = MUTED_IC | MUTED_OOC | MUTED_MUSIC | MUTED_JUDGE;

/// What a session last put on the pairing wire, plus who it wants to pair
/// with. Two sessions are mutually paired when each wants the other's CID
/// and their sides match.
#[derive(Debug, Clone)]
pub struct PairData {
    pub wanted_cid: i32,
    pub last_char: String,
    pub last_emote: String,
    pub last_offset: String,
    pub last_flip: String,
}

impl Default for PairData {
    fn default() -> Self {
        Self {
            wanted_cid: -1,
            last_char: String::new(),
            last_emote: String::new(),
            last_offset: "0".to_string(),
            last_flip: "0".to_string(),
        }
    }
}

/// One outbound message for the writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A fully-assembled text frame (legacy frame or JSON envelope).
    Frame(String),
    /// Tear the transport down after flushing.
    Close,
}

#[derive(Debug)]
struct TimedMute {
    bits: u8,
    /// `None` never expires.
    until: Option<Instant>,
}

#[derive(Debug)]
struct State {
    kind: ClientKind,
    ident: String,
    uid: i32,
    cid: i32,
    charname: String,
    showname: String,
    username: String,
    side: String,
    room: Option<Arc<Room>>,
    perms: Mask,
    roles: Vec<Role>,
    char_picked: bool,
    last_msg: String,
    pair: PairData,
    mute: u8,
    mutes: Vec<TimedMute>,
}

#[derive(Debug)]
pub struct Client {
    addr: SocketAddr,
    ipid: String,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<State>,
    /// Wakes the connection's read loop so it can exit.
    closed: Notify,
    mute_stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// The IPID shared with moderators in place of the raw address: the last 6
/// characters of unpadded base64 over MD5 of the IP. About 36 bits; fine as
/// a moderation hint, never an authorization token.
pub fn hash_ip(ip: IpAddr) -> String {
    let digest = md5::compute(ip.to_string().as_bytes());
    let enc = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest.0);
    enc[enc.len() - 6..].to_string()
}

impl Client {
    /// Create a client for a connection. The returned receiver belongs to
    /// the connection's writer task.
    pub fn new(addr: SocketAddr, kind: ClientKind) -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(256);
        let client = Arc::new(Client {
            addr,
            ipid: hash_ip(addr.ip()),
            tx,
            state: Mutex::new(State {
                kind,
                ident: String::new(),
                uid: uid::UNJOINED,
                cid: SPECTATOR_CID,
                charname: String::new(),
                showname: String::new(),
                username: String::new(),
                side: String::new(),
                room: None,
                perms: perms::NONE,
                roles: Vec::new(),
                char_picked: false,
                last_msg: String::new(),
                pair: PairData::default(),
                mute: 0,
                mutes: Vec::new(),
            }),
            closed: Notify::new(),
            mute_stop: Mutex::new(None),
        });
        (client, rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ipid(&self) -> &str {
        &self.ipid
    }

    pub fn kind(&self) -> ClientKind {
        self.state.lock().kind
    }

    pub fn set_kind(&self, kind: ClientKind) {
        self.state.lock().kind = kind;
    }

    pub fn ident(&self) -> String {
        self.state.lock().ident.clone()
    }

    pub fn set_ident(&self, ident: &str) {
        self.state.lock().ident = ident.to_string();
    }

    pub fn uid(&self) -> i32 {
        self.state.lock().uid
    }

    pub fn set_uid(&self, uid: i32) {
        self.state.lock().uid = uid;
    }

    pub fn joined(&self) -> bool {
        self.uid() != uid::UNJOINED
    }

    pub fn cid(&self) -> i32 {
        self.state.lock().cid
    }

    pub fn set_cid(&self, cid: i32) {
        self.state.lock().cid = cid;
    }

    pub fn charname(&self) -> String {
        self.state.lock().charname.clone()
    }

    pub fn set_charname(&self, name: &str) {
        self.state.lock().charname = name.to_string();
    }

    pub fn showname(&self) -> String {
        self.state.lock().showname.clone()
    }

    pub fn set_showname(&self, name: &str) {
        self.state.lock().showname = name.to_string();
    }

    pub fn username(&self) -> String {
        self.state.lock().username.clone()
    }

    pub fn set_username(&self, name: &str) {
        self.state.lock().username = name.to_string();
    }

    pub fn side(&self) -> String {
        self.state.lock().side.clone()
    }

    pub fn set_side(&self, side: &str) {
        self.state.lock().side = side.to_string();
    }

    pub fn room(&self) -> Option<Arc<Room>> {
        self.state.lock().room.clone()
    }

    pub fn set_room(&self, room: Option<Arc<Room>>) {
        self.state.lock().room = room;
    }

    pub fn perms(&self) -> Mask {
        self.state.lock().perms
    }

    pub fn has_perms(&self, p: Mask) -> bool {
        self.perms().contains(p)
    }

    pub fn add_role(&self, role: &Role) {
        let mut st = self.state.lock();
        if !st.roles.iter().any(|r| r.name == role.name) {
            st.roles.push(role.clone());
        }
        st.perms = st.roles.iter().fold(perms::NONE, |m, r| m | r.perms);
    }

    pub fn remove_role(&self, role: &Role) {
        let mut st = self.state.lock();
        st.roles.retain(|r| r.name != role.name);
        st.perms = st.roles.iter().fold(perms::NONE, |m, r| m | r.perms);
    }

    pub fn char_picked(&self) -> bool {
        self.state.lock().char_picked
    }

    pub fn set_char_picked(&self, picked: bool) {
        self.state.lock().char_picked = picked;
    }

    pub fn last_msg(&self) -> String {
        self.state.lock().last_msg.clone()
    }

    pub fn set_last_msg(&self, msg: &str) {
        self.state.lock().last_msg = msg.to_string();
    }

    pub fn pair_data(&self) -> PairData {
        self.state.lock().pair.clone()
    }

    pub fn set_pair_data(&self, pd: PairData) {
        self.state.lock().pair = pd;
    }

    // Mute handling. The current bitmask is recomputed from the timed
    // entries by a per-session ticker once a second.

    pub fn mute_state(&self) -> u8 {
        self.state.lock().mute
    }

    pub fn add_mute(&self, bits: u8, dur_nanos: i64) {
        if dur_nanos <= 0 {
            return;
        }
        let until = Instant::now().checked_add(Duration::from_nanos(dur_nanos as u64));
        let mut st = self.state.lock();
        st.mutes.push(TimedMute { bits, until });
        st.mute |= bits;
    }

    pub fn remove_mute(&self, bits: u8) {
        let mut st = self.state.lock();
        for m in &mut st.mutes {
            m.bits &= !bits;
        }
        st.mutes.retain(|m| m.bits != 0);
        st.mute = st.mutes.iter().fold(0, |acc, m| acc | m.bits);
    }

    fn expire_mutes(&self) {
        let now = Instant::now();
        let mut st = self.state.lock();
        st.mutes.retain(|m| match m.until {
            Some(t) => t > now,
            None => true,
        });
        st.mute = st.mutes.iter().fold(0, |acc, m| acc | m.bits);
    }

    /// Start the once-a-second mute expiry task. Stopped by
    /// [`Client::disconnect`].
    pub fn start_mute_ticker(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.mute_stop.lock() = Some(stop_tx);
        let client = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = tick.tick() => client.expire_mutes(),
                }
            }
        });
    }

    /// Ask the connection to shut down: wakes the read loop, stops the mute
    /// ticker and tells the writer task to close the transport.
    pub fn disconnect(&self) {
        if let Some(stop) = self.mute_stop.lock().take() {
            let _ = stop.send(());
        }
        let _ = self.tx.try_send(Outbound::Close);
        self.closed.notify_one();
    }

    /// Resolved by [`Client::disconnect`]; the read loop selects on this.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    // Outbound packets.

    async fn send(&self, frame: String) {
        trace!(addr = %self.addr, ipid = %self.ipid, frame = %frame, "send");
        let _ = self.tx.send(Outbound::Frame(frame)).await;
    }

    /// Encode and send a legacy frame.
    pub async fn write_ao(&self, header: &str, contents: &[&str]) {
        self.send(scproto::ao::encode(header, contents)).await;
    }

    /// `write_ao` for owned field lists.
    pub async fn write_ao_list(&self, header: &str, contents: &[String]) {
        let refs: Vec<&str> = contents.iter().map(|s| s.as_str()).collect();
        self.write_ao(header, &refs).await;
    }

    /// Encode and send a JSON envelope.
    pub async fn write_sc<T: Serialize>(&self, header: &str, data: &T) {
        match scproto::sc::encode(header, data) {
            Ok(s) => self.send(s).await,
            Err(e) => trace!(addr = %self.addr, err = %e, "sc encode failed"),
        }
    }

    /// An out-of-character chat line. `server` marks server-sourced text.
    pub async fn send_ooc(&self, name: &str, msg: &str, server: bool) {
        match self.kind() {
            ClientKind::Ao => {
                self.write_ao("CT", &[name, msg, if server { "1" } else { "0" }])
                    .await;
            }
            ClientKind::Sc => {
                self.write_sc(
                    "OOC",
                    &scproto::sc::DataOoc {
                        username: name.to_string(),
                        message: msg.to_string(),
                        server,
                    },
                )
                .await;
            }
            ClientKind::Undetermined => {}
        }
    }

    /// A pop-up notification.
    pub async fn notify(&self, msg: &str) {
        if self.kind() == ClientKind::Ao {
            self.write_ao("BB", &[msg]).await;
        }
    }

    /// Tell the client it is being kicked. Does not disconnect by itself.
    pub async fn notify_kick(&self, reason: &str) {
        if self.kind() == ClientKind::Ao {
            self.write_ao("KK", &[reason]).await;
        }
    }

    /// Deliver a mod-call alert.
    pub async fn mod_call(&self, msg: &str) {
        if self.kind() == ClientKind::Ao {
            self.write_ao("ZZ", &[msg]).await;
        }
    }

    /// Try to switch character slots in the current room; confirms with the
    /// `PV` packet when the slot actually changes.
    pub async fn change_char(&self, cid: i32) -> bool {
        let Some(room) = self.room() else {
            return false;
        };
        if !room.change_char(self.uid(), cid) {
            return false;
        }
        if cid == self.cid() {
            return true;
        }
        self.set_cid(cid);
        self.set_charname(&room.name_by_cid(cid));
        if self.kind() == ClientKind::Ao {
            self.write_ao("PV", &["OBSOLETE", "CID", &cid.to_string()])
                .await;
        }
        true
    }

    // Room refresh packets, all derived from the current room.

    pub async fn update_room_list(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            self.write_ao_list("FA", &room.visible_names()).await;
        }
    }

    pub async fn update_music_list(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            self.write_ao_list("FM", &room.music_list()).await;
        }
    }

    pub async fn update_char_list(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            self.write_ao_list("SC", &room.chars()).await;
            self.write_ao_list("CharsCheck", &room.taken_list()).await;
        }
    }

    pub async fn update_background(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            self.write_ao("BN", &[&room.background()]).await;
        }
    }

    pub async fn update_sides(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            self.write_ao("SD", &[&room.sides().join("*")]).await;
        }
    }

    pub async fn update_song(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            let effects = (scproto::ao::EFFECT_FADE_IN | scproto::ao::EFFECT_FADE_OUT).to_string();
            // The room itself plays the track: spectator CID, room name as
            // the showname, channel 0.
            self.write_ao(
                "MC",
                &[
                    &room.song(),
                    &SPECTATOR_CID.to_string(),
                    room.name(),
                    "1",
                    "0",
                    &effects,
                ],
            )
            .await;
        }
    }

    pub async fn update_ambiance(&self) {
        let Some(room) = self.room() else { return };
        if self.kind() == ClientKind::Ao {
            let effects = (scproto::ao::EFFECT_FADE_IN | scproto::ao::EFFECT_FADE_OUT).to_string();
            // Channel 1 is the ambiance channel.
            self.write_ao(
                "MC",
                &[
                    &room.ambiance(),
                    &SPECTATOR_CID.to_string(),
                    room.name(),
                    "1",
                    "1",
                    &effects,
                ],
            )
            .await;
        }
    }

    /// The full refresh sent on join and on room change.
    pub async fn update(&self) {
        self.update_room_list().await;
        self.update_music_list().await;
        self.update_char_list().await;
        self.update_background().await;
        self.update_sides().await;
        self.update_song().await;
        self.update_ambiance().await;
    }

    /// Area summaries for this client's visible rooms, one `ARUP` frame per
    /// selected section.
    pub async fn send_room_update_ao(&self, sections: u8) {
        let Some(room) = self.room() else { return };
        let vis = room.visible();

        if sections & scproto::ao::UPDATE_PLAYER != 0 {
            let players: Vec<String> =
                vis.iter().map(|r| r.player_count().to_string()).collect();
            self.write_ao_list("ARUP#0", &players).await;
        }
        if sections & scproto::ao::UPDATE_STATUS != 0 {
            let statuses: Vec<String> =
                vis.iter().map(|r| r.status_str().to_string()).collect();
            self.write_ao_list("ARUP#1", &statuses).await;
        }
        if sections & scproto::ao::UPDATE_MANAGER != 0 {
            let managers: Vec<String> = vis.iter().map(|_| "FREE".to_string()).collect();
            self.write_ao_list("ARUP#2", &managers).await;
        }
        if sections & scproto::ao::UPDATE_LOCK != 0 {
            let locks: Vec<String> =
                vis.iter().map(|r| r.lock_string().to_string()).collect();
            self.write_ao_list("ARUP#3", &locks).await;
        }
    }

    // Display strings for announcements and listings.

    /// Normal display form.
    pub fn string(&self) -> String {
        let st = self.state.lock();
        let name = if st.charname.is_empty() {
            "Spectator"
        } else {
            &st.charname
        };
        if st.username.is_empty() {
            format!("[{}] {}", st.uid, name)
        } else {
            format!("[{}] {} ({})", st.uid, name, st.username)
        }
    }

    /// Compact form for room announcements.
    pub fn short_string(&self) -> String {
        let st = self.state.lock();
        let name = if st.charname.is_empty() {
            "Spectator"
        } else {
            &st.charname
        };
        format!("[{}] {}", st.uid, name)
    }

    /// Moderator form: includes the identity pair.
    pub fn long_string(&self) -> String {
        let st = self.state.lock();
        let name = if st.charname.is_empty() {
            "Spectator"
        } else {
            &st.charname
        };
        format!(
            "[{}] {} (IPID: {}; HDID: {})",
            st.uid, name, self.ipid, st.ident
        )
    }
}

/// The set of connected clients. Iteration copies a snapshot so callers
/// never hold the registry lock across IO.
#[derive(Debug, Default)]
pub struct ClientList {
    set: Mutex<Vec<Arc<Client>>>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, c: Arc<Client>) {
        self.set.lock().push(c);
    }

    pub fn remove(&self, c: &Arc<Client>) {
        self.set.lock().retain(|x| !Arc::ptr_eq(x, c));
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.set.lock().clone()
    }

    pub fn clients_joined(&self) -> Vec<Arc<Client>> {
        self.set
            .lock()
            .iter()
            .filter(|c| c.joined())
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.set.lock().len()
    }

    pub fn size_joined(&self) -> usize {
        self.set.lock().iter().filter(|c| c.joined()).count()
    }
}
