//! Rooms: locations with a character list, a music list and a broadcast
//! domain. Rooms are created from configuration at startup and live for the
//! whole process.

use std::sync::Arc;

use parking_lot::Mutex;
#[cfg(test)]
use parking_lot::MutexGuard;
use tracing::debug;
use tracing::info;

use crate::config;

/// Clients may join rooms without taking a character slot.
pub const SPECTATOR_CID: i32 = -1;

/// Used internally to represent an invalid user.
const INVALID_UID: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Looking,
    Casing,
    Recess,
    Roleplay,
    Gaming,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "IDLE",
            Status::Looking => "LOOKING-FOR-PLAYERS",
            Status::Casing => "CASING",
            Status::Recess => "RECESS",
            Status::Roleplay => "RP",
            Status::Gaming => "GAMING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Anyone can enter and speak.
    Free,
    /// Anyone can enter, speech is invite-only.
    Spec,
    /// Only invited users can enter.
    Locked,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Free => "FREE",
            LockState::Spec => "SPECTATABLE",
            LockState::Locked => "LOCKED",
        }
    }
}

/// Room event kinds, used for the per-room event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ic,
    Ooc,
    Music,
    Enter,
    Exit,
    Mod,
    Command,
    Fail,
    ServerMsg,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Ic => "ic",
            Event::Ooc => "ooc",
            Event::Music => "music",
            Event::Enter => "enter",
            Event::Exit => "exit",
            Event::Mod => "mod",
            Event::Command => "command",
            Event::Fail => "fail",
            Event::ServerMsg => "server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MusicCategory {
    pub name: String,
    pub songs: Vec<String>,
}

#[derive(Debug, Clone)]
struct CharSlot {
    name: String,
    taken: bool,
}

#[derive(Debug, Clone, Copy)]
struct User {
    cid: i32,
    uid: i32,
}

#[derive(Debug)]
struct Inner {
    desc: String,
    bg: String,
    song: String,
    ambiance: String,
    status: Status,
    lock: LockState,
    chars: Vec<CharSlot>,
    music: Vec<MusicCategory>,
    users: Vec<User>,
    invited: Vec<i32>,
    managers: Vec<i32>,
    adjacent: Vec<Arc<Room>>,
    last_speaker: i32,
}

/// A single location. One mutex guards every mutable field; public methods
/// take the lock, private helpers expect it held.
#[derive(Debug)]
pub struct Room {
    id: usize,
    name: String,
    sides: Vec<String>,
    bg_locked: bool,
    ambiance_locked: bool,
    allow_blankpost: bool,
    allow_shouting: bool,
    allow_iniswap: bool,
    allow_managers: bool,
    force_immediate: bool,
    inner: Mutex<Inner>,
}

/// Create every room from configuration and wire up the adjacency graph.
/// Adjacency is directed: it holds only in the direction declared.
pub fn make_rooms(
    rooms_conf: &config::RoomList,
    chars_conf: &config::Characters,
    music_conf: &config::Music,
) -> anyhow::Result<Vec<Arc<Room>>> {
    if rooms_conf.rooms.is_empty() {
        anyhow::bail!("empty room list");
    }

    let mut rooms: Vec<Arc<Room>> = Vec::with_capacity(rooms_conf.rooms.len());
    for (i, conf) in rooms_conf.rooms.iter().enumerate() {
        let mut chars = Vec::new();
        for list in find_char_lists(chars_conf, &conf.character_lists) {
            for c in &list.characters {
                chars.push(CharSlot {
                    name: c.clone(),
                    taken: false,
                });
            }
        }

        let mut music = Vec::new();
        for cat in find_music_categories(music_conf, &conf.song_categories) {
            music.push(MusicCategory {
                name: cat.name.clone(),
                songs: cat.songs.clone(),
            });
        }

        rooms.push(Arc::new(Room {
            id: i,
            name: conf.name.clone(),
            sides: conf.sides.clone(),
            bg_locked: conf.background_locked,
            ambiance_locked: conf.ambiance_locked,
            allow_blankpost: conf.allow_blankpost,
            allow_shouting: conf.allow_shouting,
            allow_iniswap: conf.allow_iniswap,
            allow_managers: conf.allow_managers,
            force_immediate: conf.force_immediate,
            inner: Mutex::new(Inner {
                desc: conf.description.clone(),
                bg: conf.background.clone(),
                song: scproto::ao::SONG_STOP.to_string(),
                ambiance: if conf.ambiance.is_empty() {
                    scproto::ao::SONG_STOP.to_string()
                } else {
                    conf.ambiance.clone()
                },
                status: Status::Idle,
                lock: LockState::Free,
                chars,
                music,
                users: Vec::new(),
                invited: Vec::new(),
                managers: Vec::new(),
                adjacent: Vec::new(),
                last_speaker: SPECTATOR_CID,
            }),
        }));
    }

    for (i, conf) in rooms_conf.rooms.iter().enumerate() {
        let adj = find_rooms(&rooms, &conf.adjacent_rooms);
        rooms[i].inner.lock().adjacent = adj;
        debug!(room = %rooms[i].name, id = i, "room configured");
    }

    Ok(rooms)
}

fn find_char_lists<'a>(
    conf: &'a config::Characters,
    names: &[String],
) -> Vec<&'a config::CharList> {
    if names.iter().any(|n| n == "all") {
        return conf.lists.iter().collect();
    }
    conf.lists
        .iter()
        .filter(|l| names.iter().any(|n| *n == l.name))
        .collect()
}

fn find_music_categories<'a>(
    conf: &'a config::Music,
    names: &[String],
) -> Vec<&'a config::SongCategory> {
    if names.iter().any(|n| n == "all") {
        return conf.categories.iter().collect();
    }
    conf.categories
        .iter()
        .filter(|c| names.iter().any(|n| *n == c.name))
        .collect()
}

fn find_rooms(list: &[Arc<Room>], names: &[String]) -> Vec<Arc<Room>> {
    if names.iter().any(|n| n == "all") {
        return list.to_vec();
    }
    list.iter()
        .filter(|r| names.iter().any(|n| *n == r.name))
        .cloned()
        .collect()
}

impl Room {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sides(&self) -> &[String] {
        &self.sides
    }

    pub fn allow_blankpost(&self) -> bool {
        self.allow_blankpost
    }

    pub fn allow_shouting(&self) -> bool {
        self.allow_shouting
    }

    pub fn allow_iniswap(&self) -> bool {
        self.allow_iniswap
    }

    pub fn allow_managers(&self) -> bool {
        self.allow_managers
    }

    pub fn force_immediate(&self) -> bool {
        self.force_immediate
    }

    pub fn bg_locked(&self) -> bool {
        self.bg_locked
    }

    pub fn ambiance_locked(&self) -> bool {
        self.ambiance_locked
    }

    /// Enter a user. A spectator always fits; otherwise the slot must exist
    /// and be free. Lock/invite checks are the caller's business.
    pub fn enter(&self, cid: i32, uid: i32) -> bool {
        let mut inner = self.inner.lock();
        if cid != SPECTATOR_CID {
            if cid < 0 || cid as usize >= inner.chars.len() {
                debug!(room = %self.name, uid, cid, "join with out-of-range CID");
                return false;
            }
            if inner.chars[cid as usize].taken {
                debug!(room = %self.name, uid, cid, "join onto taken CID");
                return false;
            }
            inner.chars[cid as usize].taken = true;
        }
        inner.users.push(User { cid, uid });
        debug!(room = %self.name, uid, cid, "user entered");
        true
    }

    /// Remove a user, releasing their slot if they held one.
    pub fn leave(&self, uid: i32) {
        let mut inner = self.inner.lock();
        let Some(u) = inner.users.iter().copied().find(|u| u.uid == uid) else {
            return;
        };
        if u.cid != SPECTATOR_CID {
            inner.chars[u.cid as usize].taken = false;
        }
        inner.users.retain(|u| u.uid != uid);
        inner.invited.retain(|i| *i != uid);
        inner.managers.retain(|m| *m != uid);
        debug!(room = %self.name, uid, cid = u.cid, "user left");
    }

    /// Move a user to another slot. A no-op (still successful) when the
    /// target equals the current slot.
    pub fn change_char(&self, uid: i32, to: i32) -> bool {
        let mut inner = self.inner.lock();
        let from = match inner.users.iter().find(|u| u.uid == uid) {
            Some(u) => u.cid,
            None => {
                debug!(room = %self.name, uid, "char change by unknown UID");
                return false;
            }
        };
        if from == to {
            return true;
        }
        if to != SPECTATOR_CID {
            if to < 0 || to as usize >= inner.chars.len() {
                debug!(room = %self.name, uid, from, to, "change to out-of-range CID");
                return false;
            }
            if inner.chars[to as usize].taken {
                debug!(room = %self.name, uid, from, to, "change to taken CID");
                return false;
            }
            inner.chars[to as usize].taken = true;
        }
        if from != SPECTATOR_CID {
            inner.chars[from as usize].taken = false;
        }
        if let Some(u) = inner.users.iter_mut().find(|u| u.uid == uid) {
            u.cid = to;
        }
        debug!(room = %self.name, uid, from, to, "char changed");
        true
    }

    /// Character name for a CID; "Spectator" is reserved, out-of-range is
    /// the empty string.
    pub fn name_by_cid(&self, cid: i32) -> String {
        if cid == SPECTATOR_CID {
            return "Spectator".to_string();
        }
        let inner = self.inner.lock();
        if cid < 0 || cid as usize >= inner.chars.len() {
            return String::new();
        }
        inner.chars[cid as usize].name.clone()
    }

    pub fn cid_by_name(&self, name: &str) -> Option<i32> {
        if name == "Spectator" {
            return Some(SPECTATOR_CID);
        }
        let inner = self.inner.lock();
        inner
            .chars
            .iter()
            .position(|c| c.name == name)
            .map(|i| i as i32)
    }

    pub fn cid_of_uid(&self, uid: i32) -> i32 {
        let inner = self.inner.lock();
        inner
            .users
            .iter()
            .find(|u| u.uid == uid)
            .map(|u| u.cid)
            .unwrap_or(SPECTATOR_CID)
    }

    pub fn desc(&self) -> String {
        self.inner.lock().desc.clone()
    }

    pub fn set_desc(&self, desc: &str) {
        self.inner.lock().desc = desc.to_string();
    }

    pub fn background(&self) -> String {
        self.inner.lock().bg.clone()
    }

    pub fn set_background(&self, bg: &str) {
        self.inner.lock().bg = bg.to_string();
    }

    pub fn song(&self) -> String {
        self.inner.lock().song.clone()
    }

    pub fn set_song(&self, song: &str) {
        self.inner.lock().song = song.to_string();
    }

    pub fn ambiance(&self) -> String {
        self.inner.lock().ambiance.clone()
    }

    pub fn set_ambiance(&self, track: &str) {
        self.inner.lock().ambiance = track.to_string();
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    pub fn status_str(&self) -> &'static str {
        self.inner.lock().status.as_str()
    }

    pub fn set_status(&self, s: Status) {
        self.inner.lock().status = s;
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.lock().lock
    }

    pub fn lock_string(&self) -> &'static str {
        self.inner.lock().lock.as_str()
    }

    pub fn set_lock_state(&self, s: LockState) {
        self.inner.lock().lock = s;
    }

    pub fn last_speaker(&self) -> i32 {
        self.inner.lock().last_speaker
    }

    pub fn set_last_speaker(&self, cid: i32) {
        self.inner.lock().last_speaker = cid;
    }

    /// Adjacent rooms, as declared (directed).
    pub fn adjacent(&self) -> Vec<Arc<Room>> {
        self.inner.lock().adjacent.clone()
    }

    /// Visible rooms: this room first, then the adjacency list in
    /// declaration order.
    pub fn visible(self: &Arc<Self>) -> Vec<Arc<Room>> {
        let mut vis = vec![self.clone()];
        vis.extend(self.adjacent());
        vis
    }

    pub fn visible_names(self: &Arc<Self>) -> Vec<String> {
        self.visible().iter().map(|r| r.name.clone()).collect()
    }

    pub fn uids(&self) -> Vec<i32> {
        self.inner.lock().users.iter().map(|u| u.uid).collect()
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().users.len()
    }

    pub fn chars(&self) -> Vec<String> {
        self.inner
            .lock()
            .chars
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn chars_len(&self) -> usize {
        self.inner.lock().chars.len()
    }

    pub fn taken(&self) -> Vec<bool> {
        self.inner.lock().chars.iter().map(|c| c.taken).collect()
    }

    /// Taken flags in the wire form the legacy CharsCheck packet wants:
    /// "-1" for taken, "0" for free.
    pub fn taken_list(&self) -> Vec<String> {
        self.inner
            .lock()
            .chars
            .iter()
            .map(|c| if c.taken { "-1" } else { "0" }.to_string())
            .collect()
    }

    /// The flattened music list: each category name followed by its songs,
    /// in declaration order. This interleaving is the wire contract.
    pub fn music_list(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut list = Vec::new();
        for cat in &inner.music {
            list.push(cat.name.clone());
            for s in &cat.songs {
                list.push(s.clone());
            }
        }
        list
    }

    pub fn music(&self) -> Vec<MusicCategory> {
        self.inner.lock().music.clone()
    }

    pub fn music_len(&self) -> usize {
        self.inner.lock().music.iter().map(|c| c.songs.len()).sum()
    }

    pub fn is_invited(&self, uid: i32) -> bool {
        self.inner.lock().invited.contains(&uid)
    }

    pub fn invite(&self, uid: i32) {
        let mut inner = self.inner.lock();
        if !inner.invited.contains(&uid) {
            inner.invited.push(uid);
        }
    }

    pub fn uninvite(&self, uid: i32) {
        self.inner.lock().invited.retain(|i| *i != uid);
    }

    pub fn clear_invites(&self) {
        self.inner.lock().invited.clear();
    }

    pub fn invited(&self) -> Vec<i32> {
        self.inner.lock().invited.clone()
    }

    pub fn is_manager(&self, uid: i32) -> bool {
        self.inner.lock().managers.contains(&uid)
    }

    pub fn add_manager(&self, uid: i32) {
        let mut inner = self.inner.lock();
        if !inner.managers.contains(&uid) {
            inner.managers.push(uid);
        }
    }

    pub fn remove_manager(&self, uid: i32) {
        self.inner.lock().managers.retain(|m| *m != uid);
    }

    pub fn managers(&self) -> Vec<i32> {
        self.inner.lock().managers.clone()
    }

    /// One line in the room's event log.
    pub fn log_event(&self, kind: Event, msg: &str) {
        info!(
            target: "room",
            room = %self.name,
            id = self.id,
            kind = kind.as_str(),
            "{msg}"
        );
    }

    #[cfg(test)]
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }
}
