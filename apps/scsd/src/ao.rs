//! The legacy (AO) protocol dispatcher.
//!
//! Every known header carries an arity range and a joined-state requirement;
//! packets failing either are logged and dropped, unknown headers are
//! ignored for forward compatibility.

use std::sync::Arc;

use chrono::TimeZone;
use chrono::Utc;
use scproto::ao::PacketAo;
use tracing::info;
use tracing::warn;

use crate::client;
use crate::client::Client;
use crate::perms;
use crate::room;
use crate::room::Event;
use crate::room::SPECTATOR_CID;
use crate::server::Server;

struct HandlerSpec {
    min_args: usize,
    max_args: usize,
    needs_joined: bool,
}

// Some older clients send an extra empty trailing argument on packets that
// should have none; the zero-argument packets tolerate one.
fn handler_spec(header: &str) -> Option<HandlerSpec> {
    let (min_args, max_args, needs_joined) = match header {
        "HI" => (1, 1, false),
        "ID" => (2, 2, false),
        "askchaa" => (0, 1, false),
        "RC" => (0, 1, false),
        "RM" => (0, 1, false),
        "RD" => (0, 1, false),
        "CC" => (3, 3, true),
        "CT" => (2, 2, true),
        "MC" => (2, 4, true),
        "CH" => (1, 1, true),
        "MS" => (15, 26, true),
        "ZZ" => (1, 1, true),
        _ => return None,
    };
    Some(HandlerSpec {
        min_args,
        max_args,
        needs_joined,
    })
}

/// The UnixDate form ban replies embed.
pub fn format_unix_date(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(t) => t.format("%a %b %e %H:%M:%S UTC %Y").to_string(),
        None => format!("@{secs}"),
    }
}

impl Server {
    pub async fn handle_packet_ao(&self, c: &Arc<Client>, pkt: PacketAo) {
        let Some(handler) = handler_spec(pkt.header.as_str()) else {
            return;
        };
        let n = pkt.contents.len();
        if n < handler.min_args || n > handler.max_args {
            info!(
                header = %pkt.header,
                args = n,
                addr = %c.addr(),
                ipid = %c.ipid(),
                "bad packet arity"
            );
            return;
        }
        if handler.needs_joined && !c.joined() {
            info!(
                header = %pkt.header,
                addr = %c.addr(),
                ipid = %c.ipid(),
                "packet before joining"
            );
            return;
        }

        match pkt.header.as_str() {
            "HI" => self.handle_hi(c, &pkt.contents).await,
            "ID" => {} // clients echo their software; nothing to do
            "askchaa" => self.handle_ask_counts(c).await,
            "RC" => self.handle_request_chars(c).await,
            "RM" => self.handle_request_music(c).await,
            "RD" => self.handle_done(c).await,
            "CC" => self.handle_change_chars(c, &pkt.contents).await,
            "CT" => self.handle_ooc(c, &pkt.contents).await,
            "MC" => self.handle_music_area(c, &pkt.contents).await,
            "CH" => c.write_ao("CHECK", &[]).await,
            "MS" => self.handle_ic(c, &pkt.contents).await,
            "ZZ" => self.handle_mod_call(c, &pkt.contents).await,
            _ => {}
        }
    }

    async fn handle_hi(&self, c: &Arc<Client>, contents: &[String]) {
        c.set_ident(&contents[0]);
        c.write_ao("ID", &["scs", "0"]).await;
        c.write_ao(
            "PN",
            &[
                &self.clients.size_joined().to_string(),
                &self.config.max_players.to_string(),
            ],
        )
        .await;

        c.write_ao(
            "FL",
            &[
                "yellowtext",
                "flipping",
                "customobjections",
                "fastloading",
                "noencryption",
                "deskmod",
                "cccc_ic_support",
                "arup",
                "modcall_reason",
                "looping_sfx",
                "additive",
                "effects",
                "y_offset",
                "expanded_desk_mods",
                "auth_packet",
            ],
        )
        .await;

        if !self.config.asset_url.is_empty() {
            c.write_ao("ASS", &[&self.config.asset_url]).await;
        }
    }

    async fn handle_ask_counts(&self, c: &Arc<Client>) {
        let (banned, bans) = match self.db.check_banned(c.ipid(), &c.ident()) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "ban check failed");
                (false, Vec::new())
            }
        };
        if banned {
            let mut reasons = String::new();
            for ban in &bans {
                reasons.push_str(&format!(
                    "{}. (until: {})\n",
                    ban.reason,
                    format_unix_date(ban.end)
                ));
            }
            c.write_ao("BD", &[&reasons]).await;
            info!(ipid = %c.ipid(), "banned client rejected");
            self.remove_client(c).await;
            return;
        }

        if self.clients.size_joined() >= self.config.max_players as usize {
            c.notify("The server is full.").await;
            info!(ipid = %c.ipid(), "rejected join: server full");
            self.remove_client(c).await;
            return;
        }

        c.write_ao(
            "SI",
            &[
                &self.rooms[0].chars_len().to_string(),
                "0",
                &self.rooms[0].music_len().to_string(),
            ],
        )
        .await;
    }

    async fn handle_request_chars(&self, c: &Arc<Client>) {
        c.write_ao_list("SC", &self.rooms[0].chars()).await;
        c.write_ao_list("CharsCheck", &self.rooms[0].taken_list())
            .await;
    }

    async fn handle_request_music(&self, c: &Arc<Client>) {
        // Areas precede songs; the legacy client uses one list for both.
        let mut list = self.rooms[0].visible_names();
        list.extend(self.rooms[0].music_list());
        c.write_ao_list("SM", &list).await;
    }

    async fn handle_done(&self, c: &Arc<Client>) {
        if c.joined() {
            return;
        }
        let Some(uid) = self.uid_heap.take() else {
            c.notify("The server is full.").await;
            self.remove_client(c).await;
            return;
        };
        self.rooms[0].enter(SPECTATOR_CID, uid);
        c.set_uid(uid);
        c.set_cid(SPECTATOR_CID);
        c.set_charname("Spectator");
        c.set_room(Some(self.rooms[0].clone()));
        c.write_ao("DONE", &[]).await;
        info!(uid, ipid = %c.ipid(), "client joined");

        c.update_background().await;
        c.update_sides().await;
        c.update_song().await;
        c.update_ambiance().await;
        self.send_room_update_all_ao(scproto::ao::UPDATE_ALL).await;
    }

    async fn handle_change_chars(&self, c: &Arc<Client>, contents: &[String]) {
        let Ok(cid) = contents[1].parse::<i32>() else {
            return;
        };
        let picked = c.change_char(cid).await;
        let Some(room) = c.room() else {
            return;
        };
        if picked && !c.char_picked() {
            self.send_server_message_to_room(
                &room,
                &format!("{} has joined the server!", c.short_string()),
            )
            .await;
            room.log_event(
                Event::Enter,
                &format!("{} joined the server.", c.long_string()),
            );
            c.set_char_picked(true);
        }
        self.write_to_room_ao(&room, "CharsCheck", &room.taken_list())
            .await;
    }

    async fn handle_ic(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(room) = c.room() else {
            return;
        };
        if c.cid() == SPECTATOR_CID {
            room.log_event(
                Event::Fail,
                &format!("{} tried speaking IC as a Spectator.", c.long_string()),
            );
            self.send_server_message(c, "Spectators cannot speak.").await;
            return;
        }
        if c.mute_state() & client::MUTED_IC != 0 {
            room.log_event(
                Event::Fail,
                &format!("{} tried to speak IC, but was muted.", c.long_string()),
            );
            self.send_server_message(c, "You are IC muted!").await;
            return;
        }
        if room.lock_state() == room::LockState::Spec && !room.is_invited(c.uid()) {
            room.log_event(
                Event::Fail,
                &format!("{} tried to speak IC but was not invited.", c.long_string()),
            );
            self.send_server_message(
                c,
                "This room is in spectatable mode and you are not on the invite list.",
            )
            .await;
            return;
        }

        // The client packet has 15-26 fields; the broadcast has 30, the
        // extras carrying pairing data. The first 17 align; past that the
        // pairing fields shift everything by five.
        let mut resp = vec![String::new(); 30];
        for (i, v) in contents.iter().take(17).enumerate() {
            resp[i] = v.clone();
        }
        if contents.len() >= 19 {
            resp[19] = contents[17].clone(); // self offset
            for (i, v) in contents[18..].iter().enumerate() {
                resp[22 + i] = v.clone();
            }
        }

        // One exit point for every validation failure past the gate checks:
        // tell the offender, log the room event, drop the packet.
        macro_rules! reject {
            ($reason:expr) => {{
                let reason: &str = $reason;
                room.log_event(
                    Event::Fail,
                    &format!("{} sent an invalid IC packet ({reason})", c.long_string()),
                );
                info!(ipid = %c.ipid(), reason, "invalid IC packet");
                self.send_server_message(c, reason).await;
                return;
            }};
        }

        // deskmod ("chat" is the deprecated spelling of 1)
        if resp[0] == "chat" {
            resp[0] = "1".to_string();
        }
        match resp[0].parse::<i32>() {
            Ok(m) if (0..=5).contains(&m) => {}
            _ => reject!("Invalid deskmod."),
        }

        // character file
        let iniswapping = room.name_by_cid(c.cid()) != resp[2];
        if iniswapping && !room.allow_iniswap() {
            reject!("Iniswapping is not allowed in this room!");
        }

        // message
        resp[4] = resp[4].trim().to_string();
        if resp[4].len() > self.config.max_msg_size {
            reject!("Your message is too long!");
        }
        if resp[4].is_empty() && !room.allow_blankpost() {
            reject!("Blankposting is not allowed in this room!");
        }
        if room.last_speaker() == c.cid() && c.last_msg() == resp[4] && !resp[4].is_empty() {
            reject!("You just sent that message! Watch out for lag.");
        }

        // pos; an unknown side falls back instead of failing
        if !room.sides().iter().any(|s| *s == resp[5]) {
            resp[5] = room
                .sides()
                .first()
                .cloned()
                .unwrap_or_else(|| "wit".to_string());
        }

        // emote mod; 4 crashes some clients, remap to 6
        if resp[7] == "4" {
            resp[7] = "6".to_string();
        }
        match resp[7].parse::<i32>() {
            Ok(m) if (0..=6).contains(&m) => {}
            _ => reject!("Invalid emote mod."),
        }

        // char id must be the sender's
        if resp[8] != c.cid().to_string() {
            reject!("Incorrect CID.");
        }

        // shout modifier; custom shouts ride behind '&'
        if !room.allow_shouting() && resp[10] != "0" {
            reject!("Shhh! Shouting is not allowed in this room!");
        }
        match resp[10].split('&').next().unwrap_or("").parse::<i32>() {
            Ok(m) if (0..=4).contains(&m) => {}
            _ => reject!("Invalid shout modifier."),
        }

        // evidence is not wired up yet
        resp[11] = "0".to_string();

        if parse_bool(&resp[12]).is_none() {
            reject!("Invalid flip.");
        }
        if parse_bool(&resp[13]).is_none() {
            reject!("Invalid realization.");
        }

        match resp[14].parse::<i32>() {
            Ok(col) if (0..=11).contains(&col) => {}
            _ => reject!("Invalid text color."),
        }

        // 2.6+ extensions
        resp[15] = resp[15].trim().to_string();
        if resp[15].len() > self.config.max_name_size {
            reject!("Your showname is too long!");
        }

        // pairing wish; resolution happens at the end
        let Ok(other_cid) = resp[16]
            .split('^')
            .next()
            .unwrap_or("")
            .parse::<i32>()
        else {
            reject!("Invalid pair.");
        };

        // self offset; legacy 15-field clients leave it empty
        if resp[19].is_empty() {
            resp[19] = "0".to_string();
        } else {
            for off in resp[19].split('&') {
                if off.parse::<i32>().is_err() {
                    reject!("Invalid self-offset.");
                }
            }
        }

        // non-interrupting preanim ("immediate")
        if resp[22].is_empty() {
            resp[22] = "0".to_string();
        }
        match parse_bool(&resp[22]) {
            None => reject!("Invalid immediate."),
            Some(b) => {
                if b || room.force_immediate() {
                    resp[22] = "1".to_string();
                    // Preanim emote mods collapse to their immediate forms.
                    if resp[7] == "1" || resp[7] == "2" {
                        resp[7] = "0".to_string();
                    } else if resp[7] == "6" {
                        resp[7] = "5".to_string();
                    }
                }
            }
        }

        // 2.8+ extensions
        if resp[23].is_empty() {
            resp[23] = "0".to_string();
        } else if parse_bool(&resp[23]).is_none() {
            reject!("Invalid sfx looping.");
        }
        if resp[24].is_empty() {
            resp[24] = "0".to_string();
        } else if parse_bool(&resp[24]).is_none() {
            reject!("Invalid screenshake.");
        }

        // additive only holds for consecutive messages from the same slot
        if resp[28] == "1" && room.last_speaker() == c.cid() {
            resp[4] = format!(" {}", resp[4]);
        } else {
            resp[28] = "0".to_string();
        }

        c.set_charname(&resp[2]);
        c.set_last_msg(&resp[4]);
        c.set_side(&resp[5]);
        c.set_showname(&resp[15]);
        c.set_pair_data(client::PairData {
            wanted_cid: other_cid,
            last_char: resp[2].clone(),
            last_emote: resp[3].clone(),
            last_offset: resp[19].clone(),
            last_flip: resp[12].clone(),
        });

        // Pairing resolution: mutual wishes with matching sides pair up;
        // anything else blanks the pair fields and nudges the other party.
        let mut paired = false;
        if other_cid != SPECTATOR_CID {
            let other = self
                .get_clients_in_room(&room)
                .into_iter()
                .find(|cl| cl.cid() == other_cid);
            if let Some(other) = other {
                let pd = other.pair_data();
                if pd.wanted_cid == c.cid() && c.side() == other.side() {
                    // resp[16] already carries the pair CID and orientation.
                    resp[17] = pd.last_char;
                    resp[18] = pd.last_emote;
                    resp[20] = pd.last_offset;
                    resp[21] = pd.last_flip;
                    paired = true;
                } else if pd.wanted_cid != c.cid() {
                    self.send_server_message(
                        &other,
                        &format!("{} wants to pair with you!", c.short_string()),
                    )
                    .await;
                } else {
                    self.send_server_message(
                        &other,
                        &format!(
                            "You're not in the same position as your pairing partner! Their pos is '{}'.",
                            c.side()
                        ),
                    )
                    .await;
                    self.send_server_message(
                        c,
                        &format!(
                            "You're not in the same position as your pairing partner! Their pos is '{}'.",
                            other.side()
                        ),
                    )
                    .await;
                }
            }
        }
        if !paired {
            resp[16] = "-1^".to_string();
            resp[17] = String::new();
            resp[18] = "0".to_string();
            resp[20] = "0".to_string();
            resp[21] = "0".to_string();
        }

        room.set_last_speaker(c.cid());
        let name = if c.showname().is_empty() {
            c.charname()
        } else {
            c.showname()
        };
        room.log_event(
            Event::Ic,
            &format!("{}: {} | (from {})", name, resp[4], c.long_string()),
        );
        self.write_to_room_ao(&room, "MS", &resp).await;
    }

    async fn handle_ooc(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(room) = c.room() else {
            return;
        };
        if c.mute_state() & client::MUTED_OOC != 0 {
            room.log_event(
                Event::Fail,
                &format!("{} tried to speak in OOC, but was muted.", c.long_string()),
            );
            self.send_server_message(c, "You are OOC muted!").await;
            return;
        }

        let name = contents[0].trim().to_string();
        let msg = contents[1].trim().to_string();

        macro_rules! reject {
            ($reason:expr) => {{
                let reason: &str = $reason;
                room.log_event(
                    Event::Fail,
                    &format!("{} sent an invalid OOC message ({reason})", c.long_string()),
                );
                self.send_server_message(c, reason).await;
                return;
            }};
        }

        if msg.is_empty() {
            reject!("Cannot send blank OOC message.");
        }
        if msg.len() > self.config.max_msg_size {
            reject!("Your message is too long!");
        }
        if name.is_empty() {
            reject!("Set a username to send OOC messages!");
        }
        if name.len() > self.config.max_name_size {
            reject!("Your username is too long!");
        }
        for cl in self.clients.clients() {
            if !Arc::ptr_eq(&cl, c) && cl.username() == name {
                reject!(&format!("Username '{name}' is already in use in the server."));
            }
        }

        c.set_username(&name);

        if let Some(stripped) = msg.strip_prefix('/') {
            if stripped.is_empty() {
                return;
            }
            let mut split = stripped.split(' ');
            let cmd = split.next().unwrap_or("");
            let args: Vec<&str> = split.collect();
            self.handle_command(c, cmd, &args).await;
            return;
        }

        self.send_ooc_to_room(&room, &name, &msg, false).await;
        room.log_event(
            Event::Ooc,
            &format!("{}: {} | (from {})", name, msg, c.long_string()),
        );
    }

    async fn handle_music_area(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(room) = c.room() else {
            return;
        };
        // Areas were a hack on top of songs; one packet still serves both.
        if room.visible_names().iter().any(|n| *n == contents[0]) {
            self.handle_area(c, contents).await;
            return;
        }
        if room.music_list().iter().any(|s| *s == contents[0]) {
            self.handle_music(c, contents).await;
        }
    }

    async fn handle_music(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(room) = c.room() else {
            return;
        };
        if c.mute_state() & client::MUTED_MUSIC != 0 {
            room.log_event(
                Event::Fail,
                &format!(
                    "{} tried to play '{}', but was muted.",
                    c.long_string(),
                    contents[0]
                ),
            );
            self.send_server_message(c, "You are muted from playing music.")
                .await;
            return;
        }
        if room.lock_state() == room::LockState::Spec && !room.is_invited(c.uid()) {
            room.log_event(
                Event::Fail,
                &format!(
                    "{} tried to play '{}', but was not invited.",
                    c.long_string(),
                    contents[0]
                ),
            );
            self.send_server_message(c, "You are only allowed to spectate in this area.")
                .await;
            return;
        }

        // A name with no extension is a category header: stop the music.
        let song = if contents[0].contains('.') {
            contents[0].clone()
        } else {
            scproto::ao::SONG_STOP.to_string()
        };

        let mut showname = String::new();
        if contents.len() >= 3 {
            showname = contents[2].trim().to_string();
            c.set_showname(&showname);
        }
        if showname.is_empty() {
            showname = room.name_by_cid(c.cid());
        }

        let effects = if contents.len() >= 4 {
            contents[3].clone()
        } else {
            "0".to_string()
        };

        room.set_song(&song);
        self.write_to_room_ao(
            &room,
            "MC",
            &[
                song.clone(),
                contents[1].clone(),
                showname,
                "1".to_string(),
                "0".to_string(),
                effects,
            ],
        )
        .await;
        if song == scproto::ao::SONG_STOP {
            room.log_event(Event::Music, &format!("{} stopped the music.", c.long_string()));
        } else {
            room.log_event(Event::Music, &format!("{} played {song}.", c.long_string()));
        }
    }

    async fn handle_area(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(dst) = self.get_room_by_name(&contents[0]) else {
            info!(ipid = %c.ipid(), room = %contents[0], "move to nonexistent room");
            return;
        };
        self.move_client(c, &dst).await;
    }

    async fn handle_mod_call(&self, c: &Arc<Client>, contents: &[String]) {
        let Some(room) = c.room() else {
            return;
        };
        room.log_event(
            Event::Mod,
            &format!("Mod called by {}. Reason: {}", c.long_string(), contents[0]),
        );
        let msg = format!(
            "Mod called in [{}] {} by {}. \nReason: {}",
            room.id(),
            room.name(),
            c.long_string(),
            contents[0]
        );
        info!("{msg}");
        for cl in self.clients.clients_joined() {
            if cl.perms().contains(perms::HEAR_MODCALLS) {
                cl.mod_call(&msg).await;
            }
        }
    }
}

/// The permissive boolean grammar of the legacy wire: 1/0, t/f, true/false
/// in the usual casings.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientKind;
    use crate::server::testutil::*;

    fn pkt(header: &str, contents: &[&str]) -> PacketAo {
        PacketAo {
            header: header.to_string(),
            contents: contents.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A minimal valid 26-field IC packet for the given character slot.
    fn ic_fields(cid: i32, charname: &str, msg: &str) -> Vec<String> {
        let mut f = vec![String::new(); 26];
        f[0] = "1".to_string(); // deskmod
        f[1] = "-".to_string(); // preanim
        f[2] = charname.to_string();
        f[3] = "normal".to_string(); // emote
        f[4] = msg.to_string();
        f[5] = "def".to_string();
        f[6] = "1".to_string(); // sfx
        f[7] = "0".to_string(); // emote mod
        f[8] = cid.to_string();
        f[9] = "0".to_string(); // sfx delay
        f[10] = "0".to_string(); // shout
        f[11] = "0".to_string(); // evidence
        f[12] = "0".to_string(); // flip
        f[13] = "0".to_string(); // realization
        f[14] = "0".to_string(); // color
        f[15] = String::new(); // showname
        f[16] = "-1^".to_string(); // pair wish
        f[17] = "0".to_string(); // self offset
        f[18] = "0".to_string(); // immediate
        f[19] = "0".to_string(); // sfx loop
        f[20] = "0".to_string(); // screenshake
        f[21] = String::new(); // frames shake
        f[22] = String::new(); // frames realization
        f[23] = String::new(); // frames sfx
        f[24] = "0".to_string(); // additive
        f[25] = String::new(); // effects
        f
    }

    async fn send_ic(srv: &std::sync::Arc<Server>, c: &std::sync::Arc<Client>, fields: Vec<String>) {
        srv.handle_packet_ao(
            c,
            PacketAo {
                header: "MS".to_string(),
                contents: fields,
            },
        )
        .await;
    }

    #[tokio::test]
    async fn handshake_sequence() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.1");

        srv.handle_packet_ao(&c, pkt("HI", &["hdid-1"])).await;
        let out = frames(&mut rx);
        assert_eq!(out[0], "ID#scs#0#%");
        assert_eq!(out[1], "PN#0#10#%");
        assert!(out[2].starts_with("FL#yellowtext#flipping#"));
        assert!(out[2].contains("#auth_packet#%"));
        assert_eq!(c.ident(), "hdid-1");

        srv.handle_packet_ao(&c, pkt("askchaa", &[])).await;
        let out = frames(&mut rx);
        assert_eq!(out[0], "SI#4#0#2#%");

        srv.handle_packet_ao(&c, pkt("RC", &[])).await;
        let out = frames(&mut rx);
        assert_eq!(out[0], "SC#Phoenix#Edgeworth#Maya#Franziska#%");
        assert_eq!(out[1], "CharsCheck#0#0#0#0#%");

        srv.handle_packet_ao(&c, pkt("RM", &[])).await;
        let out = frames(&mut rx);
        assert_eq!(
            out[0],
            "SM#Courtroom#Lobby#Trial#objection.mp3#pursuit.mp3#%"
        );

        srv.handle_packet_ao(&c, pkt("RD", &[])).await;
        let out = frames(&mut rx);
        assert_eq!(out[0], "DONE#%");
        assert_eq!(c.uid(), 1);
        assert_eq!(c.cid(), SPECTATOR_CID);
        assert!(std::sync::Arc::ptr_eq(&c.room().unwrap(), &srv.rooms[0]));
        assert_eq!(srv.clients.size_joined(), 1);
    }

    #[tokio::test]
    async fn packets_before_joining_are_dropped() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        srv.handle_packet_ao(&c, pkt("CT", &["name", "hi"])).await;
        srv.handle_packet_ao(&c, pkt("CH", &["0"])).await;
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn bad_arity_is_dropped() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &c).await;
        srv.handle_packet_ao(&c, pkt("CT", &["only-name"])).await;
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_headers_are_ignored() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        srv.handle_packet_ao(&c, pkt("WHAT", &["?"])).await;
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn char_take_and_conflict() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (b, mut rxb) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;

        srv.handle_packet_ao(&a, pkt("CC", &["0", "3", "0"])).await;
        assert_eq!(a.cid(), 3);
        assert!(a.char_picked());
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("PV#OBSOLETE#CID#3#%"), "got: {out}");
        assert!(out.contains("CharsCheck#0#0#0#-1#%"), "got: {out}");

        // The same slot is refused for the second client; no state change.
        let _ = frames(&mut rxb);
        srv.handle_packet_ao(&b, pkt("CC", &["0", "3", "0"])).await;
        assert_eq!(b.cid(), SPECTATOR_CID);
        let out = frames(&mut rxb).join("\n");
        assert!(!out.contains("PV#"), "got: {out}");

        // Releasing on disconnect frees the slot.
        srv.remove_client(&a).await;
        assert_eq!(srv.rooms[0].taken_list()[3], "0");
    }

    #[tokio::test]
    async fn banned_client_is_rejected_on_askchaa() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.9");
        srv.handle_packet_ao(&c, pkt("HI", &["H-ban"])).await;
        srv.db
            .add_ban(c.ipid(), "H-ban", "cheating", "mod", 3600)
            .unwrap();
        let _ = frames(&mut rx);

        srv.handle_packet_ao(&c, pkt("askchaa", &[])).await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("BD#cheating. (until: "), "got: {out}");
        assert_eq!(srv.clients.size(), 0, "banned client removed");
    }

    #[tokio::test]
    async fn ic_spectators_cannot_speak() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &c).await;
        send_ic(&srv, &c, ic_fields(SPECTATOR_CID, "Phoenix", "hello")).await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("Spectators cannot speak."), "got: {out}");
        assert!(!out.contains("MS#"), "got: {out}");
    }

    #[tokio::test]
    async fn ic_broadcast_reaches_the_room() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (b, mut rxb) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;
        a.change_char(0).await;
        let _ = (frames(&mut rxa), frames(&mut rxb));

        send_ic(&srv, &a, ic_fields(0, "Phoenix", "Take that!")).await;
        let out_a = frames(&mut rxa).join("\n");
        let out_b = frames(&mut rxb).join("\n");
        assert!(out_a.contains("MS#1#-#Phoenix#normal#Take that!#def#"), "got: {out_a}");
        assert!(out_b.contains("MS#"), "b must hear it too");
        assert_eq!(srv.rooms[0].last_speaker(), 0);
        assert_eq!(a.last_msg(), "Take that!");
    }

    #[tokio::test]
    async fn ic_doublepost_is_rejected() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        send_ic(&srv, &a, ic_fields(0, "Phoenix", "Take that!")).await;
        let _ = frames(&mut rxa);
        send_ic(&srv, &a, ic_fields(0, "Phoenix", "Take that!")).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("You just sent that message!"), "got: {out}");
    }

    #[tokio::test]
    async fn ic_wrong_cid_is_rejected() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        send_ic(&srv, &a, ic_fields(2, "Phoenix", "imposter")).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("Incorrect CID."), "got: {out}");
    }

    #[tokio::test]
    async fn ic_muted_clients_are_gated() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        a.add_mute(client::MUTED_IC, crate::duration::NANOS_PER_SEC * 60);
        let _ = frames(&mut rxa);

        send_ic(&srv, &a, ic_fields(0, "Phoenix", "mmmph")).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("You are IC muted!"), "got: {out}");
    }

    #[tokio::test]
    async fn ic_emote_mod_four_remaps_to_six() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        let mut f = ic_fields(0, "Phoenix", "watch this");
        f[7] = "4".to_string();
        send_ic(&srv, &a, f).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("#normal#watch this#def#1#6#0#"), "got: {out}");
    }

    #[tokio::test]
    async fn ic_pairing_handshake() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (b, mut rxb) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;
        a.change_char(0).await;
        b.change_char(1).await;
        let _ = (frames(&mut rxa), frames(&mut rxb));

        // A wants to pair with CID 1; B has no wish yet.
        let mut f = ic_fields(0, "Phoenix", "partner?");
        f[16] = "1^".to_string();
        send_ic(&srv, &a, f).await;
        let out_a = frames(&mut rxa).join("\n");
        let out_b = frames(&mut rxb).join("\n");
        // Broadcast carries no pair yet.
        assert!(out_a.contains("#-1^##0#"), "got: {out_a}");
        assert!(out_b.contains("wants to pair with you!"), "got: {out_b}");

        // B answers with the matching wish on the same side.
        let mut f = ic_fields(1, "Edgeworth", "partner!");
        f[16] = "0^".to_string();
        send_ic(&srv, &b, f).await;
        let out_b = frames(&mut rxb).join("\n");
        // B's broadcast carries A's stored char/emote/offset/flip.
        assert!(
            out_b.contains("#0^#Phoenix#normal#"),
            "pair fields missing: {out_b}"
        );
    }

    #[tokio::test]
    async fn ic_pair_side_mismatch_notifies_both() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (b, mut rxb) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;
        a.change_char(0).await;
        b.change_char(1).await;
        let _ = (frames(&mut rxa), frames(&mut rxb));

        let mut f = ic_fields(0, "Phoenix", "over here");
        f[16] = "1^".to_string();
        f[5] = "def".to_string();
        send_ic(&srv, &a, f).await;
        let _ = (frames(&mut rxa), frames(&mut rxb));

        let mut f = ic_fields(1, "Edgeworth", "over there");
        f[16] = "0^".to_string();
        f[5] = "pro".to_string();
        send_ic(&srv, &b, f).await;
        let out_a = frames(&mut rxa).join("\n");
        let out_b = frames(&mut rxb).join("\n");
        assert!(out_a.contains("not in the same position"), "got: {out_a}");
        assert!(out_b.contains("not in the same position"), "got: {out_b}");
    }

    #[tokio::test]
    async fn ic_fifteen_field_legacy_packet_is_accepted() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        let f: Vec<String> = ic_fields(0, "Phoenix", "old client")[..15].to_vec();
        send_ic(&srv, &a, f).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("MS#"), "got: {out}");
    }

    #[tokio::test]
    async fn ic_additive_prepends_space_for_last_speaker() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        send_ic(&srv, &a, ic_fields(0, "Phoenix", "first")).await;
        let _ = frames(&mut rxa);
        let mut f = ic_fields(0, "Phoenix", "and second");
        f[24] = "1".to_string(); // additive (client field 24 -> resp 28)
        send_ic(&srv, &a, f).await;
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("# and second#"), "got: {out}");
    }

    #[tokio::test]
    async fn ooc_round_trip_and_username_conflict() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (b, mut rxb) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;

        srv.handle_packet_ao(&a, pkt("CT", &["alice", "hello all"])).await;
        assert_eq!(a.username(), "alice");
        let out_b = frames(&mut rxb).join("\n");
        assert!(out_b.contains("CT#alice#hello all#0#%"), "got: {out_b}");

        let _ = frames(&mut rxa);
        srv.handle_packet_ao(&b, pkt("CT", &["alice", "me too"])).await;
        let out_b = frames(&mut rxb).join("\n");
        assert!(out_b.contains("already in use"), "got: {out_b}");
        assert_eq!(b.username(), "");
    }

    #[tokio::test]
    async fn mc_plays_songs_and_stops_on_categories() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        srv.handle_packet_ao(&a, pkt("MC", &["objection.mp3", "0"])).await;
        assert_eq!(srv.rooms[0].song(), "objection.mp3");
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("MC#objection.mp3#0#Phoenix#1#0#0#%"), "got: {out}");

        // A category name has no dot: canonical stop track.
        srv.handle_packet_ao(&a, pkt("MC", &["Trial", "0"])).await;
        assert_eq!(srv.rooms[0].song(), scproto::ao::SONG_STOP);
    }

    #[tokio::test]
    async fn mc_switches_areas_by_name() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        join(&srv, &a).await;
        a.change_char(0).await;
        let _ = frames(&mut rxa);

        srv.handle_packet_ao(&a, pkt("MC", &["Lobby", "0"])).await;
        assert!(std::sync::Arc::ptr_eq(&a.room().unwrap(), &srv.rooms[1]));
    }

    #[tokio::test]
    async fn modcall_reaches_only_guards() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.1.0.1");
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.1.0.2");
        join(&srv, &a).await;
        join(&srv, &m).await;
        let moderator = srv.roles.iter().find(|r| r.name == "Moderator").unwrap().clone();
        m.add_role(&moderator);
        let _ = (frames(&mut rxa), frames(&mut rxm));

        srv.handle_packet_ao(&a, pkt("ZZ", &["spam in ic"])).await;
        let out_m = frames(&mut rxm).join("\n");
        let out_a = frames(&mut rxa).join("\n");
        assert!(out_m.contains("ZZ#Mod called in [0] Courtroom"), "got: {out_m}");
        assert!(out_m.contains("spam in ic"));
        assert!(!out_a.contains("ZZ#"), "non-guard must not hear it");
    }

    #[test]
    fn bool_grammar() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool(""), None);
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn unix_date_format_matches_ban_replies() {
        assert_eq!(format_unix_date(0), "Thu Jan  1 00:00:00 UTC 1970");
    }
}
