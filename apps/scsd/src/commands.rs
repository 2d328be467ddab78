//! OOC text commands.
//!
//! Commands arrive as OOC messages starting with `/`. Each entry declares a
//! minimum argument count and the permissions it needs; the dispatcher
//! enforces both and reports usage lines on failure.

use std::sync::Arc;

use tracing::warn;

use crate::ao::format_unix_date;
use crate::client;
use crate::client::Client;
use crate::duration;
use crate::perms;
use crate::room::Event;
use crate::server::Server;

const NO_REASON: &str = "No reason given.";

struct CmdSpec {
    name: &'static str,
    min_args: usize,
    req_perms: perms::Mask,
    usage: &'static str,
    detailed: &'static str,
}

static COMMANDS: &[CmdSpec] = &[
    CmdSpec {
        name: "help",
        min_args: 0,
        req_perms: perms::NONE,
        usage: "/help [command]",
        detailed: "Shows detailed usage of a command, or the list of commands if no command is passed.",
    },
    CmdSpec {
        name: "login",
        min_args: 2,
        req_perms: perms::NONE,
        usage: "/login <username> <password>",
        detailed: "Attempts to authenticate with the passed username and password.",
    },
    CmdSpec {
        name: "mute",
        min_args: 2,
        req_perms: perms::MUTE,
        usage: "/mute <uid> <duration> [reason...]\n\
                /mute <'ic'|'ooc'|'jud'|'music'|'all'> <uid> <duration> [reason...]\n\
                /mute <'cid'|'uid'|'ipid'> <id> <duration> [reason...]\n\
                /mute <'ic'|'ooc'|'jud'|'music'|'all'> <'cid'|'uid'|'ipid'> <id> <duration> [reason...]",
        detailed: "Mutes a user for the specified duration with an optional reason. Mutes user in all of IC/OOC/judge/music unless otherwise specified. Mutes by UID unless otherwise specified. Duration should be in a format like '2h30m' or '3d12h'. Note: if muting by IPID, all clients with that IPID will be muted.",
    },
    CmdSpec {
        name: "unmute",
        min_args: 1,
        req_perms: perms::MUTE,
        usage: "/unmute <uid>\n\
                /unmute <'ic'|'ooc'|'jud'|'music'|'all'> <uid>\n\
                /unmute <'cid'|'uid'|'ipid'> <id>\n\
                /unmute <'ic'|'ooc'|'jud'|'music'|'all'> <'cid'|'uid'|'ipid'> <id>",
        detailed: "Removes a mute from a user. Clears all of IC/OOC/judge/music unless otherwise specified. Targets by UID unless otherwise specified.",
    },
    CmdSpec {
        name: "kick",
        min_args: 1,
        req_perms: perms::KICK,
        usage: "/kick <uid> [reason...]\n/kick <'cid'|'uid'|'ipid'> <id> [reason...]",
        detailed: "Kicks a user with an optional reason. Kicks by UID unless otherwise specified. Note: if kicking by IPID, all clients with that IPID will be kicked.",
    },
    CmdSpec {
        name: "ban",
        min_args: 3,
        req_perms: perms::BAN,
        usage: "/ban <ipid> <duration> <reason...>\n/ban <'cid'|'uid'|'ipid'> <id> <duration> <reason...>",
        detailed: "Bans a user for the specified duration. Reason is required. Bans by UID unless otherwise specified. Duration should be in a format like '2h30m' or '3d12h'. Duration can be 'perma' for permanent ban.",
    },
    CmdSpec {
        name: "unban",
        min_args: 1,
        req_perms: perms::UNBAN,
        usage: "/unban <ban id>",
        detailed: "Lifts the ban with the given id, recording who lifted it.",
    },
    CmdSpec {
        name: "get",
        min_args: 1,
        req_perms: perms::NONE,
        usage: "/get <'room'|'rooms'|'allrooms'>",
        detailed: "Gets a list of users in a room or set of rooms. Use:\n\
                   \"/get room\" to get a list of users in the same room as you;\n\
                   \"/get rooms\" to get a list of users in the rooms that you can see;\n\
                   \"/get allrooms\" to get a list of all users in the server.",
    },
    CmdSpec {
        name: "manage",
        min_args: 0,
        req_perms: perms::NONE,
        usage: "/manage [uids...]\n/manage <'cid'|'uid'> <ids...>",
        detailed: "Promotes to manager (if allowed). If already promoted, user can promote others. Will use UID to promote others unless otherwise specified.",
    },
    CmdSpec {
        name: "unmanage",
        min_args: 0,
        req_perms: perms::NONE,
        usage: "/unmanage [uids...]\n/unmanage <'cid'|'uid'> <ids...>",
        detailed: "Demotes user from manager. Only managers can use this command. Will use UID to demote others unless otherwise specified.",
    },
    CmdSpec {
        name: "invite",
        min_args: 1,
        req_perms: perms::LOCK,
        usage: "/invite <uids...>\n/invite <'cid'|'uid'> <ids...>",
        detailed: "Adds users to the room's invite list, letting them enter a locked room or speak in a spectatable one.",
    },
    CmdSpec {
        name: "uninvite",
        min_args: 1,
        req_perms: perms::LOCK,
        usage: "/uninvite <uids...>\n/uninvite <'cid'|'uid'> <ids...>",
        detailed: "Removes users from the room's invite list.",
    },
    CmdSpec {
        name: "bg",
        min_args: 1,
        req_perms: perms::BACKGROUND,
        usage: "/bg <background...>",
        detailed: "Changes the room's background.",
    },
];

fn cmd_spec(name: &str) -> Option<&'static CmdSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// How a command picks its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetType {
    Default,
    Cid,
    Uid,
    Ipid,
}

fn parse_target(s: &str) -> TargetType {
    match s.to_ascii_lowercase().as_str() {
        "cid" => TargetType::Cid,
        "uid" => TargetType::Uid,
        "ipid" => TargetType::Ipid,
        _ => TargetType::Default,
    }
}

impl Server {
    pub async fn handle_command(&self, c: &Arc<Client>, name: &str, args: &[&str]) {
        let joined_args = args.join(" ");
        let room = c.room();
        let Some(cmd) = cmd_spec(name) else {
            self.send_server_message(
                c,
                &format!("'/{name}' is an unknown command. Use /help to see a list of commands."),
            )
            .await;
            if let Some(room) = &room {
                room.log_event(
                    Event::Fail,
                    &format!(
                        "{} tried running unknown command '/{name} {joined_args}'.",
                        c.long_string()
                    ),
                );
            }
            return;
        };
        if args.len() < cmd.min_args {
            self.send_server_message(
                c,
                &format!("Not enough arguments for /{name}.\nUsages of /{name}:\n{}", cmd.usage),
            )
            .await;
            return;
        }
        if !c.has_perms(cmd.req_perms) {
            self.send_server_message(
                c,
                &format!("You do not have the required permissions to use /{name}."),
            )
            .await;
            if let Some(room) = &room {
                room.log_event(
                    Event::Fail,
                    &format!(
                        "{} tried running command '/{name} {joined_args}' but did not have permission.",
                        c.long_string()
                    ),
                );
            }
            return;
        }

        let (msg, success, send_usage) = match name {
            "help" => self.cmd_help(c, args).await,
            "login" => self.cmd_login(c, args).await,
            "mute" => self.cmd_mute(c, args).await,
            "unmute" => self.cmd_unmute(c, args).await,
            "kick" => self.cmd_kick(c, args).await,
            "ban" => self.cmd_ban(c, args).await,
            "unban" => self.cmd_unban(c, args).await,
            "get" => self.cmd_get(c, args).await,
            "manage" => self.cmd_manage(c, args).await,
            "unmanage" => self.cmd_unmanage(c, args).await,
            "invite" => self.cmd_invite(c, args).await,
            "uninvite" => self.cmd_uninvite(c, args).await,
            "bg" => self.cmd_background(c, args).await,
            _ => (String::new(), false, false),
        };

        if let Some(room) = &room {
            if success {
                room.log_event(
                    Event::Command,
                    &format!("{} ran command '/{name} {joined_args}'.", c.long_string()),
                );
            } else {
                room.log_event(
                    Event::Fail,
                    &format!(
                        "{} tried to run command '/{name} {joined_args}' but failed ({msg})",
                        c.long_string()
                    ),
                );
            }
        }

        let mut reply = String::new();
        if !msg.is_empty() {
            reply.push_str(name);
            reply.push_str(": ");
            reply.push_str(&msg);
        }
        if send_usage {
            if !reply.is_empty() {
                reply.push('\n');
            }
            reply.push_str(&format!("Usages of /{name}:\n{}", cmd.usage));
        }
        if !reply.is_empty() {
            self.send_server_message(c, &reply).await;
        }
    }

    async fn cmd_help(&self, _c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        if args.is_empty() {
            let list = COMMANDS
                .iter()
                .map(|c| format!("/{}", c.name))
                .collect::<Vec<_>>()
                .join(", ");
            return (format!("Available commands:\n{list}"), true, false);
        }
        let Some(cmd) = cmd_spec(args[0]) else {
            return (format!("'{}' is not a valid command.", args[0]), false, false);
        };
        (
            format!(
                "Usage of /{}:\n{}\nDetails: {}",
                args[0], cmd.usage, cmd.detailed
            ),
            true,
            false,
        )
    }

    async fn cmd_login(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let (ok, role_name) = match self.db.check_auth(args[0], args[1]) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "authentication error");
                return ("Couldn't authenticate: internal error.".to_string(), false, false);
            }
        };
        if !ok {
            return (
                "Incorrect password, or user doesn't exist.".to_string(),
                false,
                false,
            );
        }
        let Some(role) = self.roles.iter().find(|r| r.name == role_name) else {
            return (
                format!("Was able to authenticate, but role '{role_name}' doesn't exist."),
                false,
                false,
            );
        };
        c.add_role(role);
        if role.perms.contains(perms::HEAR_MODCALLS) {
            // Guard hint: unlocks the moderator UI on newer clients.
            c.write_ao("AUTH", &["1"]).await;
        }
        (
            format!(
                "Successfully authenticated as user '{}' and role '{}'.",
                args[0], role_name
            ),
            true,
            false,
        )
    }

    async fn cmd_mute(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let mut args = args;

        // An optional leading domain narrows the mute.
        let (bits, from) = match args[0].to_ascii_lowercase().as_str() {
            "ic" => {
                args = &args[1..];
                (client::MUTED_IC, " from IC chat")
            }
            "ooc" => {
                args = &args[1..];
                (client::MUTED_OOC, " from OOC chat")
            }
            "jud" => {
                args = &args[1..];
                (client::MUTED_JUDGE, " from using judge commands")
            }
            "music" => {
                args = &args[1..];
                (client::MUTED_MUSIC, " from playing music")
            }
            "all" => {
                args = &args[1..];
                (client::MUTED_ALL, "")
            }
            _ => (client::MUTED_ALL, ""),
        };

        let mut t = parse_target(args.first().copied().unwrap_or(""));
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }

        if args.len() < 2 {
            return ("Not enough arguments.".to_string(), false, true);
        }
        let dur = match duration::parse(args[1]) {
            Ok(d) => d,
            Err(e) => {
                return (
                    format!("'{}' is not a valid duration: {e}.", args[1]),
                    false,
                    true,
                )
            }
        };
        let reason = if args.len() < 3 {
            NO_REASON.to_string()
        } else {
            args[2..].join(" ")
        };

        let targets = match self.get_targets(c, t, &args[0..1]) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut msg = String::new();
        let mut muted = Vec::new();
        for cl in &targets {
            // No acting on peers or superiors.
            if c.perms().subset_of(cl.perms()) {
                msg.push_str(&format!(
                    "Can't mute {}, they have the same privileges as you, or more.\n",
                    cl.short_string()
                ));
                continue;
            }

            cl.add_mute(bits, dur);
            self.send_server_message(
                cl,
                &format!("You have been muted{from} for {} for: {reason}", args[1]),
            )
            .await;

            if let Err(e) = self.db.add_mute(
                cl.ipid(),
                &cl.ident(),
                &reason,
                &c.username(),
                bits,
                duration::to_secs(dur),
            ) {
                warn!(err = %e, "couldn't record mute");
            }
            muted.push(cl.short_string());
        }

        if muted.is_empty() {
            msg.push_str("Couldn't mute any client.");
            return (msg, false, false);
        }
        msg.push_str(&format!(
            "Successfully muted {}{from} for {}.",
            muted.join(", "),
            args[1]
        ));
        (msg, true, false)
    }

    async fn cmd_unmute(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let mut args = args;

        let (bits, from) = match args[0].to_ascii_lowercase().as_str() {
            "ic" => {
                args = &args[1..];
                (client::MUTED_IC, " from IC chat")
            }
            "ooc" => {
                args = &args[1..];
                (client::MUTED_OOC, " from OOC chat")
            }
            "jud" => {
                args = &args[1..];
                (client::MUTED_JUDGE, " from using judge commands")
            }
            "music" => {
                args = &args[1..];
                (client::MUTED_MUSIC, " from playing music")
            }
            "all" => {
                args = &args[1..];
                (client::MUTED_ALL, "")
            }
            _ => (client::MUTED_ALL, ""),
        };

        let mut t = parse_target(args.first().copied().unwrap_or(""));
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if args.is_empty() {
            return ("Not enough arguments.".to_string(), false, true);
        }

        let targets = match self.get_targets(c, t, &args[0..1]) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut unmuted = Vec::new();
        for cl in &targets {
            cl.remove_mute(bits);
            self.send_server_message(cl, &format!("You have been unmuted{from}."))
                .await;
            unmuted.push(cl.short_string());
        }
        (
            format!("Successfully unmuted {}{from}.", unmuted.join(", ")),
            true,
            false,
        )
    }

    async fn cmd_kick(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if args.is_empty() {
            return ("Not enough arguments.".to_string(), false, true);
        }

        let reason = if args.len() < 2 {
            NO_REASON.to_string()
        } else {
            args[1..].join(" ")
        };

        let targets = match self.get_targets(c, t, &args[0..1]) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut msg = String::new();
        let mut kicked = Vec::new();
        for cl in &targets {
            if c.perms().subset_of(cl.perms()) {
                msg.push_str(&format!(
                    "Can't kick {}, they have the same privileges as you, or more.\n",
                    cl.short_string()
                ));
                continue;
            }

            let short = cl.short_string();
            self.kick_client(cl, &reason).await;
            if let Err(e) = self.db.add_kick(cl.ipid(), &cl.ident(), &reason, &c.username()) {
                warn!(err = %e, "couldn't record kick");
            }
            kicked.push(short);
        }

        if kicked.is_empty() {
            msg.push_str("Couldn't kick any client.");
            return (msg, false, false);
        }
        msg.push_str(&format!(
            "Successfully kicked {} for reason: {reason}.",
            kicked.join(", ")
        ));
        (msg, true, false)
    }

    async fn cmd_ban(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if args.len() < 3 {
            return ("Not enough arguments.".to_string(), false, true);
        }

        let dur = if args[1] == "perma" {
            i64::MAX
        } else {
            match duration::parse(args[1]) {
                Ok(d) => d,
                Err(e) => {
                    return (
                        format!("'{}' is not a valid duration: {e}.", args[1]),
                        false,
                        false,
                    )
                }
            }
        };
        let reason = args[2..].join(" ");

        let targets = match self.get_targets(c, t, &args[0..1]) {
            Ok(t) => t,
            Err(e) => {
                if t != TargetType::Ipid {
                    return (e, false, false);
                }
                // Nobody online with that IPID: record the ban anyway.
                let ipid = args[0];
                if let Err(e) = self.db.add_ban(
                    ipid,
                    "",
                    &reason,
                    &c.username(),
                    duration::to_secs(dur),
                ) {
                    warn!(err = %e, "couldn't record ban");
                    return ("Database error. Warn the host!".to_string(), false, false);
                }
                return (
                    format!(
                        "No clients currently online with IPID {ipid}. Adding a ban record for this IPID.\nSuccessfully banned IPID {ipid}."
                    ),
                    true,
                    false,
                );
            }
        };
        let ipid = targets[0].ipid().to_string();

        let end = now_unix().saturating_add(duration::to_secs(dur));
        let ban_msg = format!(
            "You have been banned. Reason: {reason} (until {})",
            format_unix_date(end)
        );

        let mut msg = String::new();
        let mut banned = Vec::new();
        let mut hdids: Vec<String> = Vec::new();
        for cl in &targets {
            if c.perms().subset_of(cl.perms()) {
                msg.push_str(&format!(
                    "Can't ban {}, they have the same privileges as you, or more.\n",
                    cl.short_string()
                ));
                continue;
            }

            // One ban record per distinct hardware id.
            let hdid = cl.ident();
            if !hdids.contains(&hdid) {
                hdids.push(hdid);
            }

            let short = cl.short_string();
            self.kick_client(cl, &ban_msg).await;
            banned.push(short);
        }

        if banned.is_empty() {
            msg.push_str("Couldn't ban any client.");
            return (msg, false, false);
        }

        for hdid in &hdids {
            if let Err(e) = self.db.add_ban(
                &ipid,
                hdid,
                &reason,
                &c.username(),
                duration::to_secs(dur),
            ) {
                warn!(err = %e, "couldn't record ban");
                msg.push_str("Database error. Warn the host!");
                return (msg, false, false);
            }
        }

        msg.push_str(&format!(
            "Successfully banned {} for {} for reason: {reason}.",
            banned.join(", "),
            duration::format(dur)
        ));
        (msg, true, false)
    }

    async fn cmd_unban(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Ok(id) = args[0].parse::<i64>() else {
            return (format!("'{}' is not a valid ban id.", args[0]), false, true);
        };
        match self.db.null_ban(id, &c.username()) {
            Ok(()) => (format!("Ban {id} lifted."), true, false),
            Err(e) => (format!("Couldn't lift ban {id}: {e}."), false, false),
        }
    }

    async fn cmd_get(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        let see_ipids = c.has_perms(perms::SEE_IPIDS);
        let list_room = |r: &Arc<crate::room::Room>| {
            let mut msg = format!("\n>>> [{}] {}: <<<", r.id(), r.name());
            for cl in self.get_clients_in_room(r) {
                msg.push('\n');
                if see_ipids {
                    msg.push_str(&cl.long_string());
                } else {
                    msg.push_str(&cl.string());
                }
            }
            msg
        };

        match args[0] {
            "room" => (list_room(&room), true, false),
            "rooms" => {
                let mut msg = String::new();
                for r in room.visible() {
                    msg.push_str(&list_room(&r));
                }
                (msg, true, false)
            }
            "allrooms" => {
                let mut msg = String::new();
                for r in &self.rooms {
                    msg.push_str(&list_room(r));
                }
                (msg, true, false)
            }
            _ => ("Invalid argument.".to_string(), false, true),
        }
    }

    async fn cmd_manage(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        if args.is_empty() {
            // Self-promotion.
            if !room.managers().is_empty() && !c.has_perms(perms::BYPASS_LOCKS) {
                return (
                    "This room already has a manager. Ask them to promote you.".to_string(),
                    false,
                    false,
                );
            }
            if !room.allow_managers() && !c.has_perms(perms::BYPASS_LOCKS) {
                return (
                    "Promoting to manager is not allowed in this room.".to_string(),
                    false,
                    false,
                );
            }
            if room.is_manager(c.uid()) {
                return ("You are already a manager in this room!".to_string(), false, false);
            }

            room.add_manager(c.uid());
            c.add_role(&self.mgr_role);
            self.send_server_message_to_room(
                &room,
                &format!("{} is now managing this room.", c.short_string()),
            )
            .await;
            return (format!("Promoted to '{}'!", self.mgr_role.name), true, false);
        }

        // Promoting others.
        if !room.is_manager(c.uid()) {
            return (
                "You must be a manager yourself to promote others.".to_string(),
                false,
                false,
            );
        }

        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if t == TargetType::Ipid {
            return ("Can't promote by IPID.".to_string(), false, true);
        }

        let targets = match self.get_targets(c, t, args) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut msg = String::new();
        let mut promoted = Vec::new();
        for cl in &targets {
            let Some(cl_room) = cl.room() else { continue };
            if !Arc::ptr_eq(&cl_room, &room) {
                msg.push_str(&format!("{} is not in this room. Skipping.\n", cl.short_string()));
                continue;
            }
            if room.is_manager(cl.uid()) {
                msg.push_str(&format!(
                    "{} is already a manager in this room. Skipping.\n",
                    cl.short_string()
                ));
                continue;
            }
            cl.add_role(&self.mgr_role);
            room.add_manager(cl.uid());
            self.send_server_message_to_room(
                &room,
                &format!("{} is now managing this room.", cl.short_string()),
            )
            .await;
            promoted.push(cl.short_string());
        }

        if promoted.is_empty() {
            msg.push_str("Couldn't promote any client.");
            return (msg, false, false);
        }
        msg.push_str(&format!("Successfully promoted {}.", promoted.join(", ")));
        (msg, true, false)
    }

    async fn cmd_unmanage(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        if args.is_empty() {
            if !room.is_manager(c.uid()) {
                return ("You are not a manager!".to_string(), false, false);
            }
            room.remove_manager(c.uid());
            c.remove_role(&self.mgr_role);
            self.send_server_message_to_room(
                &room,
                &format!("{} is no longer managing this room.", c.short_string()),
            )
            .await;
            return (format!("No longer '{}'!", self.mgr_role.name), true, false);
        }

        if !room.is_manager(c.uid()) {
            return (
                "You must be a manager yourself to demote others.".to_string(),
                false,
                false,
            );
        }

        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if t == TargetType::Ipid {
            return ("Cannot demote by IPID.".to_string(), false, true);
        }

        let targets = match self.get_targets(c, t, args) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut msg = String::new();
        let mut demoted = Vec::new();
        for cl in &targets {
            if !room.is_manager(cl.uid()) {
                msg.push_str(&format!("{} is not a manager in this room.\n", cl.short_string()));
                continue;
            }
            cl.remove_role(&self.mgr_role);
            room.remove_manager(cl.uid());
            self.send_server_message_to_room(
                &room,
                &format!("{} is no longer managing this room.", cl.short_string()),
            )
            .await;
            demoted.push(cl.short_string());
        }

        if demoted.is_empty() {
            msg.push_str("Couldn't demote any client.");
            return (msg, false, false);
        }
        msg.push_str(&format!("Successfully demoted {}.", demoted.join(", ")));
        (msg, true, false)
    }

    async fn cmd_invite(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if t == TargetType::Ipid {
            return ("Can't invite by IPID.".to_string(), false, true);
        }
        if args.is_empty() {
            return ("Not enough arguments.".to_string(), false, true);
        }

        let targets = match self.get_targets(c, t, args) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut invited = Vec::new();
        for cl in &targets {
            room.invite(cl.uid());
            self.send_server_message(
                cl,
                &format!("You have been invited to [{}] {}.", room.id(), room.name()),
            )
            .await;
            invited.push(cl.short_string());
        }
        (
            format!("Successfully invited {}.", invited.join(", ")),
            true,
            false,
        )
    }

    async fn cmd_uninvite(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        let mut args = args;
        let mut t = parse_target(args[0]);
        if t != TargetType::Default {
            args = &args[1..];
        } else {
            t = TargetType::Uid;
        }
        if t == TargetType::Ipid {
            return ("Can't uninvite by IPID.".to_string(), false, true);
        }
        if args.is_empty() {
            return ("Not enough arguments.".to_string(), false, true);
        }

        let targets = match self.get_targets(c, t, args) {
            Ok(t) => t,
            Err(e) => return (e, false, false),
        };

        let mut uninvited = Vec::new();
        for cl in &targets {
            room.uninvite(cl.uid());
            uninvited.push(cl.short_string());
        }
        (
            format!("Successfully uninvited {}.", uninvited.join(", ")),
            true,
            false,
        )
    }

    async fn cmd_background(&self, c: &Arc<Client>, args: &[&str]) -> (String, bool, bool) {
        let Some(room) = c.room() else {
            return ("You are not in a room.".to_string(), false, false);
        };
        if room.bg_locked() && !c.has_perms(perms::BYPASS_LOCKS) {
            return (
                "The background is locked in this room.".to_string(),
                false,
                false,
            );
        }
        let bg = args.join(" ");
        room.set_background(&bg);
        self.write_to_room_ao(&room, "BN", &[bg.clone()]).await;
        self.send_server_message_to_room(
            &room,
            &format!("{} changed the background to '{bg}'.", c.short_string()),
        )
        .await;
        (format!("Background changed to '{bg}'."), true, false)
    }

    /// Resolve the clients a command targets.
    fn get_targets(
        &self,
        c: &Arc<Client>,
        t: TargetType,
        ids: &[&str],
    ) -> Result<Vec<Arc<Client>>, String> {
        let mut clients = Vec::new();
        match t {
            TargetType::Uid | TargetType::Default => {
                for id in ids {
                    let uid: i32 = id
                        .parse()
                        .map_err(|_| format!("'{id}' is not a valid UID."))?;
                    let cl = self
                        .get_by_uid(uid)
                        .ok_or_else(|| format!("No client with UID {uid}."))?;
                    clients.push(cl);
                }
            }
            TargetType::Cid => {
                let Some(room) = c.room() else {
                    return Err("You are not in a room.".to_string());
                };
                let in_room = self.get_clients_in_room(&room);
                for id in ids {
                    let cid: i32 = id
                        .parse()
                        .map_err(|_| format!("'{id}' is not a valid CID."))?;
                    let mut found = false;
                    for cl in &in_room {
                        if cl.cid() == cid {
                            found = true;
                            clients.push(cl.clone());
                        }
                    }
                    if !found {
                        return Err(format!("No client with CID {cid} in this room."));
                    }
                }
            }
            TargetType::Ipid => {
                for ipid in ids {
                    let cls = self.get_by_ipid(ipid);
                    if cls.is_empty() {
                        return Err(format!("No client with IPID '{ipid}'."));
                    }
                    clients.extend(cls);
                }
            }
        }
        if clients.is_empty() {
            return Err("No targets found.".to_string());
        }
        Ok(clients)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientKind;
    use crate::server::testutil::*;

    async fn run(srv: &Arc<Server>, c: &Arc<Client>, line: &str) {
        let mut parts = line.trim_start_matches('/').split(' ');
        let name = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        srv.handle_command(c, name, &args).await;
    }

    fn give_role(srv: &Arc<Server>, c: &Arc<Client>, role: &str) {
        let role = srv.roles.iter().find(|r| r.name == role).unwrap().clone();
        c.add_role(&role);
    }

    #[tokio::test]
    async fn unknown_command_reports() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;
        run(&srv, &c, "/frobnicate now").await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("'/frobnicate' is an unknown command"), "got: {out}");
    }

    #[tokio::test]
    async fn missing_args_sends_usage() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;
        run(&srv, &c, "/login onlyuser").await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("Not enough arguments for /login"), "got: {out}");
        assert!(out.contains("/login <username> <password>"), "got: {out}");
    }

    #[tokio::test]
    async fn permission_gate_refuses() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;
        run(&srv, &c, "/mute 1 5m").await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("do not have the required permissions"), "got: {out}");
    }

    #[tokio::test]
    async fn login_attaches_role_and_guard_hint() {
        let srv = test_server();
        srv.db.add_auth("judge", "gavel123", "Moderator").unwrap();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;

        run(&srv, &c, "/login judge wrongpass").await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("Incorrect password"), "got: {out}");
        assert!(!c.has_perms(perms::MUTE));

        run(&srv, &c, "/login judge gavel123").await;
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("AUTH#1#%"), "guard hint missing: {out}");
        assert!(out.contains("Successfully authenticated as user 'judge' and role 'Moderator'"));
        assert!(c.has_perms(perms::MUTE | perms::KICK | perms::BAN));
    }

    #[tokio::test]
    async fn mute_command_mutes_and_persists() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (t, mut rxt) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &m).await;
        join(&srv, &t).await;
        t.set_ident("H-target");
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");

        run(&srv, &m, &format!("/mute ic uid {} 5m spamming hard", t.uid())).await;
        assert_eq!(t.mute_state(), client::MUTED_IC);

        let out_t = frames(&mut rxt).join("\n");
        assert!(out_t.contains("You have been muted from IC chat for 5m for: spamming hard"), "got: {out_t}");
        let out_m = frames(&mut rxm).join("\n");
        assert!(out_m.contains("Successfully muted"), "got: {out_m}");

        let mutes = srv.db.get_mutes(t.ipid(), "H-target").unwrap();
        assert_eq!(mutes.len(), 1);
        assert_eq!(mutes[0].bits, client::MUTED_IC);
        assert_eq!(mutes[0].duration, 300);
        assert_eq!(mutes[0].moderator, "modname");

        run(&srv, &m, &format!("/unmute uid {}", t.uid())).await;
        assert_eq!(t.mute_state(), 0);
    }

    #[tokio::test]
    async fn mute_refuses_equal_privileges() {
        let srv = test_server();
        let (a, mut rxa) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (b, _rxb) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &a).await;
        join(&srv, &b).await;
        give_role(&srv, &a, "Moderator");
        give_role(&srv, &b, "Moderator");

        run(&srv, &a, &format!("/mute {} 5m", b.uid())).await;
        assert_eq!(b.mute_state(), 0);
        let out = frames(&mut rxa).join("\n");
        assert!(out.contains("same privileges as you"), "got: {out}");
    }

    #[tokio::test]
    async fn kick_removes_target() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (t, _rxt) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &m).await;
        join(&srv, &t).await;
        t.set_ident("H-kick");
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");

        let target_ipid = t.ipid().to_string();
        run(&srv, &m, &format!("/kick uid {} being rude", t.uid())).await;
        assert_eq!(srv.clients.size(), 1);
        let out = frames(&mut rxm).join("\n");
        assert!(out.contains("Successfully kicked"), "got: {out}");

        let kicks = srv.db.get_kicks(&target_ipid, "H-kick").unwrap();
        assert_eq!(kicks.len(), 1);
        assert_eq!(kicks[0].reason, "being rude");
    }

    #[tokio::test]
    async fn ban_kicks_records_and_blocks_rejoin() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (t, mut rxt) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &m).await;
        join(&srv, &t).await;
        t.set_ident("H1");
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");
        let target_ipid = t.ipid().to_string();
        let target_uid = t.uid();
        let _ = frames(&mut rxt);

        run(&srv, &m, &format!("/ban uid {target_uid} 1h cheating")).await;

        // Target got the formatted notice and was disconnected.
        let out_t = frames(&mut rxt).join("\n");
        assert!(out_t.contains("KK#You have been banned. Reason: cheating (until "), "got: {out_t}");
        assert_eq!(srv.clients.size(), 1);

        // One row, correct identity pair, roughly one hour window.
        let bans = srv.db.get_bans(&target_ipid, "H1").unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].ipid, target_ipid);
        assert_eq!(bans[0].hdid, "H1");
        assert!((bans[0].end - bans[0].start - 3600).abs() <= 1);

        let out_m = frames(&mut rxm).join("\n");
        assert!(out_m.contains("Successfully banned"), "got: {out_m}");

        // Reconnection from the same address is turned away at askchaa.
        let (again, mut rx2) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        srv.handle_packet_ao(
            &again,
            scproto::ao::PacketAo {
                header: "HI".to_string(),
                contents: vec!["H1".to_string()],
            },
        )
        .await;
        let _ = frames(&mut rx2);
        srv.handle_packet_ao(
            &again,
            scproto::ao::PacketAo {
                header: "askchaa".to_string(),
                contents: vec![],
            },
        )
        .await;
        let out = frames(&mut rx2).join("\n");
        assert!(out.contains("BD#cheating. (until: "), "got: {out}");
    }

    #[tokio::test]
    async fn ban_by_ipid_covers_every_distinct_hdid() {
        let srv = test_server();
        let (m, _rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        // Two connections from the same address, different hardware ids.
        let (t1, _rx1) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        let (t2, _rx2) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &m).await;
        join(&srv, &t1).await;
        join(&srv, &t2).await;
        t1.set_ident("H1");
        t2.set_ident("H2");
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");
        let ipid = t1.ipid().to_string();

        run(&srv, &m, &format!("/ban ipid {ipid} 1h shared account abuse")).await;
        assert_eq!(srv.clients.size(), 1);

        let bans = srv.db.get_bans(&ipid, "").unwrap();
        assert_eq!(bans.len(), 2);
        let mut hdids: Vec<_> = bans.iter().map(|b| b.hdid.clone()).collect();
        hdids.sort();
        assert_eq!(hdids, vec!["H1", "H2"]);
    }

    #[tokio::test]
    async fn ban_offline_ipid_writes_single_record() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &m).await;
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");

        run(&srv, &m, "/ban ipid zzz999 perma evading").await;
        let out = frames(&mut rxm).join("\n");
        assert!(out.contains("No clients currently online with IPID zzz999"), "got: {out}");

        let bans = srv.db.get_bans("zzz999", "").unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].hdid, "");
        let (banned, _) = srv.db.check_banned("zzz999", "").unwrap();
        assert!(banned, "perma ban must be active");
    }

    #[tokio::test]
    async fn unban_lifts_by_id() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &m).await;
        give_role(&srv, &m, "Moderator");
        m.set_username("modname");
        let id = srv.db.add_ban("abc123", "", "oops", "modname", 3600).unwrap();

        run(&srv, &m, &format!("/unban {id}")).await;
        let out = frames(&mut rxm).join("\n");
        assert!(out.contains(&format!("Ban {id} lifted.")), "got: {out}");
        let (banned, _) = srv.db.check_banned("abc123", "").unwrap();
        assert!(!banned);
    }

    #[tokio::test]
    async fn get_room_hides_ipids_without_permission() {
        let srv = test_server();
        let (plain, mut rxp) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &plain).await;
        join(&srv, &m).await;
        give_role(&srv, &m, "Moderator");

        run(&srv, &plain, "/get room").await;
        let out = frames(&mut rxp).join("\n");
        assert!(out.contains(">>> [0] Courtroom: <<<"), "got: {out}");
        assert!(!out.contains("IPID:"), "got: {out}");

        run(&srv, &m, "/get room").await;
        let out = frames(&mut rxm).join("\n");
        assert!(out.contains("IPID:"), "got: {out}");
    }

    #[tokio::test]
    async fn manage_self_promotion_and_demotion() {
        let srv = test_server();
        let (c, mut rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;

        run(&srv, &c, "/manage").await;
        assert!(srv.rooms[0].is_manager(c.uid()));
        assert!(c.has_perms(perms::STATUS | perms::LOCK));
        let out = frames(&mut rx).join("\n");
        assert!(out.contains("Promoted to 'Manager'!"), "got: {out}");

        // A second manager needs a promotion from the first.
        let (d, mut rxd) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &d).await;
        run(&srv, &d, "/manage").await;
        let out = frames(&mut rxd).join("\n");
        assert!(out.contains("already has a manager"), "got: {out}");

        run(&srv, &c, &format!("/manage uid {}", d.uid())).await;
        assert!(srv.rooms[0].is_manager(d.uid()));

        run(&srv, &c, "/unmanage").await;
        assert!(!srv.rooms[0].is_manager(c.uid()));
        assert!(!c.has_perms(perms::STATUS));
    }

    #[tokio::test]
    async fn moving_rooms_strips_manager() {
        let srv = test_server();
        let (c, _rx) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &c).await;
        run(&srv, &c, "/manage").await;
        assert!(srv.rooms[0].is_manager(c.uid()));

        let lobby = srv.rooms[1].clone();
        srv.move_client(&c, &lobby).await;
        assert!(!srv.rooms[0].is_manager(c.uid()));
        assert!(!c.has_perms(perms::STATUS));
    }

    #[tokio::test]
    async fn invite_opens_a_locked_room() {
        let srv = test_server();
        let (mgr, _rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        let (x, mut rxx) = connect(&srv, ClientKind::Ao, "10.2.0.2");
        join(&srv, &mgr).await;
        join(&srv, &x).await;

        let lobby = srv.rooms[1].clone();
        srv.move_client(&mgr, &lobby).await;
        run(&srv, &mgr, "/manage").await;
        lobby.set_lock_state(crate::room::LockState::Locked);
        let _ = frames(&mut rxx);

        // Uninvited: turned away at the door.
        srv.move_client(&x, &lobby).await;
        assert!(Arc::ptr_eq(&x.room().unwrap(), &srv.rooms[0]));
        let out = frames(&mut rxx).join("\n");
        assert!(out.contains("You are not invited to this room!"), "got: {out}");

        // The manager invites; the retry succeeds and ARUP counts go out.
        run(&srv, &mgr, &format!("/invite uid {}", x.uid())).await;
        let out = frames(&mut rxx).join("\n");
        assert!(out.contains("You have been invited to [1] Lobby."), "got: {out}");

        srv.move_client(&x, &lobby).await;
        assert!(Arc::ptr_eq(&x.room().unwrap(), &lobby));
        let out = frames(&mut rxx).join("\n");
        assert!(out.contains("ARUP#0#"), "player counts must update: {out}");

        run(&srv, &mgr, &format!("/uninvite uid {}", x.uid())).await;
        assert!(!lobby.is_invited(x.uid()));
    }

    #[tokio::test]
    async fn bg_changes_background_and_broadcasts() {
        let srv = test_server();
        let (m, mut rxm) = connect(&srv, ClientKind::Ao, "10.2.0.1");
        join(&srv, &m).await;
        give_role(&srv, &m, "Moderator");

        run(&srv, &m, "/bg courtroom_night").await;
        assert_eq!(srv.rooms[0].background(), "courtroom_night");
        let out = frames(&mut rxm).join("\n");
        assert!(out.contains("BN#courtroom_night#%"), "got: {out}");
        assert!(out.contains("changed the background"), "got: {out}");
    }
}
