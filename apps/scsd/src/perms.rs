//! Permission bitmasks and roles.

use std::ops::BitAnd;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::Not;

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mask(pub u32);

pub const NONE: Mask = Mask(0);

// Moderator permissions.
pub const SEE_IPIDS: Mask = Mask(1 << 0);
pub const HEAR_MODCALLS: Mask = Mask(1 << 1);
pub const MUTE: Mask = Mask(1 << 2);
pub const KICK: Mask = Mask(1 << 3);
pub const BAN: Mask = Mask(1 << 4);
pub const UNBAN: Mask = Mask(1 << 5);
pub const BYPASS_LOCKS: Mask = Mask(1 << 6);

// Room permissions.
pub const STATUS: Mask = Mask(1 << 7);
pub const LOCK: Mask = Mask(1 << 8);
pub const DESCRIPTION: Mask = Mask(1 << 9);
pub const BACKGROUND: Mask = Mask(1 << 10);
pub const AMBIANCE: Mask = Mask(1 << 11);

// Server permissions.
pub const MODIFY_DATABASE: Mask = Mask(1 << 12);
pub const RESERVED_NAMES: Mask = Mask(1 << 13);

pub const ALL: Mask = Mask(u32::MAX);

impl Mask {
    /// Every permission in `p` is present in `self`.
    pub fn contains(self, p: Mask) -> bool {
        self.0 & p.0 == p.0
    }

    /// `self` is a subset of `other`: "p implies q" per bit, i.e.
    /// `(other | !self) == ALL`.
    pub fn subset_of(self, other: Mask) -> bool {
        (other.0 | !self.0) == u32::MAX
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Mask {
    type Output = Mask;
    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

impl Not for Mask {
    type Output = Mask;
    fn not(self) -> Mask {
        Mask(!self.0)
    }
}

fn mask_by_name(name: &str) -> Option<Mask> {
    match name {
        "see_ipids" => Some(SEE_IPIDS),
        "hear_modcall" => Some(HEAR_MODCALLS),
        "mute" => Some(MUTE),
        "kick" => Some(KICK),
        "ban" => Some(BAN),
        "unban" => Some(UNBAN),
        "bypass_locks" => Some(BYPASS_LOCKS),
        "status" => Some(STATUS),
        "lock" => Some(LOCK),
        "description" => Some(DESCRIPTION),
        "background" => Some(BACKGROUND),
        "ambiance" => Some(AMBIANCE),
        "modify_database" => Some(MODIFY_DATABASE),
        "reserved_names" => Some(RESERVED_NAMES),
        "all" => Some(ALL),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub perms: Mask,
}

/// Build the role list from configuration. Permission strings add bits; a
/// `^` prefix subtracts them (`["all", "^modify_database"]`).
pub fn make_roles(conf: &config::Roles) -> anyhow::Result<Vec<Role>> {
    let mut roles = Vec::with_capacity(conf.roles.len());
    for rc in &conf.roles {
        let mut perms = NONE;
        for s in &rc.permissions {
            let (subtract, name) = match s.strip_prefix('^') {
                Some(rest) => (true, rest),
                None => (false, s.as_str()),
            };
            let Some(m) = mask_by_name(name) else {
                anyhow::bail!("role '{}': unknown permission '{}'", rc.name, name);
            };
            if subtract {
                perms = perms & !m;
            } else {
                perms |= m;
            }
        }
        roles.push(Role {
            name: rc.name.clone(),
            perms,
        });
    }
    Ok(roles)
}
