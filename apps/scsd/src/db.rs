//! The credential and audit store.
//!
//! One SQLite file per server instance holds the auth table and the
//! moderation audit tables (bans, kicks, mutes, unbans). All access goes
//! through a store-wide mutex; mutations are single-writer by construction.
//! Times are integer Unix seconds, durations integer seconds.

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    pub id: i64,
    pub ipid: String,
    pub hdid: String,
    pub reason: String,
    pub moderator: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    pub id: i64,
    pub ipid: String,
    pub hdid: String,
    pub reason: String,
    pub moderator: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mute {
    pub id: i64,
    pub ipid: String,
    pub hdid: String,
    pub reason: String,
    pub moderator: String,
    pub time: i64,
    pub bits: u8,
    pub duration: i64,
}

/// Aggregate audit view of one identity pair.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub bans: Vec<Ban>,
    pub kicks: Vec<Kick>,
    pub mutes: Vec<Mute>,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Empty identifiers are stored as NULL so the CHECK constraint means what
/// it says.
fn opt(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl Database {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open database")?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ephemeral setups.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth(
                 username TEXT PRIMARY KEY,
                 password TEXT NOT NULL,
                 role     TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS bans(
                 ban_id    INTEGER PRIMARY KEY,
                 ipid      TEXT,
                 hdid      TEXT,
                 reason    TEXT NOT NULL,
                 moderator TEXT NOT NULL,
                 start     INTEGER NOT NULL,
                 end       INTEGER NOT NULL,
                 CHECK (ipid IS NOT NULL OR hdid IS NOT NULL)
             );
             CREATE TABLE IF NOT EXISTS kicks(
                 kick_id   INTEGER PRIMARY KEY,
                 ipid      TEXT NOT NULL,
                 hdid      TEXT NOT NULL,
                 reason    TEXT NOT NULL,
                 moderator TEXT NOT NULL,
                 time      INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS mutes(
                 mute_id   INTEGER PRIMARY KEY,
                 ipid      TEXT NOT NULL,
                 hdid      TEXT NOT NULL,
                 reason    TEXT NOT NULL,
                 moderator TEXT NOT NULL,
                 time      INTEGER NOT NULL,
                 bits      INTEGER NOT NULL,
                 duration  INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS unbans(
                 unban_id  INTEGER PRIMARY KEY,
                 ban_id    INTEGER NOT NULL REFERENCES bans(ban_id),
                 moderator TEXT NOT NULL
             );",
        )
        .context("create tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add a user. Duplicate usernames are rejected by the primary key.
    pub fn add_auth(&self, username: &str, password: &str, role: &str) -> anyhow::Result<()> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).context("hash password")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auth (username, password, role) VALUES (?1, ?2, ?3)",
            params![username, hash, role],
        )
        .context("insert user")?;
        Ok(())
    }

    /// Check a username/password pair. An unknown user is not an error: the
    /// result is simply `(false, "")`. Storage failures are errors.
    pub fn check_auth(&self, username: &str, password: &str) -> anyhow::Result<(bool, String)> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT password, role FROM auth WHERE username = ?1",
                params![username],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("query user")?;
        let Some((hash, role)) = row else {
            return Ok((false, String::new()));
        };
        if bcrypt::verify(password, &hash).context("verify password")? {
            Ok((true, role))
        } else {
            Ok((false, String::new()))
        }
    }

    pub fn remove_auth(&self, username: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM auth WHERE username = ?1", params![username])
            .context("remove user")?;
        Ok(())
    }

    /// Insert a ban lasting `duration_secs` from now. At least one of the
    /// identifiers must be non-empty.
    pub fn add_ban(
        &self,
        ipid: &str,
        hdid: &str,
        reason: &str,
        moderator: &str,
        duration_secs: i64,
    ) -> anyhow::Result<i64> {
        if ipid.is_empty() && hdid.is_empty() {
            anyhow::bail!("ban needs an IPID or an HDID");
        }
        let start = now_unix();
        let end = start.saturating_add(duration_secs);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bans (ipid, hdid, reason, moderator, start, end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![opt(ipid), opt(hdid), reason, moderator, start, end],
        )
        .context("insert ban")?;
        Ok(conn.last_insert_rowid())
    }

    /// All bans matching either identifier, expired ones included.
    pub fn get_bans(&self, ipid: &str, hdid: &str) -> anyhow::Result<Vec<Ban>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT ban_id, ipid, hdid, reason, moderator, start, end
                 FROM bans WHERE ipid = ?1 OR hdid = ?2",
            )
            .context("prepare ban query")?;
        let rows = stmt
            .query_map(params![opt(ipid), opt(hdid)], |r| {
                Ok(Ban {
                    id: r.get(0)?,
                    ipid: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    hdid: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    reason: r.get(3)?,
                    moderator: r.get(4)?,
                    start: r.get(5)?,
                    end: r.get(6)?,
                })
            })
            .context("query bans")?;
        let mut bans = Vec::new();
        for b in rows {
            bans.push(b.context("scan ban row")?);
        }
        Ok(bans)
    }

    /// Whether either identifier is actively banned, with the active rows.
    pub fn check_banned(&self, ipid: &str, hdid: &str) -> anyhow::Result<(bool, Vec<Ban>)> {
        let now = now_unix();
        let active: Vec<Ban> = self
            .get_bans(ipid, hdid)?
            .into_iter()
            .filter(|b| b.end > now)
            .collect();
        Ok((!active.is_empty(), active))
    }

    /// End a ban now and record who lifted it.
    pub fn null_ban(&self, id: i64, moderator: &str) -> anyhow::Result<()> {
        let now = now_unix();
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE bans SET end = ?1 WHERE ban_id = ?2",
                params![now, id],
            )
            .context("null ban")?;
        if changed == 0 {
            anyhow::bail!("no ban with id {id}");
        }
        conn.execute(
            "INSERT INTO unbans (ban_id, moderator) VALUES (?1, ?2)",
            params![id, moderator],
        )
        .context("insert unban")?;
        Ok(())
    }

    pub fn add_kick(
        &self,
        ipid: &str,
        hdid: &str,
        reason: &str,
        moderator: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kicks (ipid, hdid, reason, moderator, time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ipid, hdid, reason, moderator, now_unix()],
        )
        .context("insert kick")?;
        Ok(())
    }

    pub fn get_kicks(&self, ipid: &str, hdid: &str) -> anyhow::Result<Vec<Kick>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT kick_id, ipid, hdid, reason, moderator, time
                 FROM kicks WHERE ipid = ?1 OR hdid = ?2",
            )
            .context("prepare kick query")?;
        let rows = stmt
            .query_map(params![ipid, hdid], |r| {
                Ok(Kick {
                    id: r.get(0)?,
                    ipid: r.get(1)?,
                    hdid: r.get(2)?,
                    reason: r.get(3)?,
                    moderator: r.get(4)?,
                    time: r.get(5)?,
                })
            })
            .context("query kicks")?;
        let mut kicks = Vec::new();
        for k in rows {
            kicks.push(k.context("scan kick row")?);
        }
        Ok(kicks)
    }

    pub fn add_mute(
        &self,
        ipid: &str,
        hdid: &str,
        reason: &str,
        moderator: &str,
        bits: u8,
        duration_secs: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mutes (ipid, hdid, reason, moderator, time, bits, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![ipid, hdid, reason, moderator, now_unix(), bits, duration_secs],
        )
        .context("insert mute")?;
        Ok(())
    }

    pub fn get_mutes(&self, ipid: &str, hdid: &str) -> anyhow::Result<Vec<Mute>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT mute_id, ipid, hdid, reason, moderator, time, bits, duration
                 FROM mutes WHERE ipid = ?1 OR hdid = ?2",
            )
            .context("prepare mute query")?;
        let rows = stmt
            .query_map(params![ipid, hdid], |r| {
                Ok(Mute {
                    id: r.get(0)?,
                    ipid: r.get(1)?,
                    hdid: r.get(2)?,
                    reason: r.get(3)?,
                    moderator: r.get(4)?,
                    time: r.get(5)?,
                    bits: r.get(6)?,
                    duration: r.get(7)?,
                })
            })
            .context("query mutes")?;
        let mut mutes = Vec::new();
        for m in rows {
            mutes.push(m.context("scan mute row")?);
        }
        Ok(mutes)
    }

    /// The full audit history of an identity pair.
    pub fn get_record(&self, ipid: &str, hdid: &str) -> anyhow::Result<Record> {
        Ok(Record {
            bans: self.get_bans(ipid, hdid)?,
            kicks: self.get_kicks(ipid, hdid)?,
            mutes: self.get_mutes(ipid, hdid)?,
        })
    }
}
