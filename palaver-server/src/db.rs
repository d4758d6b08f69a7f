//! SQLite persistence layer.
//!
//! Stores identities, chat messages, invitation codes, mute flags, and
//! the per-message speech log backing the leaderboard. Uses WAL mode
//! for concurrent reads during writes.

use chrono::{DateTime, Datelike, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::proto::QuotedMessage;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted identity.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    /// PHC-format argon2 hash. Never compared in plaintext.
    pub password_hash: String,
    pub is_admin: bool,
}

/// A persisted message row, denormalized for broadcast and history push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(skip)]
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_message: Option<QuotedMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mentions: Vec<String>,
    /// Unix seconds, assigned by the server at insert time.
    pub timestamp: i64,
}

/// An invitation code row.
#[derive(Debug, Clone, Serialize)]
pub struct InvitationCodeRow {
    pub code: String,
    pub max_uses: u32,
    pub current_uses: u32,
}

/// A leaderboard entry: speech count within the requested window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub count: u64,
}

/// Leaderboard aggregation windows. Boundaries are calendar-based
/// (start of day / week / month in UTC), with no carry across windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderboardWindow {
    Day,
    Week,
    Month,
}

impl LeaderboardWindow {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// Window start (unix seconds) for a given instant. Weeks start on
    /// Sunday, matching the leaderboard the clients already render.
    fn start(&self, now: DateTime<Utc>) -> i64 {
        let today = now.date_naive();
        let start_day = match self {
            Self::Day => today,
            Self::Week => today - chrono::Days::new(today.weekday().num_days_from_sunday() as u64),
            Self::Month => today.with_day(1).unwrap_or(today),
        };
        start_day
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc()
            .timestamp()
    }
}

/// Outcome of a transactional registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(i64),
    /// Unknown, exhausted, or otherwise unusable invitation code.
    InvalidCode,
    UsernameTaken,
}

/// Whether a rusqlite error is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                username  TEXT UNIQUE NOT NULL,
                password  TEXT NOT NULL,
                is_admin  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                username       TEXT NOT NULL,
                body           TEXT,
                image_url      TEXT,
                quoted_json    TEXT,
                mentions_json  TEXT,
                timestamp      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS invitation_codes (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                code          TEXT UNIQUE NOT NULL,
                max_uses      INTEGER NOT NULL,
                current_uses  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS muted_users (
                username  TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS speech_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                username   TEXT NOT NULL,
                timestamp  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_speech_ts ON speech_log(timestamp);
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert a user. Fails with a UNIQUE violation if the username is
    /// taken; callers map that with [`is_unique_violation`].
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO users (username, password, is_admin) VALUES (?1, ?2, ?3)",
            params![username, password_hash, is_admin as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_user(&self, username: &str) -> SqlResult<Option<UserRow>> {
        self.conn
            .query_row(
                "SELECT id, username, password, is_admin FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        is_admin: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()
    }

    pub fn update_password(&self, username: &str, password_hash: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET password = ?1 WHERE username = ?2",
            params![password_hash, username],
        )?;
        Ok(changed > 0)
    }

    pub fn set_admin_flag(&self, username: &str, is_admin: bool) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET is_admin = ?1 WHERE username = ?2",
            params![is_admin as i64, username],
        )?;
        Ok(changed > 0)
    }

    pub fn list_users(&self) -> SqlResult<Vec<UserRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, username, password, is_admin FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                is_admin: row.get::<_, i64>(3)? != 0,
            })
        })?;
        rows.collect()
    }

    // ── Registration ───────────────────────────────────────────────

    /// Consume an invitation code and create the user in one
    /// transaction. The code check-and-increment is a single bounded
    /// UPDATE, so `current_uses` can never exceed `max_uses` no matter
    /// how many registrations race; a duplicate username rolls the
    /// consumption back instead of burning a use.
    pub fn register_user(
        &self,
        username: &str,
        password_hash: &str,
        code: &str,
    ) -> SqlResult<RegisterOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let consumed = tx.execute(
            "UPDATE invitation_codes SET current_uses = current_uses + 1
             WHERE code = ?1 AND current_uses < max_uses",
            params![code],
        )?;
        if consumed == 0 {
            tx.rollback()?;
            return Ok(RegisterOutcome::InvalidCode);
        }
        match tx.execute(
            "INSERT INTO users (username, password, is_admin) VALUES (?1, ?2, 0)",
            params![username, password_hash],
        ) {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(RegisterOutcome::Registered(id))
            }
            Err(ref e) if is_unique_violation(e) => {
                tx.rollback()?;
                Ok(RegisterOutcome::UsernameTaken)
            }
            Err(e) => Err(e),
        }
    }

    // ── Messages ───────────────────────────────────────────────────

    pub fn insert_message(
        &self,
        username: &str,
        body: Option<&str>,
        image_url: Option<&str>,
        quoted: Option<&QuotedMessage>,
        mentions: &[String],
        timestamp: i64,
    ) -> SqlResult<MessageRow> {
        let quoted_json = quoted.map(|q| serde_json::to_string(q).unwrap_or_default());
        let mentions_json = if mentions.is_empty() {
            None
        } else {
            serde_json::to_string(mentions).ok()
        };
        self.conn.execute(
            "INSERT INTO messages (username, body, image_url, quoted_json, mentions_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![username, body, image_url, quoted_json, mentions_json, timestamp],
        )?;
        Ok(MessageRow {
            id: self.conn.last_insert_rowid(),
            username: username.to_string(),
            message: body.map(str::to_string),
            image_url: image_url.map(str::to_string),
            quoted_message: quoted.cloned(),
            mentions: mentions.to_vec(),
            timestamp,
        })
    }

    /// The most recent `limit` messages, ordered oldest → newest.
    pub fn recent_messages(&self, limit: usize) -> SqlResult<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, body, image_url, quoted_json, mentions_json, timestamp
             FROM messages ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let quoted_json: Option<String> = row.get(4)?;
            let mentions_json: Option<String> = row.get(5)?;
            Ok(MessageRow {
                id: row.get(0)?,
                username: row.get(1)?,
                message: row.get(2)?,
                image_url: row.get(3)?,
                quoted_message: quoted_json.and_then(|j| serde_json::from_str(&j).ok()),
                mentions: mentions_json
                    .and_then(|j| serde_json::from_str(&j).ok())
                    .unwrap_or_default(),
                timestamp: row.get(6)?,
            })
        })?;
        let mut messages: Vec<MessageRow> = rows.collect::<SqlResult<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    // ── Speech log / leaderboard ───────────────────────────────────

    pub fn record_speech(&self, username: &str, timestamp: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO speech_log (username, timestamp) VALUES (?1, ?2)",
            params![username, timestamp],
        )?;
        Ok(())
    }

    /// Top 10 speakers within the window, descending by count.
    pub fn leaderboard(
        &self,
        window: LeaderboardWindow,
        now: DateTime<Utc>,
    ) -> SqlResult<Vec<LeaderboardEntry>> {
        let since = window.start(now);
        let mut stmt = self.conn.prepare(
            "SELECT username, COUNT(*) AS score FROM speech_log
             WHERE timestamp >= ?1
             GROUP BY username ORDER BY score DESC LIMIT 10",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(LeaderboardEntry {
                username: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;
        rows.collect()
    }

    // ── Invitation codes ───────────────────────────────────────────

    pub fn create_invitation_code(&self, code: &str, max_uses: u32) -> SqlResult<InvitationCodeRow> {
        self.conn.execute(
            "INSERT INTO invitation_codes (code, max_uses, current_uses) VALUES (?1, ?2, 0)",
            params![code, max_uses],
        )?;
        Ok(InvitationCodeRow {
            code: code.to_string(),
            max_uses,
            current_uses: 0,
        })
    }

    pub fn find_invitation_code(&self, code: &str) -> SqlResult<Option<InvitationCodeRow>> {
        self.conn
            .query_row(
                "SELECT code, max_uses, current_uses FROM invitation_codes WHERE code = ?1",
                params![code],
                |row| {
                    Ok(InvitationCodeRow {
                        code: row.get(0)?,
                        max_uses: row.get(1)?,
                        current_uses: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    /// Atomic bounded increment: true iff the code existed and still
    /// had uses left.
    pub fn try_consume_invitation_code(&self, code: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE invitation_codes SET current_uses = current_uses + 1
             WHERE code = ?1 AND current_uses < max_uses",
            params![code],
        )?;
        Ok(changed > 0)
    }

    pub fn list_invitation_codes(&self) -> SqlResult<Vec<InvitationCodeRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT code, max_uses, current_uses FROM invitation_codes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(InvitationCodeRow {
                code: row.get(0)?,
                max_uses: row.get(1)?,
                current_uses: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    // ── Mute flags ─────────────────────────────────────────────────

    pub fn set_muted(&self, username: &str, muted: bool) -> SqlResult<()> {
        if muted {
            self.conn.execute(
                "INSERT OR IGNORE INTO muted_users (username) VALUES (?1)",
                params![username],
            )?;
        } else {
            self.conn.execute(
                "DELETE FROM muted_users WHERE username = ?1",
                params![username],
            )?;
        }
        Ok(())
    }

    pub fn is_muted(&self, username: &str) -> SqlResult<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM muted_users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    // ── Retention sweep ────────────────────────────────────────────

    /// Image refs attached to messages strictly older than the cutoff.
    pub fn old_image_refs(&self, cutoff: i64) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT image_url FROM messages WHERE image_url IS NOT NULL AND timestamp < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
        rows.collect()
    }

    /// Delete image-carrying messages strictly older than the cutoff.
    /// Messages without an image ref are never purged.
    pub fn purge_old_image_messages(&self, cutoff: i64) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM messages WHERE image_url IS NOT NULL AND timestamp < ?1",
            params![cutoff],
        )
    }
}
