//! Durable session and message log backed by SQLite.
//!
//! Messages are append-only; a session's `updated_at` moves whenever one of
//! its messages is stored, so [`Store::list_sessions`] puts the most recently
//! active conversation first.

mod session;
mod sqlite;

pub use session::{DEFAULT_SESSION_TITLE, SessionManager};

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use kiln_types::{Message, MessageId, MessageParts, Role, SessionId, TokenUsage};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// A stored conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct Store {
    db: Connection,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {raw}"))
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

struct SessionRow {
    id: String,
    title: String,
    summary: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    const COLUMNS: &'static str = "id, title, summary, created_at, updated_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            summary: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        Ok(Session {
            id: SessionId::new(self.id),
            title: self.title,
            summary: self.summary,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    tool_calls: String,
    tool_results: String,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    created_at: String,
}

impl MessageRow {
    const COLUMNS: &'static str = "id, session_id, role, content, tool_calls, tool_results, \
         input_tokens, output_tokens, total_tokens, created_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            tool_calls: row.get(4)?,
            tool_results: row.get(5)?,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            total_tokens: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role: Role = self.role.parse()?;
        let tool_calls = serde_json::from_str(&self.tool_calls)
            .with_context(|| format!("Invalid tool calls on message {}", self.id))?;
        let tool_results = serde_json::from_str(&self.tool_results)
            .with_context(|| format!("Invalid tool results on message {}", self.id))?;
        let parts = MessageParts {
            id: MessageId::new(self.id),
            session_id: SessionId::new(self.session_id),
            role,
            content: self.content,
            tool_calls,
            tool_results,
            usage: TokenUsage {
                input_tokens: from_sql_count(self.input_tokens),
                output_tokens: from_sql_count(self.output_tokens),
                total_tokens: from_sql_count(self.total_tokens),
            },
            created_at: parse_timestamp(&self.created_at)?,
        };
        Ok(Message::from_parts(parts)?)
    }
}

impl Store {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS sessions (
            id         TEXT PRIMARY KEY,
            title      TEXT NOT NULL DEFAULT '',
            summary    TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id            TEXT PRIMARY KEY,
            session_id    TEXT NOT NULL,
            role          TEXT NOT NULL,
            content       TEXT NOT NULL DEFAULT '',
            tool_calls    TEXT NOT NULL DEFAULT '[]',
            tool_results  TEXT NOT NULL DEFAULT '[]',
            input_tokens  INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens  INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id);
    ";

    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sqlite::open_secure_db(path.as_ref())?;
        db.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL")?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA foreign_keys=ON;")
            .context("Failed to set pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create schema")?;
        Ok(Self { db })
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn create_session(&self, title: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: SessionId::generate(),
            title: title.to_string(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.db
            .execute(
                "INSERT INTO sessions (id, title, summary, created_at, updated_at)
                 VALUES (?1, ?2, '', ?3, ?3)",
                params![session.id.as_str(), title, timestamp(now)],
            )
            .context("Failed to create session")?;
        tracing::debug!(session = %session.id, "created session");
        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SessionRow::COLUMNS);
        let row = self
            .db
            .query_row(&sql, params![id.as_str()], SessionRow::read)
            .optional()
            .with_context(|| format!("Failed to load session {id}"))?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions ORDER BY updated_at DESC, rowid DESC",
            SessionRow::COLUMNS
        );
        let mut stmt = self
            .db
            .prepare(&sql)
            .context("Failed to prepare session listing")?;
        let rows = stmt
            .query_map([], SessionRow::read)
            .context("Failed to list sessions")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read sessions")?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub fn update_session_title(&self, id: &SessionId, title: &str) -> Result<()> {
        let updated = self
            .db
            .execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, timestamp(Utc::now()), id.as_str()],
            )
            .with_context(|| format!("Failed to rename session {id}"))?;
        if updated == 0 {
            return Err(anyhow!("Session not found: {id}"));
        }
        Ok(())
    }

    /// Remove a session and all of its messages.
    pub fn delete_session(&mut self, id: &SessionId) -> Result<()> {
        let tx = self
            .db
            .transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![id.as_str()],
        )
        .with_context(|| format!("Failed to delete messages of session {id}"))?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![id.as_str()])
            .with_context(|| format!("Failed to delete session {id}"))?;
        tx.commit().context("Failed to commit session delete")?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────

    pub fn add_message(&self, message: &Message) -> Result<()> {
        let tool_calls =
            serde_json::to_string(message.tool_calls()).context("Failed to encode tool calls")?;
        let tool_results = serde_json::to_string(message.tool_results())
            .context("Failed to encode tool results")?;
        let usage = message.usage();

        self.db
            .execute(
                &format!(
                    "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    MessageRow::COLUMNS
                ),
                params![
                    message.id().as_str(),
                    message.session_id().as_str(),
                    message.role().as_str(),
                    message.content(),
                    tool_calls,
                    tool_results,
                    to_sql_count(usage.input_tokens),
                    to_sql_count(usage.output_tokens),
                    to_sql_count(usage.total_tokens),
                    timestamp(message.created_at()),
                ],
            )
            .with_context(|| format!("Failed to store message {}", message.id()))?;

        if let Err(e) = self.db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![timestamp(Utc::now()), message.session_id().as_str()],
        ) {
            tracing::warn!(session = %message.session_id(), "Failed to touch session: {e}");
        }
        Ok(())
    }

    /// Chronological order.
    pub fn messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            MessageRow::COLUMNS
        );
        let mut stmt = self
            .db
            .prepare(&sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params![session_id.as_str()], MessageRow::read)
            .context("Failed to query messages")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read messages")?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    pub fn message_count(&self, session_id: &SessionId) -> Result<usize> {
        let count: i64 = self
            .db
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count messages")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn session_token_total(&self, session_id: &SessionId) -> Result<u64> {
        let total: i64 = self
            .db
            .query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM messages WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .context("Failed to sum session tokens")?;
        Ok(from_sql_count(total))
    }
}
