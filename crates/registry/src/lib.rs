//! Session Registry: durable session rows and transcript messages.
//!
//! Backed by SQLite at `<data_dir>/sessions.db`. Sessions are unique by
//! worktree path; messages cascade on session deletion. The registry is the
//! restart-recovery pivot: `get_by_worktree_path` reconnects surviving
//! windows to their stored identity.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::Message,
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    },
    tracing::{debug, warn},
};

/// Persisted message content is capped at this many bytes; longer payloads
/// are truncated at a char boundary.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One row of the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub worktree_id: String,
    pub worktree_path: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct SessionRegistry {
    pool: SqlitePool,
}

impl SessionRegistry {
    /// Open (or create) the database file and initialize the schema.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::new(pool).await
    }

    /// Wrap an existing pool. The pool's connect options must enable
    /// foreign keys; [`Self::open`] and [`Self::in_memory`] do.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let registry = Self { pool };
        registry.init().await?;
        Ok(registry)
    }

    /// In-memory registry (tests).
    pub async fn in_memory() -> Result<Self> {
        use std::str::FromStr;
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(internal)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::new(pool).await
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                worktree_id TEXT NOT NULL,
                worktree_path TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL
                    REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_worktree_path
             ON sessions(worktree_path)",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_id
             ON messages(session_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Insert a new session row. A duplicate worktree path fails loudly with
    /// `Conflict`; the caller chooses between update-status and
    /// read-and-return.
    pub async fn create(
        &self,
        id: &str,
        worktree_id: &str,
        worktree_path: &str,
        status: &str,
    ) -> Result<SessionRow> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO sessions (id, worktree_id, worktree_path, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(worktree_id)
        .bind(worktree_path)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::conflict(format!(
                "session already exists for worktree: {worktree_path}"
            )),
            _ => internal(e),
        })?;

        debug!(sid = %id, path = %worktree_path, "created session row");
        Ok(SessionRow {
            id: id.to_string(),
            worktree_id: worktree_id.to_string(),
            worktree_path: worktree_path.to_string(),
            status: status.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionRow>> {
        let row: Option<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, worktree_id, worktree_path, status, created_at, updated_at
             FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(into_session_row))
    }

    pub async fn get_by_worktree_path(&self, worktree_path: &str) -> Result<Option<SessionRow>> {
        let row: Option<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, worktree_id, worktree_path, status, created_at, updated_at
             FROM sessions WHERE worktree_path = ?",
        )
        .bind(worktree_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(into_session_row))
    }

    pub async fn update_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    /// Delete a session row; its messages cascade.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<SessionRow>> {
        let rows: Vec<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, worktree_id, worktree_path, status, created_at, updated_at
             FROM sessions ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(into_session_row).collect())
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Append a transcript message. Content beyond [`MAX_MESSAGE_BYTES`] is
    /// truncated.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        kind: &str,
    ) -> Result<i64> {
        let content = truncate_content(content);
        let result = sqlx::query(
            "INSERT INTO messages (session_id, role, content, type, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(kind)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Error::not_found(format!("session not found: {session_id}"))
            },
            _ => internal(e),
        })?;
        Ok(result.last_insert_rowid())
    }

    /// All messages of a session, ordered by timestamp then insertion.
    pub async fn messages_of(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<(i64, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, session_id, role, content, type, timestamp
             FROM messages WHERE session_id = ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows
            .into_iter()
            .map(|(id, session_id, role, content, r#type, timestamp)| Message {
                id,
                session_id,
                role,
                content,
                r#type,
                timestamp,
            })
            .collect())
    }

    pub async fn clear_messages(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }
}

fn into_session_row(
    (id, worktree_id, worktree_path, status, created_at, updated_at): (
        String,
        String,
        String,
        String,
        i64,
        i64,
    ),
) -> SessionRow {
    SessionRow {
        id,
        worktree_id,
        worktree_path,
        status,
        created_at,
        updated_at,
    }
}

fn truncate_content(content: &str) -> &str {
    if content.len() <= MAX_MESSAGE_BYTES {
        return content;
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        original = content.len(),
        stored = end,
        "truncating oversized message content"
    );
    &content[..end]
}

fn internal(e: sqlx::Error) -> Error {
    Error::internal(format!("registry: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> SessionRegistry {
        SessionRegistry::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();

        let by_id = reg.get_by_id("s1").await.unwrap().unwrap();
        assert_eq!(by_id.worktree_path, "/tmp/r");
        assert_eq!(by_id.status, "active");

        let by_path = reg.get_by_worktree_path("/tmp/r").await.unwrap().unwrap();
        assert_eq!(by_path.id, "s1");

        assert!(reg.get_by_id("nope").await.unwrap().is_none());
        assert!(reg.get_by_worktree_path("/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_worktree_path_conflicts() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();
        let err = reg.create("s2", "w2", "/tmp/r", "active").await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // A different path is fine.
        reg.create("s2", "w2", "/tmp/other", "active").await.unwrap();
        assert_eq!(reg.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_status_bumps_updated_at() {
        let reg = registry().await;
        let row = reg.create("s1", "w1", "/tmp/r", "starting").await.unwrap();
        reg.update_status("s1", "active").await.unwrap();
        let after = reg.get_by_id("s1").await.unwrap().unwrap();
        assert_eq!(after.status, "active");
        assert!(after.updated_at >= row.updated_at);
    }

    #[tokio::test]
    async fn messages_cascade_on_delete() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();
        reg.add_message("s1", "user", "hello", "text").await.unwrap();
        reg.add_message("s1", "assistant", "hi", "text").await.unwrap();
        assert_eq!(reg.messages_of("s1").await.unwrap().len(), 2);

        reg.delete("s1").await.unwrap();
        assert!(reg.get_by_id("s1").await.unwrap().is_none());
        assert!(reg.messages_of("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_not_found() {
        let reg = registry().await;
        let err = reg
            .add_message("ghost", "user", "hello", "text")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn messages_are_ordered() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();
        for i in 0..5 {
            reg.add_message("s1", "user", &format!("m{i}"), "text")
                .await
                .unwrap();
        }
        let messages = reg.messages_of("s1").await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn clear_messages_keeps_session() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();
        reg.add_message("s1", "user", "hello", "text").await.unwrap();
        assert_eq!(reg.clear_messages("s1").await.unwrap(), 1);
        assert!(reg.messages_of("s1").await.unwrap().is_empty());
        assert!(reg.get_by_id("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_content_is_truncated() {
        let reg = registry().await;
        reg.create("s1", "w1", "/tmp/r", "active").await.unwrap();
        let big = "x".repeat(MAX_MESSAGE_BYTES + 100);
        reg.add_message("s1", "user", &big, "text").await.unwrap();
        let messages = reg.messages_of("s1").await.unwrap();
        assert_eq!(messages[0].content.len(), MAX_MESSAGE_BYTES);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut s = "a".repeat(MAX_MESSAGE_BYTES - 1);
        s.push('é'); // two bytes, straddles the limit
        let out = truncate_content(&s);
        assert!(out.len() < MAX_MESSAGE_BYTES + 2);
        assert!(out.chars().all(|c| c == 'a'));
    }
}
