//! Working-memory persistence using SQLite
//!
//! Every mutating call runs in a single transaction, so a caller observes
//! either the whole write or none of it.

use crate::error::{MemoryError, Result};
use crate::tokens::TokenAccountant;
use crate::types::{Message, Page, Role, Session, SessionKey, SessionList};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;

/// Open (creating if needed) the on-disk database and run migrations
pub async fn open_pool(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database, for tests and ephemeral use
pub async fn open_in_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| MemoryError::Database(e.into()))
}

/// Session and message storage
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append messages (creating the session if needed) and return the new token count
    pub async fn append(
        &self,
        key: &SessionKey,
        messages: &[(Role, String)],
        context: Option<&str>,
        accountant: &TokenAccountant,
    ) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                namespace, session_id, epoch, context, last_token_count, created_at, last_accessed
            )
            VALUES (?, ?, ?, NULL, 0, ?, ?)
            ON CONFLICT(namespace, session_id) DO UPDATE SET
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.session_id)
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(context) = context {
            sqlx::query("UPDATE sessions SET context = ? WHERE namespace = ? AND session_id = ?")
                .bind(context)
                .bind(&key.namespace)
                .bind(&key.session_id)
                .execute(&mut *tx)
                .await?;
        }

        for (role, content) in messages {
            sqlx::query(
                r#"
                INSERT INTO messages (id, namespace, session_id, role, content, truncated, created_at)
                VALUES (?, ?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&key.namespace)
            .bind(&key.session_id)
            .bind(role.as_str())
            .bind(content)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let token_count = recount(&mut tx, key, accountant).await?;
        tx.commit().await?;

        Ok(token_count)
    }

    /// Load a session with its messages in insertion order
    pub async fn read(&self, key: &SessionKey) -> Result<Option<Session>> {
        let mut conn = self.pool.acquire().await?;
        load_session(&mut conn, key).await
    }

    /// Record a read access
    pub async fn touch(&self, key: &SessionKey) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_accessed = ? WHERE namespace = ? AND session_id = ?")
            .bind(Utc::now())
            .bind(&key.namespace)
            .bind(&key.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Swap in a new context and drop every message up to `evicted_through`.
    ///
    /// Fails with `NotFound` when the session was deleted (or deleted and
    /// recreated, which changes its epoch) since `epoch` was read.
    pub async fn replace_context_and_trim(
        &self,
        key: &SessionKey,
        epoch: &str,
        new_context: &str,
        evicted_through: Option<i64>,
        accountant: &TokenAccountant,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        ensure_epoch(&mut tx, key, epoch).await?;

        if let Some(ordinal) = evicted_through {
            sqlx::query(
                "DELETE FROM messages WHERE namespace = ? AND session_id = ? AND ordinal <= ?",
            )
            .bind(&key.namespace)
            .bind(&key.session_id)
            .bind(ordinal)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE sessions SET context = ? WHERE namespace = ? AND session_id = ?")
            .bind(new_context)
            .bind(&key.namespace)
            .bind(&key.session_id)
            .execute(&mut *tx)
            .await?;

        let token_count = recount(&mut tx, key, accountant).await?;
        tx.commit().await?;

        Ok(token_count)
    }

    /// Replace one message's content and flag it as truncated
    pub async fn truncate_message(
        &self,
        key: &SessionKey,
        epoch: &str,
        ordinal: i64,
        content: &str,
        accountant: &TokenAccountant,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        ensure_epoch(&mut tx, key, epoch).await?;

        sqlx::query(
            r#"
            UPDATE messages SET content = ?, truncated = 1
            WHERE namespace = ? AND session_id = ? AND ordinal = ?
            "#,
        )
        .bind(content)
        .bind(&key.namespace)
        .bind(&key.session_id)
        .bind(ordinal)
        .execute(&mut *tx)
        .await?;

        let token_count = recount(&mut tx, key, accountant).await?;
        tx.commit().await?;

        Ok(token_count)
    }

    /// Delete a session and its messages; returns false if it did not exist
    pub async fn delete(&self, key: &SessionKey) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE namespace = ? AND session_id = ?")
            .bind(&key.namespace)
            .bind(&key.session_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM sessions WHERE namespace = ? AND session_id = ?")
            .bind(&key.namespace)
            .bind(&key.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Session ids in a namespace, most recently accessed first
    pub async fn list_sessions(&self, namespace: &str, page: Page) -> Result<SessionList> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM sessions WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(
            r#"
            SELECT session_id FROM sessions
            WHERE namespace = ?
            ORDER BY last_accessed DESC, session_id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(namespace)
        .bind(page.page_size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(SessionList {
            sessions: rows
                .iter()
                .map(|r| r.try_get("session_id").unwrap_or_default())
                .collect(),
            total: total as usize,
        })
    }
}

async fn ensure_epoch(conn: &mut SqliteConnection, key: &SessionKey, epoch: &str) -> Result<()> {
    let current: Option<String> =
        sqlx::query("SELECT epoch FROM sessions WHERE namespace = ? AND session_id = ?")
            .bind(&key.namespace)
            .bind(&key.session_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.try_get("epoch").unwrap_or_default());

    match current {
        Some(current) if current == epoch => Ok(()),
        _ => Err(MemoryError::NotFound(format!("session {key}"))),
    }
}

async fn recount(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    accountant: &TokenAccountant,
) -> Result<usize> {
    let session = load_session(conn, key)
        .await?
        .ok_or_else(|| MemoryError::NotFound(format!("session {key}")))?;
    let token_count = accountant.count(&session.messages, session.context.as_deref())?;

    sqlx::query("UPDATE sessions SET last_token_count = ? WHERE namespace = ? AND session_id = ?")
        .bind(token_count as i64)
        .bind(&key.namespace)
        .bind(&key.session_id)
        .execute(&mut *conn)
        .await?;

    Ok(token_count)
}

async fn load_session(conn: &mut SqliteConnection, key: &SessionKey) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT namespace, session_id, epoch, context, last_token_count, created_at, last_accessed
        FROM sessions
        WHERE namespace = ? AND session_id = ?
        "#,
    )
    .bind(&key.namespace)
    .bind(&key.session_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let messages = sqlx::query(
        r#"
        SELECT ordinal, id, role, content, truncated, created_at
        FROM messages
        WHERE namespace = ? AND session_id = ?
        ORDER BY ordinal ASC
        "#,
    )
    .bind(&key.namespace)
    .bind(&key.session_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(Session {
        namespace: row.try_get("namespace").unwrap_or_default(),
        session_id: row.try_get("session_id").unwrap_or_default(),
        epoch: row.try_get("epoch").unwrap_or_default(),
        messages: messages.iter().map(row_to_message).collect(),
        context: row.try_get("context").ok().flatten(),
        last_token_count: row.try_get::<i64, _>("last_token_count").unwrap_or(0) as usize,
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        last_accessed: row.try_get("last_accessed").unwrap_or_else(|_| Utc::now()),
    }))
}

/// Helper: Convert database row to Message
fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let role: String = row.try_get("role").unwrap_or_default();
    Message {
        id: row.try_get("id").unwrap_or_default(),
        ordinal: row.try_get("ordinal").unwrap_or_default(),
        role: role.parse().unwrap_or(Role::User),
        content: row.try_get("content").unwrap_or_default(),
        truncated: row.try_get::<bool, _>("truncated").unwrap_or(false),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}
