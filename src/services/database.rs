use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::task;
use uuid::Uuid;

use crate::models::{AppendReceipt, Conversation, Draft, Message, Role};
use crate::services::ledger::LedgerError;

type DbResult<T> = Result<T, LedgerError>;

/// Stored timestamps are fixed-width so that text order matches time order.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn stamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Unavailable(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        tracing::info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (used for testing and ephemeral runs)
    pub fn new_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(conn: &Mutex<Connection>) -> DbResult<MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|e| LedgerError::Unavailable(format!("DB lock poisoned: {}", e)))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = Self::lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(format!("Database task failed: {}", e)))?
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = Self::lock(&self.conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT,
                    model TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                    UNIQUE (conversation_id, position)
                );

                CREATE TABLE drafts (
                    user_id TEXT PRIMARY KEY,
                    conversation_id TEXT,
                    content TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE SET NULL
                );

                CREATE TABLE settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX idx_conversations_user ON conversations(user_id, updated_at DESC);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        Ok(())
    }

    // --- Conversation CRUD ---

    pub async fn insert_conversation(&self, conversation: &Conversation) -> DbResult<()> {
        let conv = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conv.id,
                    conv.user_id,
                    conv.title,
                    conv.model,
                    stamp(&conv.created_at),
                    stamp(&conv.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> DbResult<Option<Conversation>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, model, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let result = stmt
                .query_row(params![id], |row| Ok(Self::row_to_conversation(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    pub async fn list_conversations(&self, user_id: &str) -> DbResult<Vec<Conversation>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, model, created_at, updated_at
                 FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC",
            )?;
            let conversations = stmt
                .query_map(params![user_id], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
        .await
    }

    /// Returns false when nothing matched.
    pub async fn update_conversation_metadata(
        &self,
        id: &str,
        user_id: &str,
        title: Option<&str>,
        model: Option<&str>,
    ) -> DbResult<bool> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let title = title.map(|s| s.to_string());
        let model = model.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations
                 SET title = COALESCE(?1, title), model = COALESCE(?2, model)
                 WHERE id = ?3 AND user_id = ?4",
                params![title, model, id, user_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Deleting an unknown id is a no-op; the return value says whether
    /// anything was removed. Messages go with it through the cascade.
    pub async fn delete_conversation(&self, id: &str, user_id: &str) -> DbResult<bool> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    // --- Message ledger ---

    /// Assign the next position and insert, all inside one IMMEDIATE
    /// transaction. The write reservation is taken before the MAX read, so a
    /// second writer cannot observe the same maximum.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
    ) -> DbResult<AppendReceipt> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let owner: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.as_deref() != Some(user_id.as_str()) {
                return Err(LedgerError::NotFound(format!(
                    "conversation {}",
                    conversation_id
                )));
            }

            let position: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;

            let message_id = Uuid::new_v4().to_string();
            let created_at = now();
            let created_stamp = stamp(&created_at);

            tx.execute(
                "INSERT INTO messages (id, conversation_id, role, content, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![message_id, conversation_id, role.as_str(), content, position, created_stamp],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![created_stamp, conversation_id],
            )?;

            tx.commit()?;

            Ok(AppendReceipt {
                message_id,
                position,
                created_at,
            })
        })
        .await
    }

    pub async fn list_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, position, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY position ASC",
            )?;
            let messages = stmt
                .query_map(params![conversation_id], |row| {
                    Ok(Self::row_to_message(row))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    // --- Drafts ---

    pub async fn save_draft(&self, draft: &Draft) -> DbResult<()> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO drafts (user_id, conversation_id, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   conversation_id = excluded.conversation_id,
                   content = excluded.content,
                   updated_at = excluded.updated_at",
                params![
                    draft.user_id,
                    draft.conversation_id,
                    draft.content,
                    stamp(&draft.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_draft(&self, user_id: &str) -> DbResult<Option<Draft>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let result = conn
                .query_row(
                    "SELECT user_id, conversation_id, content, updated_at
                     FROM drafts WHERE user_id = ?1",
                    params![user_id],
                    |row| Ok(Self::row_to_draft(row)),
                )
                .optional()?;
            result.transpose()
        })
        .await
    }

    pub async fn delete_draft(&self, user_id: &str) -> DbResult<()> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM drafts WHERE user_id = ?1", params![user_id])?;
            Ok(())
        })
        .await
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> DbResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    // --- Row helpers ---

    fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| LedgerError::Unavailable(format!("Corrupt timestamp {:?}: {}", raw, e)))
    }

    fn row_to_conversation(row: &rusqlite::Row) -> DbResult<Conversation> {
        let created_str: String = row.get(4)?;
        let updated_str: String = row.get(5)?;

        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            model: row.get(3)?,
            created_at: Self::parse_timestamp(&created_str)?,
            updated_at: Self::parse_timestamp(&updated_str)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> DbResult<Message> {
        let role_str: String = row.get(2)?;
        let created_str: String = row.get(5)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: Role::parse(&role_str)
                .ok_or_else(|| LedgerError::Unavailable(format!("Unknown role: {}", role_str)))?,
            content: row.get(3)?,
            position: row.get(4)?,
            created_at: Self::parse_timestamp(&created_str)?,
        })
    }

    fn row_to_draft(row: &rusqlite::Row) -> DbResult<Draft> {
        let updated_str: String = row.get(3)?;

        Ok(Draft {
            user_id: row.get(0)?,
            conversation_id: row.get(1)?,
            content: row.get(2)?,
            updated_at: Self::parse_timestamp(&updated_str)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(user_id: &str) -> Conversation {
        let now = now();
        Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: None,
            model: Some("llama3.1".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.list_conversations("alice").await.unwrap().is_empty());
        assert!(db.get_setting("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_assigns_positions_and_bumps_updated_at() {
        let db = Database::new_in_memory().unwrap();
        let conv = conversation("alice");
        db.insert_conversation(&conv).await.unwrap();

        let first = db
            .append_message(&conv.id, "alice", Role::User, "Hello!")
            .await
            .unwrap();
        let second = db
            .append_message(&conv.id, "alice", Role::Assistant, "Hi there.")
            .await
            .unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);

        let stored = db.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, second.created_at);

        let messages = db.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Hi there.");
        assert_eq!(messages[1].id, second.message_id);
    }

    #[tokio::test]
    async fn test_append_to_foreign_or_missing_conversation_is_not_found() {
        let db = Database::new_in_memory().unwrap();
        let conv = conversation("alice");
        db.insert_conversation(&conv).await.unwrap();

        let err = db
            .append_message(&conv.id, "mallory", Role::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));

        let err = db
            .append_message("nope", "alice", Role::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));

        assert!(db.list_messages(&conv.id).await.unwrap().is_empty());
        let stored = db.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, conv.updated_at);
    }

    #[tokio::test]
    async fn test_duplicate_position_maps_to_conflict() {
        let db = Database::new_in_memory().unwrap();
        let conv = conversation("alice");
        db.insert_conversation(&conv).await.unwrap();
        db.append_message(&conv.id, "alice", Role::User, "first")
            .await
            .unwrap();

        let conv_id = conv.id.clone();
        let err = db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, conversation_id, role, content, position, created_at)
                     VALUES ('dup', ?1, 'user', 'again', 0, ?2)",
                    params![conv_id, stamp(&now())],
                )?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() {
        let db = Database::new_in_memory().unwrap();
        let conv = conversation("alice");
        db.insert_conversation(&conv).await.unwrap();
        db.append_message(&conv.id, "alice", Role::User, "bye")
            .await
            .unwrap();
        db.save_draft(&Draft {
            user_id: "alice".to_string(),
            conversation_id: Some(conv.id.clone()),
            content: "half-written".to_string(),
            updated_at: now(),
        })
        .await
        .unwrap();

        assert!(!db.delete_conversation(&conv.id, "bob").await.unwrap());
        assert!(db.delete_conversation(&conv.id, "alice").await.unwrap());
        assert!(!db.delete_conversation(&conv.id, "alice").await.unwrap());

        assert!(db.list_messages(&conv.id).await.unwrap().is_empty());
        let draft = db.get_draft("alice").await.unwrap().unwrap();
        assert!(draft.conversation_id.is_none());
        assert_eq!(draft.content, "half-written");
    }

    #[tokio::test]
    async fn test_draft_upsert_and_delete() {
        let db = Database::new_in_memory().unwrap();
        for content in ["one", "two"] {
            db.save_draft(&Draft {
                user_id: "alice".to_string(),
                conversation_id: None,
                content: content.to_string(),
                updated_at: now(),
            })
            .await
            .unwrap();
        }

        assert_eq!(db.get_draft("alice").await.unwrap().unwrap().content, "two");
        db.delete_draft("alice").await.unwrap();
        assert!(db.get_draft("alice").await.unwrap().is_none());
        db.delete_draft("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_update_keeps_unset_fields() {
        let db = Database::new_in_memory().unwrap();
        let conv = conversation("alice");
        db.insert_conversation(&conv).await.unwrap();

        assert!(db
            .update_conversation_metadata(&conv.id, "alice", Some("Rust help"), None)
            .await
            .unwrap());
        let stored = db.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Rust help"));
        assert_eq!(stored.model.as_deref(), Some("llama3.1"));

        assert!(!db
            .update_conversation_metadata(&conv.id, "bob", Some("stolen"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");

        let conv = conversation("alice");
        {
            let db = Database::open(&path).unwrap();
            db.insert_conversation(&conv).await.unwrap();
            db.append_message(&conv.id, "alice", Role::User, "persist me")
                .await
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let messages = db.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "persist me");
        assert_eq!(messages[0].position, 0);
    }
}
