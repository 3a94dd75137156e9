use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{AppendReceipt, Conversation, Draft, Message, Role};
use crate::services::database::{self, Database};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint fired. For positions this means the
    /// sequencing lock was bypassed somewhere.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => LedgerError::NotFound(err.to_string()),
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LedgerError::Conflict(err.to_string())
            }
            _ => LedgerError::Unavailable(err.to_string()),
        }
    }
}

/// Storage operations a conversation turn depends on.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<Conversation, LedgerError>;

    async fn conversation(&self, id: &str, user_id: &str) -> Result<Conversation, LedgerError>;

    async fn list_messages(&self, id: &str, user_id: &str) -> Result<Vec<Message>, LedgerError>;

    async fn append(
        &self,
        id: &str,
        user_id: &str,
        role: Role,
        content: &str,
    ) -> Result<AppendReceipt, LedgerError>;

    async fn update_metadata(
        &self,
        id: &str,
        user_id: &str,
        title: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), LedgerError>;

    async fn delete_conversation(&self, id: &str, user_id: &str) -> Result<(), LedgerError>;

    async fn clear_draft(&self, user_id: &str) -> Result<(), LedgerError>;
}

/// One async mutex per conversation id. Appends to the same conversation
/// queue up here; appends to different conversations never touch each
/// other's lock.
#[derive(Debug, Default, Clone)]
pub struct SequenceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SequenceLocks {
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry once nobody holds or waits on it, so the map only
    /// tracks conversations with appends in flight.
    pub fn release(&self, conversation_id: &str) {
        self.locks
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn forget(&self, conversation_id: &str) {
        self.locks.remove(conversation_id);
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
    locks: SequenceLocks,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: SequenceLocks::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, LedgerError> {
        self.db.list_conversations(user_id).await
    }

    pub async fn save_draft(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
    ) -> Result<(), LedgerError> {
        let draft = Draft {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(|s| s.to_string()),
            content: content.to_string(),
            updated_at: database::now(),
        };
        self.db.save_draft(&draft).await
    }

    pub async fn draft(&self, user_id: &str) -> Result<Option<Draft>, LedgerError> {
        self.db.get_draft(user_id).await
    }
}

#[async_trait]
impl ConversationStore for Ledger {
    async fn create_conversation(
        &self,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<Conversation, LedgerError> {
        let now = database::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: None,
            model: model.map(|s| s.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.db.insert_conversation(&conversation).await?;
        tracing::debug!(conversation_id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    async fn conversation(&self, id: &str, user_id: &str) -> Result<Conversation, LedgerError> {
        match self.db.get_conversation(id).await? {
            Some(conv) if conv.user_id == user_id => Ok(conv),
            _ => Err(LedgerError::NotFound(format!("conversation {}", id))),
        }
    }

    async fn list_messages(&self, id: &str, user_id: &str) -> Result<Vec<Message>, LedgerError> {
        self.conversation(id, user_id).await?;
        self.db.list_messages(id).await
    }

    async fn append(
        &self,
        id: &str,
        user_id: &str,
        role: Role,
        content: &str,
    ) -> Result<AppendReceipt, LedgerError> {
        let guard = self.locks.acquire(id).await;
        let result = self.db.append_message(id, user_id, role, content).await;
        drop(guard);
        self.locks.release(id);
        let receipt = result?;
        tracing::debug!(
            conversation_id = id,
            position = receipt.position,
            role = role.as_str(),
            "Appended message"
        );
        Ok(receipt)
    }

    async fn update_metadata(
        &self,
        id: &str,
        user_id: &str,
        title: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), LedgerError> {
        if self
            .db
            .update_conversation_metadata(id, user_id, title, model)
            .await?
        {
            Ok(())
        } else {
            Err(LedgerError::NotFound(format!("conversation {}", id)))
        }
    }

    async fn delete_conversation(&self, id: &str, user_id: &str) -> Result<(), LedgerError> {
        let removed = self.db.delete_conversation(id, user_id).await?;
        self.locks.forget(id);
        if removed {
            Ok(())
        } else {
            Err(LedgerError::NotFound(format!("conversation {}", id)))
        }
    }

    async fn clear_draft(&self, user_id: &str) -> Result<(), LedgerError> {
        self.db.delete_draft(user_id).await
    }
}
