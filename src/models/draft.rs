use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}
