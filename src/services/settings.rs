use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::continuation::{ContinuationPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_TAIL_CHARS};
use super::conversation::DEFAULT_TITLE_CHARS;
use super::database::Database;
use super::session::SessionConfig;
use crate::config::DEFAULT_MODEL;
use crate::providers::ChatOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub default_model: String,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub stream_batch_ms: u64,
    pub continuation_tail_chars: usize,
    pub continuation_attempts: u32,
    pub title_chars: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            temperature: None,
            system_prompt: None,
            stream_batch_ms: 50,
            continuation_tail_chars: DEFAULT_TAIL_CHARS,
            continuation_attempts: DEFAULT_MAX_ATTEMPTS,
            title_chars: DEFAULT_TITLE_CHARS,
        }
    }
}

impl AppSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            batch_interval: Duration::from_millis(self.stream_batch_ms.max(1)),
            continuation: ContinuationPolicy {
                max_attempts: self.continuation_attempts,
                tail_chars: self.continuation_tail_chars,
            },
            title_chars: self.title_chars,
            system_prompt: self
                .system_prompt
                .clone()
                .filter(|s| !s.trim().is_empty()),
            options: ChatOptions {
                temperature: self.temperature,
            },
        }
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> AppSettings {
        match db.get_setting("app_settings").await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings: {}", e);
                AppSettings::default()
            }),
            Ok(None) => AppSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to load settings, using defaults: {}", e);
                AppSettings::default()
            }
        }
    }

    pub async fn save(db: &Database, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        db.set_setting("app_settings", &json).await?;
        Ok(())
    }
}
