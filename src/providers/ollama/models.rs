use serde::{Deserialize, Serialize};

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>, // base64
}

#[derive(Debug, Serialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

// --- Streaming types ---

/// One NDJSON record. Chat responses carry `message.content`, generate
/// responses carry `response`; every field is optional on the wire.
#[derive(Debug, Deserialize)]
pub struct OllamaStreamChunk {
    #[serde(default)]
    pub message: Option<OllamaChunkMessage>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChunkMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl OllamaStreamChunk {
    pub fn fragment(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .or(self.response.as_deref())
    }
}

// --- Model list ---

#[derive(Debug, Deserialize)]
pub struct OllamaTagList {
    #[serde(default)]
    pub models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaTag {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

// --- Error types ---

#[derive(Debug, Deserialize)]
pub struct OllamaErrorResponse {
    pub error: String,
}
