use async_trait::async_trait;

use super::types::{ByteStream, ChatRequest, ModelInfo, ProviderError};

/// The inference server as seen by a turn: a request goes in, a chunked
/// line-delimited byte stream comes out.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    async fn stream_chat(&self, request: ChatRequest) -> Result<ByteStream, ProviderError>;
}
