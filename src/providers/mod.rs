pub mod ollama;
pub mod traits;
pub mod types;

pub use ollama::{decode_stream, FrameDecoder, OllamaProvider};
pub use traits::InferenceBackend;
pub use types::{
    ByteStream, ChatMessage, ChatOptions, ChatRequest, ImageAttachment, ModelInfo, ProviderError,
    StreamEvent,
};
