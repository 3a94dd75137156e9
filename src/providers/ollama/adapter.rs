use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use url::Url;

use super::models::*;
use crate::providers::traits::InferenceBackend;
use crate::providers::types::{
    ByteStream, ChatMessage, ChatRequest, ModelInfo, ProviderError,
};

pub struct OllamaProvider {
    client: Client,
    base_url: Url,
}

impl OllamaProvider {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::RequestFailed(format!("Invalid base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::RequestFailed(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn build_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);

        if let Some(prompt) = system_prompt {
            if !prompt.trim().is_empty() {
                result.push(OllamaMessage {
                    role: "system".to_string(),
                    content: prompt.to_string(),
                    images: Vec::new(),
                });
            }
        }

        for msg in messages {
            result.push(OllamaMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                images: msg
                    .images
                    .iter()
                    .map(|img| base64::engine::general_purpose::STANDARD.encode(&img.data))
                    .collect(),
            });
        }

        result
    }

    fn build_request(request: &ChatRequest) -> OllamaChatRequest {
        let options = request.options.temperature.map(|temperature| OllamaOptions {
            temperature: Some(temperature),
        });

        OllamaChatRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request.system_prompt.as_deref(), &request.messages),
            stream: true,
            options,
        }
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OllamaErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::RequestFailed(Self::parse_error_message(
            status, &body,
        )))
    }
}

#[async_trait]
impl InferenceBackend for OllamaProvider {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = self.endpoint("api/tags")?;

        let response = self.client.get(url).send().await.map_err(|e| {
            ProviderError::NetworkError(format!("Failed to connect to {}: {}", self.base_url, e))
        })?;
        let response = Self::check_status(response).await?;

        let tags: OllamaTagList = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
                modified_at: m.modified_at,
            })
            .collect())
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ByteStream, ProviderError> {
        let url = self.endpoint("api/chat")?;
        let body = Self::build_request(&request);

        tracing::debug!(
            model = %request.model,
            messages = body.messages.len(),
            "Sending streaming chat request"
        );

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        let response = Self::check_status(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProviderError::NetworkError(e.to_string())))
            .boxed())
    }
}
