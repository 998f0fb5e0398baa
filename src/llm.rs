//! Completion and embedding adapters
//!
//! Core code only sees [`CompletionProvider`] and [`EmbeddingProvider`];
//! which vendor sits behind them is decided once, from the model profile,
//! by [`completion_client_for`].

use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result, UpstreamKind};
use crate::models::{ModelProfile, ModelProvider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
}

/// A vendor client offering both completion and embedding
pub trait ModelClient: CompletionProvider + EmbeddingProvider {}

impl<T: CompletionProvider + EmbeddingProvider> ModelClient for T {}

/// Credentials and endpoints for the HTTP adapters
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
}

/// Pick the completion adapter for a model profile
pub fn completion_client_for(
    profile: &ModelProfile,
    keys: &ProviderKeys,
) -> Result<Arc<dyn CompletionProvider>> {
    match profile.provider {
        ModelProvider::OpenAi => Ok(Arc::new(openai_client(keys, profile)?)),
        ModelProvider::Anthropic => {
            let api_key = keys.anthropic_api_key.clone().ok_or_else(|| {
                MemoryError::Configuration("Anthropic API key is required".into())
            })?;
            Ok(Arc::new(AnthropicClient::new(api_key)))
        }
    }
}

/// Pick the embedding adapter for a model profile
pub fn embedding_client_for(
    profile: &ModelProfile,
    keys: &ProviderKeys,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match profile.provider {
        ModelProvider::OpenAi => Ok(Arc::new(openai_client(keys, profile)?)),
        ModelProvider::Anthropic => Err(MemoryError::Configuration(format!(
            "{} does not provide embeddings",
            profile.provider
        ))),
    }
}

fn openai_client(keys: &ProviderKeys, profile: &ModelProfile) -> Result<OpenAiClient> {
    let api_key = keys
        .openai_api_key
        .clone()
        .ok_or_else(|| MemoryError::Configuration("OpenAI API key is required".into()))?;
    let mut client = OpenAiClient::new(api_key)
        .with_embedding_model(profile.name.clone(), profile.embedding_dimensions);
    if let Some(url) = &keys.openai_base_url {
        client = client.with_base_url(url.clone());
    }
    Ok(client)
}

fn build_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_default()
}

/// 408, 429 and 5xx are worth retrying; other failures are not
pub fn classify_status(status: u16) -> UpstreamKind {
    match status {
        408 | 429 | 500..=599 => UpstreamKind::Transient,
        _ => UpstreamKind::Permanent,
    }
}

fn transport_error(service: &'static str, e: reqwest::Error) -> MemoryError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        MemoryError::transient(service, e.to_string())
    } else {
        MemoryError::permanent(service, e.to_string())
    }
}

async fn check_status(service: &'static str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // Keep error bodies short; they can be large or echo the prompt.
    const MAX_ERROR_BODY: usize = 512;
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("... [truncated]");
    }

    Err(MemoryError::Upstream {
        service,
        kind: classify_status(status.as_u16()),
        message: format!("HTTP {}: {}", status.as_u16(), body),
    })
}

// ─── OpenAI ──────────────────────────────────────────────────────────────────

/// OpenAI (or API-compatible) client: chat completions and embeddings
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    embedding_model: String,
    embedding_dimensions: usize,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
        }
    }

    /// Set custom base URL (for API-compatible services)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_dimensions = dimensions;
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

fn parse_chat_response(service: &'static str, response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| MemoryError::permanent(service, "response contained no message content"))
}

fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(MemoryError::permanent(
            "embedding",
            format!("expected {expected} embeddings, got {}", data.len()),
        ));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("completion", e))?;

        let parsed: ChatResponse = check_status("completion", response)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::permanent("completion", e.to_string()))?;

        parse_chat_response("completion", parsed)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.embedding_dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        const BATCH_SIZE: usize = 20;
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(BATCH_SIZE) {
            let response = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&EmbeddingRequest {
                    model: &self.embedding_model,
                    input: batch,
                })
                .send()
                .await
                .map_err(|e| transport_error("embedding", e))?;

            let parsed: EmbeddingResponse = check_status("embedding", response)
                .await?
                .json()
                .await
                .map_err(|e| MemoryError::permanent("embedding", e.to_string()))?;

            embeddings.extend(order_embeddings(parsed.data, batch.len())?);
        }

        Ok(embeddings)
    }
}

// ─── Anthropic ───────────────────────────────────────────────────────────────

/// Anthropic messages API; completion only
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_output_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            max_output_tokens: 1024,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let request = AnthropicRequest {
            model,
            max_tokens: self.max_output_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("completion", e))?;

        let parsed: AnthropicResponse = check_status("completion", response)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::permanent("completion", e.to_string()))?;

        parsed
            .content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| MemoryError::permanent("completion", "response contained no text"))
    }
}
