//! Model profiles: context window and embedding size per model name

use serde::{Deserialize, Serialize};

/// Vendor behind a model; selects the adapter, never the core logic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelProvider::OpenAi => write!(f, "openai"),
            ModelProvider::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    pub provider: ModelProvider,
    /// Maximum input size in tokens
    pub max_tokens: usize,
    pub embedding_dimensions: usize,
}

pub const DEFAULT_GENERATION_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

const PROFILES: &[(&str, ModelProvider, usize, usize)] = &[
    ("gpt-3.5-turbo", ModelProvider::OpenAi, 4_096, 1536),
    ("gpt-3.5-turbo-16k", ModelProvider::OpenAi, 16_384, 1536),
    ("gpt-4", ModelProvider::OpenAi, 8_192, 1536),
    ("gpt-4-32k", ModelProvider::OpenAi, 32_768, 1536),
    ("gpt-4o", ModelProvider::OpenAi, 128_000, 1536),
    ("gpt-4o-mini", ModelProvider::OpenAi, 128_000, 1536),
    ("o1", ModelProvider::OpenAi, 200_000, 1536),
    ("o1-mini", ModelProvider::OpenAi, 128_000, 1536),
    ("o3-mini", ModelProvider::OpenAi, 200_000, 1536),
    ("text-embedding-ada-002", ModelProvider::OpenAi, 8_191, 1536),
    ("text-embedding-3-small", ModelProvider::OpenAi, 8_191, 1536),
    ("text-embedding-3-large", ModelProvider::OpenAi, 8_191, 3072),
    ("claude-3-opus-20240229", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-sonnet-20240229", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-haiku-20240307", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-5-sonnet-20240620", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-5-sonnet-20241022", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-5-haiku-20241022", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-7-sonnet-20250219", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-5-sonnet-latest", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-5-haiku-latest", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-7-sonnet-latest", ModelProvider::Anthropic, 200_000, 1536),
    ("claude-3-opus-latest", ModelProvider::Anthropic, 200_000, 1536),
];

impl ModelProfile {
    /// Look up a model by name, falling back to the default generation model
    pub fn lookup(name: &str) -> Self {
        match Self::find(name) {
            Some(profile) => profile,
            None => {
                tracing::warn!(model = name, fallback = DEFAULT_GENERATION_MODEL, "unknown model, using fallback profile");
                Self::find(DEFAULT_GENERATION_MODEL).unwrap_or_else(|| Self {
                    name: DEFAULT_GENERATION_MODEL.to_string(),
                    provider: ModelProvider::OpenAi,
                    max_tokens: 128_000,
                    embedding_dimensions: 1536,
                })
            }
        }
    }

    pub fn find(name: &str) -> Option<Self> {
        PROFILES
            .iter()
            .find(|(n, ..)| *n == name)
            .map(|(n, provider, max_tokens, dims)| Self {
                name: (*n).to_string(),
                provider: *provider,
                max_tokens: *max_tokens,
                embedding_dimensions: *dims,
            })
    }

    /// A profile for a model not in the registry (self-hosted or test models)
    pub fn custom(
        name: impl Into<String>,
        provider: ModelProvider,
        max_tokens: usize,
        embedding_dimensions: usize,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            max_tokens,
            embedding_dimensions,
        }
    }
}
