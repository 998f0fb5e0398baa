//! # Koi - Two-Tier Conversational Memory for AI Agents
//!
//! Working memory keeps each session's newest messages verbatim and folds
//! older ones into a rolling summary. Long-term memory stores promoted text
//! with embeddings, topics and entities, searchable per namespace.

pub mod config;
pub mod embedding;
pub mod enrichment;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod llm;
pub mod locks;
pub mod long_term;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod summarization;
pub mod tokens;
pub mod types;
pub mod working;

pub use config::{Settings, SettingsBuilder};
pub use embedding::{cosine_similarity, EmbeddingProvider, HashEmbeddingProvider};
pub use enrichment::{Enrichment, EnrichmentPipeline};
pub use error::{MemoryError, Result, UpstreamKind};
pub use extraction::{
    merge_subword_tokens, EntityProvider, ExtractedMemory, LlmEntityProvider, LlmMemoryExtractor,
    LlmTopicProvider, MemoryExtractor, RawEntity, TopicProvider,
};
pub use jobs::SummaryQueue;
pub use llm::{
    completion_client_for, embedding_client_for, AnthropicClient, CompletionProvider,
    ModelClient, OpenAiClient, ProviderKeys,
};
pub use long_term::{memory_id, LongTermIndex, MemoryBackend, SqliteMemoryBackend};
pub use models::{ModelProfile, ModelProvider, DEFAULT_EMBEDDING_MODEL, DEFAULT_GENERATION_MODEL};
pub use orchestrator::{MemoryOrchestrator, Providers};
pub use retry::{retry_transient, RetryPolicy};
pub use store::{open_in_memory_pool, open_pool, SessionStore};
pub use summarization::{SummarizationEngine, SummaryLimits, SummaryOutcome, SummaryState};
pub use tokens::TokenAccountant;
pub use types::{
    Entity, Memory, MemoryId, MemoryMessage, MemoryType, Message, Namespace, NewMemory, Page,
    Role, ScoredMemory, SearchFilters, SearchResults, Session, SessionId, SessionKey, SessionList,
    UserId, WorkingMemoryView,
};
pub use working::WorkingMemoryStore;
