//! Memory orchestrator: the entry point tying both memory tiers together
//!
//! ```text
//! add_messages ─► WorkingMemoryStore (durable append)
//!                    │ over window or budget
//!                    ▼
//!               SummaryQueue ─► SummarizationEngine ─► LongTermIndex (promotion)
//!
//! get_memory / memory_prompt ─► WorkingMemoryStore + LongTermIndex
//! ```

use crate::config::Settings;
use crate::embedding::EmbeddingProvider;
use crate::enrichment::EnrichmentPipeline;
use crate::error::{MemoryError, Result};
use crate::extraction::{
    EntityProvider, LlmEntityProvider, LlmMemoryExtractor, LlmTopicProvider, MemoryExtractor,
    TopicProvider,
};
use crate::jobs::SummaryQueue;
use crate::llm::CompletionProvider;
use crate::long_term::{LongTermIndex, SqliteMemoryBackend};
use crate::store::{open_in_memory_pool, open_pool, SessionStore};
use crate::summarization::{SummarizationEngine, SummaryLimits, SummaryState};
use crate::tokens::TokenAccountant;
use crate::types::{
    Memory, MemoryId, MemoryMessage, NewMemory, Page, SearchFilters, SearchResults, Session,
    SessionKey, SessionList, WorkingMemoryView,
};
use crate::working::WorkingMemoryStore;
use sqlx::SqlitePool;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// External services the orchestrator depends on
#[derive(Clone)]
pub struct Providers {
    pub completion: Arc<dyn CompletionProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub topics: Option<Arc<dyn TopicProvider>>,
    pub entities: Option<Arc<dyn EntityProvider>>,
    pub memories: Option<Arc<dyn MemoryExtractor>>,
}

impl Providers {
    pub fn new(
        completion: Arc<dyn CompletionProvider>,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            completion,
            embedding,
            topics: None,
            entities: None,
            memories: None,
        }
    }

    pub fn with_topics(mut self, provider: Arc<dyn TopicProvider>) -> Self {
        self.topics = Some(provider);
        self
    }

    pub fn with_entities(mut self, provider: Arc<dyn EntityProvider>) -> Self {
        self.entities = Some(provider);
        self
    }

    pub fn with_memory_extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.memories = Some(extractor);
        self
    }

    /// Use the completion model for topic, entity and discrete-memory extraction
    pub fn with_llm_extraction(self, model: &str) -> Self {
        let topics = Arc::new(LlmTopicProvider::new(self.completion.clone(), model));
        let entities = Arc::new(LlmEntityProvider::new(self.completion.clone(), model));
        let memories = Arc::new(LlmMemoryExtractor::new(self.completion.clone(), model));
        self.with_topics(topics)
            .with_entities(entities)
            .with_memory_extractor(memories)
    }
}

pub struct MemoryOrchestrator {
    settings: Arc<Settings>,
    working: WorkingMemoryStore,
    long_term: LongTermIndex,
    engine: Arc<SummarizationEngine>,
    queue: SummaryQueue,
}

impl MemoryOrchestrator {
    /// Open (or create) the database under `data_dir`
    pub async fn open(
        settings: Settings,
        providers: Providers,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        settings.validate()?;
        tokio::fs::create_dir_all(data_dir.as_ref()).await?;
        let pool = open_pool(data_dir.as_ref().join("koi.db")).await?;
        tracing::info!(data_dir = %data_dir.as_ref().display(), "opened memory store");
        Ok(Self::from_pool(settings, providers, pool))
    }

    /// Non-persistent orchestrator, for tests and ephemeral agents
    pub async fn in_memory(settings: Settings, providers: Providers) -> Result<Self> {
        settings.validate()?;
        let pool = open_in_memory_pool().await?;
        Ok(Self::from_pool(settings, providers, pool))
    }

    /// Build on an already migrated pool; must be called inside a Tokio runtime
    pub fn from_pool(settings: Settings, providers: Providers, pool: SqlitePool) -> Self {
        let accountant = TokenAccountant::new(settings.generation_profile());
        let working =
            WorkingMemoryStore::new(SessionStore::new(pool.clone()), accountant, settings.lock_timeout());

        let mut enrichment = EnrichmentPipeline::new(settings.retry.clone());
        if settings.enable_topic_extraction {
            if let Some(topics) = providers.topics.clone() {
                enrichment = enrichment.with_topics(topics, settings.top_k_topics);
            }
        }
        if settings.enable_ner {
            if let Some(entities) = providers.entities.clone() {
                enrichment = enrichment.with_entities(entities);
            }
        }

        let mut long_term = LongTermIndex::new(
            Arc::new(SqliteMemoryBackend::new(pool)),
            providers.embedding.clone(),
            enrichment,
            settings.retry.clone(),
        );
        if settings.enable_discrete_memory_extraction {
            if let Some(extractor) = providers.memories.clone() {
                long_term = long_term.with_extractor(extractor);
            }
        }

        let mut engine = SummarizationEngine::new(
            working.clone(),
            providers.completion.clone(),
            settings.generation_model.clone(),
            SummaryLimits {
                window_size: settings.window_size,
                token_budget: settings.effective_token_budget(),
                max_iterations: settings.max_summarization_iterations,
            },
            settings.retry.clone(),
        );
        if settings.long_term_memory {
            engine = engine.with_promotion(long_term.clone());
        }
        let engine = Arc::new(engine);
        let queue = SummaryQueue::start(Arc::clone(&engine), settings.summary_workers);

        tracing::debug!(
            window_size = settings.window_size,
            token_budget = settings.effective_token_budget(),
            long_term_memory = settings.long_term_memory,
            "memory orchestrator ready"
        );

        Self {
            settings: Arc::new(settings),
            working,
            long_term,
            engine,
            queue,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Durably append messages, queueing summarization when the session
    /// outgrows its window or budget. Returns once the append is stored.
    pub async fn add_messages(
        &self,
        namespace: &str,
        session_id: &str,
        messages: &[MemoryMessage],
        context: Option<&str>,
    ) -> Result<WorkingMemoryView> {
        let key = session_key(namespace, session_id)?;
        if messages.is_empty() && context.is_none() {
            return Err(MemoryError::Validation("no messages to add".into()));
        }

        let token_count = self.working.append(&key, messages, context).await?;
        let session = match self.working.read(&key).await {
            Ok(session) => session,
            // Deleted right after the append; nothing left to summarize.
            Err(MemoryError::NotFound(_)) => return Ok(self.empty_view(&key)),
            Err(e) => return Err(e),
        };

        if self.engine.needs_summary(token_count, session.messages.len()) {
            let queued = self.queue.enqueue(&key);
            tracing::debug!(
                namespace,
                session_id,
                tokens = token_count,
                messages = session.messages.len(),
                queued,
                "summarization triggered"
            );
        }

        Ok(self.view(&key, session))
    }

    /// Current working memory; an unknown session reads as empty
    pub async fn get_memory(&self, namespace: &str, session_id: &str) -> Result<WorkingMemoryView> {
        let key = session_key(namespace, session_id)?;
        let view = self.read_view(&key).await?;
        if let Err(e) = self.working.touch(&key).await {
            tracing::warn!(namespace, session_id, error = %e, "failed to record session access");
        }
        Ok(view)
    }

    async fn read_view(&self, key: &SessionKey) -> Result<WorkingMemoryView> {
        match self.working.read(key).await {
            Ok(session) => Ok(self.view(key, session)),
            Err(MemoryError::NotFound(_)) => Ok(self.empty_view(key)),
            Err(e) => Err(e),
        }
    }

    /// Clear a session's working memory. Promoted memories are kept.
    pub async fn delete_memory(&self, namespace: &str, session_id: &str) -> Result<()> {
        let key = session_key(namespace, session_id)?;
        self.working.delete(&key).await?;
        self.queue.forget(&key);
        tracing::debug!(namespace, session_id, "deleted working memory");
        Ok(())
    }

    pub async fn list_sessions(&self, namespace: &str, page: Page) -> Result<SessionList> {
        require_non_empty("namespace", namespace)?;
        self.working.list_sessions(namespace, page).await
    }

    /// Similarity search over long-term memory in `namespace`
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        filters: &SearchFilters,
        page: Page,
    ) -> Result<SearchResults> {
        require_non_empty("namespace", namespace)?;
        Ok(self.long_term.search(namespace, query, filters, page).await)
    }

    /// Compose a prompt from the session's context, its recent messages and
    /// the most relevant long-term memories, followed by `query`.
    pub async fn memory_prompt(
        &self,
        namespace: &str,
        session_id: Option<&str>,
        query: &str,
    ) -> Result<String> {
        require_non_empty("namespace", namespace)?;
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query is empty".into()));
        }

        let mut prompt = String::new();

        if let Some(session_id) = session_id {
            let memory = self.read_view(&session_key(namespace, session_id)?).await?;
            if let Some(context) = memory.context.as_deref().filter(|c| !c.is_empty()) {
                let _ = writeln!(prompt, "## Summary of earlier conversation\n{context}\n");
            }
            if !memory.messages.is_empty() {
                prompt.push_str("## Recent messages\n");
                for message in &memory.messages {
                    let _ = writeln!(prompt, "{}: {}", message.role, message.content);
                }
                prompt.push('\n');
            }
        }

        let limit = self.settings.prompt_memory_limit;
        if limit > 0 {
            let results = self
                .long_term
                .search(namespace, query, &SearchFilters::default(), Page::first(limit))
                .await;
            if !results.is_empty() {
                prompt.push_str("## Relevant long-term memories\n");
                for hit in &results.memories {
                    let _ = writeln!(prompt, "- {}", hit.memory.text);
                }
                prompt.push('\n');
            }
        }

        let _ = write!(prompt, "## Query\n{query}");
        Ok(prompt)
    }

    /// Explicitly promote texts into long-term memory
    pub async fn create_long_term_memories(
        &self,
        namespace: &str,
        memories: &[NewMemory],
    ) -> Result<Vec<MemoryId>> {
        require_non_empty("namespace", namespace)?;
        self.long_term.create_many(namespace, memories).await
    }

    pub async fn get_long_term_memory(&self, namespace: &str, id: &str) -> Result<Memory> {
        self.long_term.get(namespace, id).await
    }

    pub async fn delete_long_term_memory(&self, namespace: &str, id: &str) -> Result<()> {
        self.long_term.delete(namespace, id).await
    }

    pub fn summary_state(&self, namespace: &str, session_id: &str) -> SummaryState {
        self.queue.state(&SessionKey::new(namespace, session_id))
    }

    /// Wait for every queued summarization job to finish
    pub async fn wait_for_summaries(&self) {
        self.queue.wait_idle().await;
    }

    fn view(&self, key: &SessionKey, session: Session) -> WorkingMemoryView {
        let budget = self.settings.effective_token_budget().max(1);
        let token_count = session.last_token_count;
        WorkingMemoryView {
            messages: session.messages,
            context: session.context,
            token_count,
            pending: self.queue.is_pending(key),
            context_percentage_used: (token_count as f32 / budget as f32) * 100.0,
            last_summary_error: self.queue.last_error(key),
        }
    }

    fn empty_view(&self, key: &SessionKey) -> WorkingMemoryView {
        WorkingMemoryView {
            pending: self.queue.is_pending(key),
            ..WorkingMemoryView::default()
        }
    }
}

impl std::fmt::Debug for MemoryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOrchestrator")
            .field("settings", &self.settings)
            .field("long_term", &self.long_term)
            .field("queue", &self.queue)
            .finish()
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn session_key(namespace: &str, session_id: &str) -> Result<SessionKey> {
    require_non_empty("namespace", namespace)?;
    require_non_empty("session_id", session_id)?;
    Ok(SessionKey::new(namespace, session_id))
}
