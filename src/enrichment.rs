//! Topic and entity metadata for text entering long-term memory

use crate::extraction::{merge_subword_tokens, EntityProvider, TopicProvider};
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::Entity;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Metadata derived for one piece of text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub topics: BTreeSet<String>,
    pub entities: BTreeSet<Entity>,
}

/// Runs topic and NER extraction side by side.
///
/// Never fails: a sub-call that errors after retries contributes an empty
/// set and a warning, so promotion always proceeds.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    topics: Option<Arc<dyn TopicProvider>>,
    entities: Option<Arc<dyn EntityProvider>>,
    top_k_topics: usize,
    retry: RetryPolicy,
}

impl EnrichmentPipeline {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            topics: None,
            entities: None,
            top_k_topics: 3,
            retry,
        }
    }

    /// Pipeline that attaches no metadata
    pub fn disabled() -> Self {
        Self::new(RetryPolicy::default())
    }

    pub fn with_topics(mut self, provider: Arc<dyn TopicProvider>, top_k: usize) -> Self {
        self.topics = Some(provider);
        self.top_k_topics = top_k;
        self
    }

    pub fn with_entities(mut self, provider: Arc<dyn EntityProvider>) -> Self {
        self.entities = Some(provider);
        self
    }

    pub async fn enrich(&self, text: &str) -> Enrichment {
        let (topics, entities) = tokio::join!(self.extract_topics(text), self.extract_entities(text));
        Enrichment { topics, entities }
    }

    async fn extract_topics(&self, text: &str) -> BTreeSet<String> {
        let Some(provider) = &self.topics else {
            return BTreeSet::new();
        };
        if self.top_k_topics == 0 {
            return BTreeSet::new();
        }

        let top_k = self.top_k_topics;
        match retry_transient(&self.retry, "topic extraction", move || provider.topics(text, top_k)).await
        {
            Ok(topics) => topics.into_iter().take(top_k).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "topic extraction failed, storing memory without topics");
                BTreeSet::new()
            }
        }
    }

    async fn extract_entities(&self, text: &str) -> BTreeSet<Entity> {
        let Some(provider) = &self.entities else {
            return BTreeSet::new();
        };

        match retry_transient(&self.retry, "entity extraction", move || provider.entities(text)).await {
            Ok(raw) => merge_subword_tokens(raw).into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "entity extraction failed, storing memory without entities");
                BTreeSet::new()
            }
        }
    }
}

impl std::fmt::Debug for EnrichmentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentPipeline")
            .field("topics", &self.topics.is_some())
            .field("entities", &self.entities.is_some())
            .field("top_k_topics", &self.top_k_topics)
            .finish()
    }
}
