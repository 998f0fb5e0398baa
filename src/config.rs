//! Immutable settings injected into the orchestrator at construction

use crate::error::{MemoryError, Result};
use crate::models::{ModelProfile, DEFAULT_EMBEDDING_MODEL, DEFAULT_GENERATION_MODEL};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Memory engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Newest messages kept verbatim in working memory
    pub window_size: usize,
    /// Explicit token budget; derived from the generation model when unset
    pub token_budget: Option<usize>,
    /// Fraction of the generation model's context window used as budget
    pub summarization_threshold: f32,
    /// Promote evicted messages into long-term memory
    pub long_term_memory: bool,
    pub enable_topic_extraction: bool,
    pub enable_ner: bool,
    /// Distill promoted messages into episodic and semantic memories
    pub enable_discrete_memory_extraction: bool,
    pub top_k_topics: usize,
    pub generation_model: String,
    pub embedding_model: String,
    pub max_summarization_iterations: u32,
    /// Background summarization workers
    pub summary_workers: usize,
    pub lock_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub default_search_limit: usize,
    /// Long-term memories included by `memory_prompt`
    pub prompt_memory_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_size: 20,
            token_budget: None,
            summarization_threshold: 0.7,
            long_term_memory: false,
            enable_topic_extraction: true,
            enable_ner: true,
            enable_discrete_memory_extraction: true,
            top_k_topics: 3,
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_summarization_iterations: 5,
            summary_workers: 2,
            lock_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            default_search_limit: 10,
            prompt_memory_limit: 5,
        }
    }
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    pub fn generation_profile(&self) -> ModelProfile {
        ModelProfile::lookup(&self.generation_model)
    }

    pub fn embedding_profile(&self) -> ModelProfile {
        ModelProfile::lookup(&self.embedding_model)
    }

    /// Max combined tokens of context plus retained messages
    pub fn effective_token_budget(&self) -> usize {
        self.token_budget.unwrap_or_else(|| {
            let window = self.generation_profile().max_tokens as f32;
            (window * self.summarization_threshold) as usize
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(MemoryError::Configuration(
                "window_size must be at least 1".into(),
            ));
        }
        if self.effective_token_budget() == 0 {
            return Err(MemoryError::Configuration(
                "token budget must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.summarization_threshold) {
            return Err(MemoryError::Configuration(format!(
                "summarization_threshold {} outside 0.0..=1.0",
                self.summarization_threshold
            )));
        }
        if self.summary_workers == 0 {
            return Err(MemoryError::Configuration(
                "summary_workers must be at least 1".into(),
            ));
        }
        if self.max_summarization_iterations == 0 {
            return Err(MemoryError::Configuration(
                "max_summarization_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Settings`]
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn window_size(mut self, window_size: usize) -> Self {
        self.settings.window_size = window_size;
        self
    }

    pub fn token_budget(mut self, budget: usize) -> Self {
        self.settings.token_budget = Some(budget);
        self
    }

    pub fn summarization_threshold(mut self, threshold: f32) -> Self {
        self.settings.summarization_threshold = threshold;
        self
    }

    pub fn long_term_memory(mut self, enabled: bool) -> Self {
        self.settings.long_term_memory = enabled;
        self
    }

    pub fn enable_topic_extraction(mut self, enabled: bool) -> Self {
        self.settings.enable_topic_extraction = enabled;
        self
    }

    pub fn enable_ner(mut self, enabled: bool) -> Self {
        self.settings.enable_ner = enabled;
        self
    }

    pub fn enable_discrete_memory_extraction(mut self, enabled: bool) -> Self {
        self.settings.enable_discrete_memory_extraction = enabled;
        self
    }

    pub fn top_k_topics(mut self, k: usize) -> Self {
        self.settings.top_k_topics = k;
        self
    }

    pub fn generation_model(mut self, model: impl Into<String>) -> Self {
        self.settings.generation_model = model.into();
        self
    }

    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.settings.embedding_model = model.into();
        self
    }

    pub fn max_summarization_iterations(mut self, iterations: u32) -> Self {
        self.settings.max_summarization_iterations = iterations;
        self
    }

    pub fn summary_workers(mut self, workers: usize) -> Self {
        self.settings.summary_workers = workers;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.settings.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    pub fn default_search_limit(mut self, limit: usize) -> Self {
        self.settings.default_search_limit = limit;
        self
    }

    pub fn prompt_memory_limit(mut self, limit: usize) -> Self {
        self.settings.prompt_memory_limit = limit;
        self
    }

    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
