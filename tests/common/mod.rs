#![allow(dead_code)]

use async_trait::async_trait;
use koi::{
    CompletionProvider, EntityProvider, ExtractedMemory, HashEmbeddingProvider, MemoryError,
    MemoryExtractor, MemoryOrchestrator, MemoryType, Providers, RawEntity, Result, Settings,
    TopicProvider,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the scripted summarizer answers
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Short summary naming how many lines it absorbed
    Summarize,
    /// Summary that repeats every absorbed line, earlier summaries included
    Transcript,
    FailPermanently,
}

/// Completion fake that records calls and overlapping calls
pub struct ScriptedCompletion {
    script: Script,
    delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, _model: &str, prompt: &str) -> Result<String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let absorbed = prompt
            .lines()
            .filter(|l| l.starts_with("user:") || l.starts_with("assistant:"));
        match self.script {
            Script::Summarize => Ok(format!("earlier: {} lines", absorbed.count())),
            Script::Transcript => Ok(absorbed.collect::<Vec<_>>().join("; ")),
            Script::FailPermanently => Err(MemoryError::permanent("completion", "model rejected request")),
        }
    }
}

/// Topics are the known keywords the text mentions
pub struct KeywordTopics;

#[async_trait]
impl TopicProvider for KeywordTopics {
    async fn topics(&self, text: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(["refund", "shipping", "billing", "weather"]
            .into_iter()
            .filter(|k| text.to_lowercase().contains(k))
            .take(top_k)
            .map(str::to_string)
            .collect())
    }
}

/// Capitalized words are entities; splits "Amsterdam" into sub-word pieces
pub struct CapitalizedNer;

#[async_trait]
impl EntityProvider for CapitalizedNer {
    async fn entities(&self, text: &str) -> Result<Vec<RawEntity>> {
        let mut out = Vec::new();
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word == "Amsterdam" {
                for piece in ["Ams", "##ter", "##dam"] {
                    out.push(RawEntity {
                        text: piece.to_string(),
                        entity_type: "LOC".to_string(),
                        span: None,
                    });
                }
            } else if word.chars().next().is_some_and(char::is_uppercase) {
                out.push(RawEntity {
                    text: word.to_string(),
                    entity_type: "MISC".to_string(),
                    span: None,
                });
            }
        }
        Ok(out)
    }
}

/// Restates "user: ..." lines as a semantic fact about the user
pub struct UserFacts;

#[async_trait]
impl MemoryExtractor for UserFacts {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedMemory>> {
        Ok(text
            .strip_prefix("user: I ")
            .map(|rest| ExtractedMemory {
                memory_type: MemoryType::Semantic,
                text: format!("User {rest}"),
            })
            .into_iter()
            .collect())
    }
}

pub fn providers(completion: Arc<ScriptedCompletion>) -> Providers {
    Providers::new(completion, Arc::new(HashEmbeddingProvider::default()))
        .with_topics(Arc::new(KeywordTopics))
        .with_entities(Arc::new(CapitalizedNer))
}

/// Route library logs to the test harness; `RUST_LOG=koi=debug` shows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn orchestrator(settings: Settings, completion: Arc<ScriptedCompletion>) -> MemoryOrchestrator {
    init_tracing();
    MemoryOrchestrator::in_memory(settings, providers(completion))
        .await
        .expect("in-memory orchestrator")
}

/// Poll `check` until it holds; background promotion has no completion signal
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
