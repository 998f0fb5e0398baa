//! Recursive summarization of working memory
//!
//! Each pass keeps the newest messages that fit the window and the token
//! budget, folds the rest (plus the previous context) into a new context via
//! the completion service, and commits both atomically. Passes repeat until
//! the session fits, the iteration cap is hit, or a pass fails to reduce the
//! token count.

use crate::error::{MemoryError, Result};
use crate::llm::CompletionProvider;
use crate::long_term::LongTermIndex;
use crate::retry::{retry_transient, RetryPolicy};
use crate::tokens::TokenAccountant;
use crate::types::{Message, Session, SessionKey};
use crate::working::WorkingMemoryStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Summarization status of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum SummaryState {
    Idle,
    Summarizing,
    /// Last job aborted; the session may still be over budget
    Failed(String),
}

/// Result of one summarization job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    Completed { iterations: u32, token_count: usize },
    /// A lone oversized message was cut to fit the budget
    Truncated { token_count: usize },
    /// Session already fit
    NotNeeded,
    /// Session was deleted or recreated while the job ran
    Discarded,
}

/// Limits for a summarization job
#[derive(Debug, Clone)]
pub struct SummaryLimits {
    pub window_size: usize,
    pub token_budget: usize,
    pub max_iterations: u32,
}

#[derive(Clone)]
pub struct SummarizationEngine {
    working: WorkingMemoryStore,
    completion: Arc<dyn CompletionProvider>,
    model: String,
    limits: SummaryLimits,
    retry: RetryPolicy,
    promotion: Option<LongTermIndex>,
}

impl SummarizationEngine {
    pub fn new(
        working: WorkingMemoryStore,
        completion: Arc<dyn CompletionProvider>,
        model: impl Into<String>,
        limits: SummaryLimits,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            working,
            completion,
            model: model.into(),
            limits,
            retry,
            promotion: None,
        }
    }

    /// Promote every evicted batch into this index
    pub fn with_promotion(mut self, index: LongTermIndex) -> Self {
        self.promotion = Some(index);
        self
    }

    /// Whether a session with this state needs summarizing
    pub fn needs_summary(&self, token_count: usize, message_count: usize) -> bool {
        token_count > self.limits.token_budget || message_count > self.limits.window_size
    }

    pub async fn summarize(&self, key: &SessionKey) -> Result<SummaryOutcome> {
        let accountant = self.working.accountant();
        let mut iterations = 0;
        let mut truncated = false;

        loop {
            let session = match self.working.read(key).await {
                Ok(session) => session,
                Err(MemoryError::NotFound(_)) => return Ok(SummaryOutcome::Discarded),
                Err(e) => return Err(e),
            };
            let tokens = accountant.count(&session.messages, session.context.as_deref())?;

            if !self.needs_summary(tokens, session.messages.len()) {
                return Ok(if truncated {
                    SummaryOutcome::Truncated { token_count: tokens }
                } else if iterations == 0 {
                    SummaryOutcome::NotNeeded
                } else {
                    SummaryOutcome::Completed {
                        iterations,
                        token_count: tokens,
                    }
                });
            }

            if iterations >= self.limits.max_iterations {
                return Err(MemoryError::permanent(
                    "completion",
                    format!(
                        "session {key} still at {tokens} tokens after {iterations} summarization passes"
                    ),
                ));
            }
            iterations += 1;

            let retain = retained_count(
                accountant,
                &session,
                self.limits.window_size,
                self.limits.token_budget,
            )?;
            let split = session.messages.len() - retain;
            let (evict, kept) = session.messages.split_at(split);

            if evict.is_empty() {
                if let [only] = kept {
                    if accountant.count(kept, None)? > self.limits.token_budget {
                        if !self.truncate_oversized(key, &session, only).await? {
                            return Ok(SummaryOutcome::Discarded);
                        }
                        truncated = true;
                        continue;
                    }
                }
            }

            tracing::debug!(
                namespace = %key.namespace,
                session_id = %key.session_id,
                iteration = iterations,
                tokens,
                evicting = evict.len(),
                retaining = kept.len(),
                "summarizing working memory"
            );

            let prompt = self.prompt(session.context.as_deref(), evict);
            let completion = &self.completion;
            let model = self.model.as_str();
            let prompt = prompt.as_str();
            let new_context = retry_transient(&self.retry, "summarization", move || {
                completion.generate(model, prompt)
            })
            .await?;
            let new_context = new_context.trim();

            if new_context.is_empty() {
                return Err(MemoryError::permanent("completion", "summary was empty"));
            }
            // Passes forced by the budget must shrink the session.
            let projected = accountant.count(kept, Some(new_context))?;
            if tokens > self.limits.token_budget && projected >= tokens {
                return Err(MemoryError::permanent(
                    "completion",
                    format!("summary did not reduce session {key} below {tokens} tokens"),
                ));
            }

            let evicted_through = evict.last().map(|m| m.ordinal);
            let working = &self.working;
            let epoch = session.epoch.as_str();
            let committed = retry_transient(&self.retry, "summary commit", move || {
                working.replace_context_and_trim(key, epoch, new_context, evicted_through)
            })
            .await;
            match committed {
                Ok(_) => {}
                Err(MemoryError::NotFound(_)) => {
                    tracing::debug!(
                        namespace = %key.namespace,
                        session_id = %key.session_id,
                        "session changed during summarization, discarding result"
                    );
                    return Ok(SummaryOutcome::Discarded);
                }
                Err(e) => return Err(e),
            }

            self.promote(key, evict);
        }
    }

    /// Cut a lone message down to the token budget (or the model's input
    /// size, if smaller). Returns false when the session changed meanwhile.
    async fn truncate_oversized(
        &self,
        key: &SessionKey,
        session: &Session,
        message: &Message,
    ) -> Result<bool> {
        let accountant = self.working.accountant();
        let limit = accountant
            .profile()
            .max_tokens
            .min(accountant.message_allowance(self.limits.token_budget));
        let content = accountant.truncate_to_fit(message.role, &message.content, limit);
        if content.trim().is_empty() {
            return Err(MemoryError::permanent(
                "completion",
                format!(
                    "token budget {} cannot hold any message of session {key}",
                    self.limits.token_budget
                ),
            ));
        }

        let working = &self.working;
        let epoch = session.epoch.as_str();
        let content = content.as_str();
        let committed = retry_transient(&self.retry, "truncation commit", move || {
            working.truncate_message(key, epoch, message.ordinal, content)
        })
        .await;
        let token_count = match committed {
            Ok(count) => count,
            Err(MemoryError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::warn!(
            namespace = %key.namespace,
            session_id = %key.session_id,
            ordinal = message.ordinal,
            tokens = token_count,
            "single message exceeds token budget, truncated"
        );
        Ok(true)
    }

    fn prompt(&self, context: Option<&str>, evict: &[Message]) -> String {
        let target = (self.limits.token_budget / 2).max(1);
        let lines = evict
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        if evict.is_empty() {
            return format!(
                "Condense the following conversation summary. Keep names, decisions, \
                 open questions and facts the user shared. Use at most {target} tokens.\n\n\
                 Summary:\n{}\n\n\
                 Condensed summary:",
                context.unwrap_or_default()
            );
        }

        format!(
            "You are a precise summarization assistant. Progressively summarize the lines of \
             conversation provided, adding onto the previous summary and returning a new summary. \
             Keep names, decisions, open questions and facts the user shared. \
             Use at most {target} tokens.\n\n\
             Current summary:\n{}\n\n\
             New lines of conversation:\n{lines}\n\n\
             New summary:",
            context.unwrap_or("(none)")
        )
    }

    /// Hand an evicted batch to long-term memory in the background
    fn promote(&self, key: &SessionKey, evict: &[Message]) {
        let Some(index) = self.promotion.clone() else {
            return;
        };
        if evict.is_empty() {
            return;
        }

        let texts: Vec<String> = evict
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        let key = key.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            for text in &texts {
                let index = &index;
                let namespace = key.namespace.as_str();
                let session_id = key.session_id.as_str();
                let result = retry_transient(&retry, "promotion", move || {
                    index.upsert(namespace, Some(session_id), text)
                })
                .await;

                if let Err(e) = result {
                    tracing::error!(
                        namespace = %key.namespace,
                        session_id = %key.session_id,
                        error = %e,
                        "failed to promote evicted message to long-term memory"
                    );
                }
            }
        });
    }
}

impl std::fmt::Debug for SummarizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizationEngine")
            .field("model", &self.model)
            .field("limits", &self.limits)
            .field("promotion", &self.promotion.is_some())
            .finish()
    }
}

/// Number of newest messages to keep: at most `window_size`, fewer if the
/// suffix plus current context is over budget, never less than one.
fn retained_count(
    accountant: &TokenAccountant,
    session: &Session,
    window_size: usize,
    token_budget: usize,
) -> Result<usize> {
    let messages = &session.messages;
    let mut keep = window_size.min(messages.len()).max(1);
    while keep > 1 {
        let suffix = &messages[messages.len() - keep..];
        if accountant.count(suffix, session.context.as_deref())? <= token_budget {
            break;
        }
        keep -= 1;
    }
    Ok(keep.min(messages.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelProfile;
    use crate::store::{open_in_memory_pool, SessionStore};
    use crate::types::MemoryMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ShortSummary {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionProvider for ShortSummary {
        fn name(&self) -> &'static str {
            "short"
        }

        async fn generate(&self, _model: &str, _prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("summary {n}"))
        }
    }

    struct Echo;

    #[async_trait]
    impl CompletionProvider for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn generate(&self, _model: &str, prompt: &str) -> Result<String> {
            Ok(prompt.repeat(2))
        }
    }

    async fn working() -> WorkingMemoryStore {
        WorkingMemoryStore::new(
            SessionStore::new(open_in_memory_pool().await.unwrap()),
            TokenAccountant::new(ModelProfile::lookup("gpt-4o-mini")),
            Duration::from_secs(1),
        )
    }

    fn engine(
        working: &WorkingMemoryStore,
        completion: Arc<dyn CompletionProvider>,
        window_size: usize,
        token_budget: usize,
    ) -> SummarizationEngine {
        SummarizationEngine::new(
            working.clone(),
            completion,
            "gpt-4o-mini",
            SummaryLimits {
                window_size,
                token_budget,
                max_iterations: 5,
            },
            RetryPolicy::immediate(3),
        )
    }

    #[tokio::test]
    async fn keeps_window_and_builds_context() {
        let wm = working().await;
        let key = SessionKey::new("ns", "s");
        let messages: Vec<_> = (1..=5).map(|i| MemoryMessage::user(format!("message {i}"))).collect();
        wm.append(&key, &messages, None).await.unwrap();

        let engine = engine(
            &wm,
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            3,
            10_000,
        );
        let outcome = engine.summarize(&key).await.unwrap();
        assert!(matches!(outcome, SummaryOutcome::Completed { iterations: 1, .. }));

        let session = wm.read(&key).await.unwrap();
        let contents: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 3", "message 4", "message 5"]);
        assert_eq!(session.context.as_deref(), Some("summary 0"));
    }

    #[tokio::test]
    async fn fits_budget_after_completion() {
        let wm = working().await;
        let key = SessionKey::new("ns", "s");
        let messages: Vec<_> = (0..12)
            .map(|i| MemoryMessage::user(format!("a fairly long message number {i} with padding")))
            .collect();
        wm.append(&key, &messages, None).await.unwrap();

        let budget = 60;
        let engine = engine(
            &wm,
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            20,
            budget,
        );
        engine.summarize(&key).await.unwrap();

        let session = wm.read(&key).await.unwrap();
        let tokens = wm
            .accountant()
            .count(&session.messages, session.context.as_deref())
            .unwrap();
        assert!(tokens <= budget);
        assert!(!session.messages.is_empty());
    }

    #[tokio::test]
    async fn growing_summary_aborts_without_data_loss() {
        let wm = working().await;
        let key = SessionKey::new("ns", "s");
        let messages: Vec<_> = (1..=6).map(|i| MemoryMessage::user(format!("message {i}"))).collect();
        wm.append(&key, &messages, None).await.unwrap();

        let engine = engine(&wm, Arc::new(Echo), 10, 40);
        let err = engine.summarize(&key).await.unwrap_err();
        assert!(!err.is_transient());

        let session = wm.read(&key).await.unwrap();
        assert_eq!(session.messages.len(), 6);
        assert!(session.context.is_none());
    }

    #[tokio::test]
    async fn oversized_single_message_is_truncated() {
        let wm = working().await;
        let key = SessionKey::new("ns", "s");
        let huge = "word ".repeat(200_000);
        wm.append(&key, &[MemoryMessage::user(huge.clone())], None)
            .await
            .unwrap();

        let engine = engine(
            &wm,
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            5,
            1_000,
        );
        let outcome = engine.summarize(&key).await.unwrap();
        assert!(matches!(outcome, SummaryOutcome::Truncated { .. }));

        let session = wm.read(&key).await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert!(session.messages[0].truncated);
        assert!(session.messages[0].content.len() < huge.len());
    }

    #[tokio::test]
    async fn message_over_budget_but_under_model_limit_is_truncated() {
        let wm = working().await;
        let key = SessionKey::new("ns", "s");
        wm.append(&key, &[MemoryMessage::user("word ".repeat(200))], None)
            .await
            .unwrap();

        let budget = 100;
        let engine = engine(
            &wm,
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            5,
            budget,
        );
        let outcome = engine.summarize(&key).await.unwrap();
        assert!(matches!(outcome, SummaryOutcome::Truncated { token_count } if token_count <= budget));

        let session = wm.read(&key).await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert!(session.messages[0].truncated);
        assert!(session.last_token_count <= budget);
        assert!(!engine.needs_summary(session.last_token_count, session.messages.len()));
    }

    #[tokio::test]
    async fn commit_waits_out_a_busy_session_lock() {
        let wm = WorkingMemoryStore::new(
            SessionStore::new(open_in_memory_pool().await.unwrap()),
            TokenAccountant::new(ModelProfile::lookup("gpt-4o-mini")),
            Duration::from_millis(50),
        );
        let key = SessionKey::new("ns", "s");
        let messages: Vec<_> = (1..=5).map(|i| MemoryMessage::user(format!("message {i}"))).collect();
        wm.append(&key, &messages, None).await.unwrap();

        let engine = SummarizationEngine::new(
            wm.clone(),
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            "gpt-4o-mini",
            SummaryLimits {
                window_size: 3,
                token_budget: 10_000,
                max_iterations: 5,
            },
            RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                backoff_multiplier: 2.0,
            },
        );

        let guard = wm.hold(&key).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(guard);
        });

        let outcome = engine.summarize(&key).await.unwrap();
        release.await.unwrap();
        assert!(matches!(outcome, SummaryOutcome::Completed { .. }));

        let session = wm.read(&key).await.unwrap();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.context.as_deref(), Some("summary 0"));
    }

    #[tokio::test]
    async fn deleted_session_is_discarded() {
        let wm = working().await;
        let engine = engine(
            &wm,
            Arc::new(ShortSummary {
                calls: AtomicU32::new(0),
            }),
            3,
            1_000,
        );
        let outcome = engine.summarize(&SessionKey::new("ns", "gone")).await.unwrap();
        assert_eq!(outcome, SummaryOutcome::Discarded);
    }
}
