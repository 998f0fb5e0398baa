//! Background summarization queue
//!
//! Sessions are queued by key onto a channel drained by a fixed pool of
//! workers. A key has at most one job queued or running; triggering it again
//! meanwhile only marks the job for another pass, which the worker runs
//! against the then-current backlog before releasing the key.

use crate::summarization::{SummarizationEngine, SummaryState};
use crate::types::SessionKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct JobSlot {
    rerun: bool,
}

#[derive(Debug, Default)]
struct Shared {
    jobs: Mutex<HashMap<SessionKey, JobSlot>>,
    states: Mutex<HashMap<SessionKey, SummaryState>>,
    idle: Notify,
}

impl Shared {
    fn set_state(&self, key: &SessionKey, state: SummaryState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match state {
            SummaryState::Idle => {
                states.remove(key);
            }
            other => {
                states.insert(key.clone(), other);
            }
        }
    }

    /// Release `key` unless another pass was requested
    fn finish_pass(&self, key: &SessionKey) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(key) {
            Some(slot) if slot.rerun => {
                slot.rerun = false;
                true
            }
            _ => {
                jobs.remove(key);
                false
            }
        }
    }
}

pub struct SummaryQueue {
    sender: mpsc::UnboundedSender<SessionKey>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl SummaryQueue {
    /// Spawn `workers` tasks running `engine`; must be called inside a Tokio runtime
    pub fn start(engine: Arc<SummarizationEngine>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared::default());

        let workers = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    run_worker(worker, engine, shared, receiver).await;
                })
            })
            .collect();

        Self {
            sender,
            shared,
            workers,
        }
    }

    /// Queue a job for `key`. Returns false when one was already queued or
    /// running and this trigger was folded into it.
    pub fn enqueue(&self, key: &SessionKey) -> bool {
        {
            let mut jobs = self.shared.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = jobs.get_mut(key) {
                slot.rerun = true;
                return false;
            }
            jobs.insert(key.clone(), JobSlot::default());
        }

        if self.sender.send(key.clone()).is_err() {
            tracing::error!(namespace = %key.namespace, session_id = %key.session_id, "summary workers stopped, dropping job");
            self.shared.finish_pass(key);
            return false;
        }
        true
    }

    /// A job for `key` is queued or running
    pub fn is_pending(&self, key: &SessionKey) -> bool {
        self.shared
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn state(&self, key: &SessionKey) -> SummaryState {
        if self.is_pending(key) {
            return SummaryState::Summarizing;
        }
        self.shared
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .unwrap_or(SummaryState::Idle)
    }

    /// Error from the last failed job, if the session has not recovered since
    pub fn last_error(&self, key: &SessionKey) -> Option<String> {
        match self
            .shared
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            Some(SummaryState::Failed(message)) => Some(message.clone()),
            _ => None,
        }
    }

    /// Drop recorded status for a deleted session
    pub fn forget(&self, key: &SessionKey) {
        self.shared.set_state(key, SummaryState::Idle);
    }

    /// Wait until no job is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self
                .shared
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for SummaryQueue {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for SummaryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryQueue")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    worker: usize,
    engine: Arc<SummarizationEngine>,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionKey>>>,
) {
    tracing::debug!(worker, "summary worker started");

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(key) = next else {
            break;
        };

        loop {
            shared.set_state(&key, SummaryState::Summarizing);
            match engine.summarize(&key).await {
                Ok(outcome) => {
                    tracing::debug!(
                        worker,
                        namespace = %key.namespace,
                        session_id = %key.session_id,
                        ?outcome,
                        "summary job finished"
                    );
                    shared.set_state(&key, SummaryState::Idle);
                }
                Err(e) => {
                    tracing::error!(
                        worker,
                        namespace = %key.namespace,
                        session_id = %key.session_id,
                        error = %e,
                        "summarization aborted"
                    );
                    shared.set_state(&key, SummaryState::Failed(e.to_string()));
                }
            }

            if !shared.finish_pass(&key) {
                break;
            }
        }

        shared.idle.notify_waiters();
    }

    tracing::debug!(worker, "summary worker stopped");
}
