use koi::MemoryOrchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub memory: Arc<MemoryOrchestrator>,
}
