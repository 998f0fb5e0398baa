use koi::{MemoryId, MemoryMessage, NewMemory, Page, SearchFilters};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AddMessagesRequest {
    pub messages: Vec<MemoryMessage>,
    /// Replaces the session's rolling context
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        Page::new(self.page, self.page_size)
    }
}

fn default_page_size() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    #[serde(flatten)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct PromptResponse {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateMemoriesRequest {
    pub memories: Vec<NewMemory>,
}

#[derive(Debug, Serialize)]
pub struct CreateMemoriesResponse {
    pub ids: Vec<MemoryId>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}
