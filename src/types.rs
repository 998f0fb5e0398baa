//! Working-memory and long-term memory types

use crate::error::{MemoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Isolation partition for sessions and memories
pub type Namespace = String;

/// Identifier of a conversation within a namespace
pub type SessionId = String;

/// Unique identifier for long-term memories
pub type MemoryId = String;

/// Identifier of the end user a memory is about
pub type UserId = String;

/// (namespace, session) pair; the unit of locking and job deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub namespace: Namespace,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(namespace: impl Into<Namespace>, session_id: impl Into<SessionId>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.session_id)
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(MemoryError::Validation(format!(
                "unknown role '{other}', expected user, assistant or system"
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as submitted by a caller, before validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
}

impl MemoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Check role and content, returning the parsed role
    pub fn validate(&self) -> Result<Role> {
        let role = self.role.parse::<Role>()?;
        if self.content.trim().is_empty() {
            return Err(MemoryError::Validation(format!(
                "empty content for {role} message"
            )));
        }
        Ok(role)
    }
}

/// A message stored in working memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    /// Monotonic position; never reused, even across sessions
    pub ordinal: i64,
    pub role: Role,
    pub content: String,
    /// Content was cut to fit the model's input size
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
}

/// Working memory for one (namespace, session)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub namespace: Namespace,
    pub session_id: SessionId,
    /// Changes whenever the session is deleted and recreated
    pub epoch: String,
    pub messages: Vec<Message>,
    /// Rolling summary of evicted messages
    pub context: Option<String>,
    pub last_token_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.namespace.clone(), self.session_id.clone())
    }
}

/// A named entity attached to a long-term memory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub entity_type: String,
}

impl Entity {
    pub fn new(text: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entity_type: entity_type.into(),
        }
    }
}

/// Kind of long-term memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Raw conversation text promoted from working memory
    #[default]
    Message,
    /// Something that happened, anchored in time
    Episodic,
    /// A durable fact or preference
    Semantic,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Message => "message",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
        }
    }
}

impl FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(MemoryType::Message),
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            other => Err(MemoryError::Validation(format!("unknown memory type '{other}'"))),
        }
    }
}

/// Long-term memory record; immutable after creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: MemoryId,
    pub namespace: Namespace,
    /// Session the text was promoted from, if any
    pub session_id: Option<SessionId>,
    pub user_id: Option<UserId>,
    pub memory_type: MemoryType,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub topics: BTreeSet<String>,
    pub entities: BTreeSet<Entity>,
    pub created_at: DateTime<Utc>,
}

/// Input for explicit promotion into long-term memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub memory_type: MemoryType,
}

impl NewMemory {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            user_id: None,
            memory_type: MemoryType::default(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }
}

/// Metadata filters applied on top of the namespace restriction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Match memories carrying any of these topics
    #[serde(default)]
    pub topics: Option<Vec<String>>,
    /// Match memories mentioning any of these entity texts
    #[serde(default)]
    pub entities: Option<Vec<String>>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    /// Maximum cosine distance (1 - similarity) to keep
    #[serde(default)]
    pub distance_threshold: Option<f32>,
}

impl SearchFilters {
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_distance_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = Some(threshold);
        self
    }
}

/// Zero-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: usize,
    pub page_size: usize,
}

impl Page {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    pub fn first(page_size: usize) -> Self {
        Self::new(0, page_size)
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(10)
    }
}

/// Search hit combining a memory with its similarity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    /// Cosine similarity (higher is better)
    pub score: f32,
    /// Rank across all pages (1-based)
    pub rank: usize,
}

/// One page of ranked search results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub memories: Vec<ScoredMemory>,
    /// Matches across all pages
    pub total: usize,
    pub next_page: Option<usize>,
}

impl SearchResults {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

/// Session ids in a namespace, most recently used first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionId>,
    pub total: usize,
}

/// What callers see when reading working memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingMemoryView {
    pub messages: Vec<Message>,
    pub context: Option<String>,
    pub token_count: usize,
    /// A summarization job is queued or running; `context` may be stale
    pub pending: bool,
    pub context_percentage_used: f32,
    /// Error from the most recent failed summarization, if not yet recovered
    pub last_summary_error: Option<String>,
}
