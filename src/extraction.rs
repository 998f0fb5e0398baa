//! Topic, entity and discrete-memory extraction services
//!
//! The core treats these as external services behind [`TopicProvider`],
//! [`EntityProvider`] and [`MemoryExtractor`]. The bundled implementations
//! prompt a completion model for JSON and parse the reply.

use crate::error::{MemoryError, Result};
use crate::llm::CompletionProvider;
use crate::types::{Entity, MemoryType};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait]
pub trait TopicProvider: Send + Sync {
    /// Up to `top_k` topic labels, most relevant first
    async fn topics(&self, text: &str, top_k: usize) -> Result<Vec<String>>;
}

/// One token-classification result as NER models emit it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEntity {
    pub text: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub span: Option<(usize, usize)>,
}

#[async_trait]
pub trait EntityProvider: Send + Sync {
    async fn entities(&self, text: &str) -> Result<Vec<RawEntity>>;
}

/// A standalone fact or event distilled from conversation text
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMemory {
    pub memory_type: MemoryType,
    pub text: String,
}

#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// Episodic and semantic memories worth keeping from `text`
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedMemory>>;
}

/// Join `##` continuation pieces onto the preceding entity and drop duplicates
pub fn merge_subword_tokens(raw: Vec<RawEntity>) -> Vec<Entity> {
    let mut merged: Vec<Entity> = Vec::new();

    for token in raw {
        match token.text.strip_prefix("##") {
            Some(rest) if !merged.is_empty() => {
                if let Some(last) = merged.last_mut() {
                    last.text.push_str(rest);
                }
            }
            Some(rest) => merged.push(Entity::new(rest, token.entity_type)),
            None => merged.push(Entity::new(token.text, token.entity_type)),
        }
    }

    let mut seen = HashSet::new();
    merged
        .into_iter()
        .filter(|e| !e.text.trim().is_empty())
        .filter(|e| seen.insert(e.clone()))
        .collect()
}

/// Extract the JSON object from a model reply that may wrap it in prose or fences
fn json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn parse_reply<T: for<'de> Deserialize<'de>>(service: &'static str, reply: &str) -> Result<T> {
    let body = json_object(reply)
        .ok_or_else(|| MemoryError::transient(service, "reply contained no JSON object"))?;
    // Models occasionally emit malformed JSON; another attempt usually fixes it.
    serde_json::from_str(body).map_err(|e| MemoryError::transient(service, e.to_string()))
}

#[derive(Deserialize)]
struct TopicsReply {
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct EntitiesReply {
    #[serde(default)]
    entities: Vec<RawEntity>,
}

#[derive(Deserialize)]
struct MemoriesReply {
    #[serde(default)]
    memories: Vec<MemoryItem>,
}

#[derive(Deserialize)]
struct MemoryItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Topic extraction through a completion model
pub struct LlmTopicProvider {
    client: Arc<dyn CompletionProvider>,
    model: String,
}

impl LlmTopicProvider {
    pub fn new(client: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn prompt(text: &str, top_k: usize) -> String {
        format!(
            "Extract the top {top_k} topics from the following text:\n\
             {text}\n\n\
             Return a list of topics in JSON format, for example:\n\
             {{\"topics\": [\"topic1\", \"topic2\", \"topic3\"]}}"
        )
    }
}

#[async_trait]
impl TopicProvider for LlmTopicProvider {
    async fn topics(&self, text: &str, top_k: usize) -> Result<Vec<String>> {
        let reply = self
            .client
            .generate(&self.model, &Self::prompt(text, top_k))
            .await?;
        let parsed: TopicsReply = parse_reply("topics", &reply)?;

        Ok(parsed
            .topics
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .take(top_k)
            .collect())
    }
}

/// Named-entity extraction through a completion model
pub struct LlmEntityProvider {
    client: Arc<dyn CompletionProvider>,
    model: String,
}

impl LlmEntityProvider {
    pub fn new(client: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn prompt(text: &str) -> String {
        format!(
            "List the named entities (people, organizations, locations, products, dates) \
             in the following text:\n\
             {text}\n\n\
             Return JSON in this format:\n\
             {{\"entities\": [{{\"text\": \"Acme Corp\", \"type\": \"ORG\"}}]}}"
        )
    }
}

#[async_trait]
impl EntityProvider for LlmEntityProvider {
    async fn entities(&self, text: &str) -> Result<Vec<RawEntity>> {
        let reply = self.client.generate(&self.model, &Self::prompt(text)).await?;
        let parsed: EntitiesReply = parse_reply("ner", &reply)?;
        Ok(parsed.entities)
    }
}

/// Discrete-memory extraction through a completion model
pub struct LlmMemoryExtractor {
    client: Arc<dyn CompletionProvider>,
    model: String,
}

impl LlmMemoryExtractor {
    pub fn new(client: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn prompt(text: &str) -> String {
        format!(
            "Extract memories from the message below that would help in future \
             conversations with this user. Use \"semantic\" for lasting facts and \
             preferences and \"episodic\" for events tied to a time or place. \
             Write each memory as a self-contained sentence: refer to the user as \
             \"User\" and replace every pronoun and relative date with what it refers to. \
             Skip general knowledge and anything you cannot ground.\n\n\
             Message:\n{text}\n\n\
             Return JSON in this format:\n\
             {{\"memories\": [{{\"type\": \"semantic\", \"text\": \"User prefers window seats\"}}]}}"
        )
    }
}

#[async_trait]
impl MemoryExtractor for LlmMemoryExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedMemory>> {
        let reply = self.client.generate(&self.model, &Self::prompt(text)).await?;
        let parsed: MemoriesReply = parse_reply("extraction", &reply)?;

        Ok(parsed
            .memories
            .into_iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| ExtractedMemory {
                memory_type: match m.kind.as_str() {
                    "semantic" => MemoryType::Semantic,
                    _ => MemoryType::Episodic,
                },
                text: m.text.trim().to_string(),
            })
            .collect())
    }
}
