//! Long-term memory: namespace-scoped records with embeddings and metadata
//!
//! Records are written once and never recomputed. Ids are derived from
//! (namespace, session_id, text), so replaying a promotion finds the
//! existing record instead of creating a second one. New `message` records
//! can be distilled into separate `episodic` and `semantic` records; the
//! source record is left as it was.

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::enrichment::EnrichmentPipeline;
use crate::error::{MemoryError, Result};
use crate::extraction::MemoryExtractor;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{
    Memory, MemoryId, MemoryType, NewMemory, Page, ScoredMemory, SearchFilters, SearchResults,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;

/// Storage for memory records
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store a record; returns false when one with the same id already exists
    async fn insert(&self, memory: &Memory) -> Result<bool>;
    async fn get(&self, namespace: &str, id: &str) -> Result<Option<Memory>>;
    async fn delete(&self, namespace: &str, id: &str) -> Result<bool>;

    /// All records in `namespace` passing the metadata filters, embeddings included
    async fn candidates(&self, namespace: &str, filters: &SearchFilters) -> Result<Vec<Memory>>;
}

/// Stable id for a memory's logical source
pub fn memory_id(namespace: &str, session_id: Option<&str>, text: &str) -> MemoryId {
    let key = format!("{namespace}\u{1f}{}\u{1f}{text}", session_id.unwrap_or(""));
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// SQLite-backed [`MemoryBackend`]
#[derive(Clone)]
pub struct SqliteMemoryBackend {
    pool: SqlitePool,
}

impl SqliteMemoryBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for SqliteMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMemoryBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemoryBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, memory: &Memory) -> Result<bool> {
        let embedding = bincode::serialize(&memory.embedding)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let topics = serde_json::to_string(&memory.topics)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let entities = serde_json::to_string(&memory.entities)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO memories (
                namespace, id, session_id, user_id, memory_type, text, embedding,
                topics, entities, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.namespace)
        .bind(&memory.id)
        .bind(&memory.session_id)
        .bind(&memory.user_id)
        .bind(memory.memory_type.as_str())
        .bind(&memory.text)
        .bind(embedding)
        .bind(topics)
        .bind(entities)
        .bind(memory.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // Side tables hold normalized copies for filtering only.
        for topic in &memory.topics {
            sqlx::query("INSERT OR IGNORE INTO memory_topics (namespace, memory_id, topic) VALUES (?, ?, ?)")
                .bind(&memory.namespace)
                .bind(&memory.id)
                .bind(topic.to_lowercase())
                .execute(&mut *tx)
                .await?;
        }

        for entity in &memory.entities {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO memory_entities (namespace, memory_id, entity_text, entity_type)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&memory.namespace)
            .bind(&memory.id)
            .bind(&entity.text)
            .bind(&entity.entity_type)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<Option<Memory>> {
        let row = sqlx::query(
            r#"
            SELECT namespace, id, session_id, user_id, memory_type, text, embedding,
                   topics, entities, created_at
            FROM memories
            WHERE namespace = ? AND id = ?
            "#,
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_memory).transpose()
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        for table in ["memory_topics", "memory_entities"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE namespace = ? AND memory_id = ?"
            ))
            .bind(namespace)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query("DELETE FROM memories WHERE namespace = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn candidates(&self, namespace: &str, filters: &SearchFilters) -> Result<Vec<Memory>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.namespace, m.id, m.session_id, m.user_id, m.memory_type, m.text, \
             m.embedding, m.topics, m.entities, m.created_at \
             FROM memories m WHERE m.namespace = ",
        );
        query.push_bind(namespace);

        if let Some(session_id) = &filters.session_id {
            query.push(" AND m.session_id = ");
            query.push_bind(session_id);
        }

        if let Some(user_id) = &filters.user_id {
            query.push(" AND m.user_id = ");
            query.push_bind(user_id);
        }

        if let Some(memory_type) = filters.memory_type {
            query.push(" AND m.memory_type = ");
            query.push_bind(memory_type.as_str());
        }

        if let Some(topics) = filters.topics.as_ref().filter(|t| !t.is_empty()) {
            query.push(
                " AND EXISTS (SELECT 1 FROM memory_topics t \
                 WHERE t.namespace = m.namespace AND t.memory_id = m.id AND t.topic IN (",
            );
            let mut list = query.separated(", ");
            for topic in topics {
                list.push_bind(topic.to_lowercase());
            }
            query.push("))");
        }

        if let Some(entities) = filters.entities.as_ref().filter(|e| !e.is_empty()) {
            query.push(
                " AND EXISTS (SELECT 1 FROM memory_entities e \
                 WHERE e.namespace = m.namespace AND e.memory_id = m.id \
                 AND lower(e.entity_text) IN (",
            );
            let mut list = query.separated(", ");
            for entity in entities {
                list.push_bind(entity.to_lowercase());
            }
            query.push("))");
        }

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut memories = Vec::with_capacity(rows.len());
        for row in &rows {
            let memory = row_to_memory(row)?;
            if filters.created_after.is_some_and(|after| memory.created_at < after)
                || filters.created_before.is_some_and(|before| memory.created_at > before)
            {
                continue;
            }
            memories.push(memory);
        }
        Ok(memories)
    }
}

/// Helper: Convert database row to Memory
fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<Memory> {
    let blob: Vec<u8> = row.try_get("embedding").unwrap_or_default();
    let embedding: Vec<f32> =
        bincode::deserialize(&blob).map_err(|e| MemoryError::Serialization(e.to_string()))?;
    let topics: String = row.try_get("topics").unwrap_or_else(|_| "[]".into());
    let entities: String = row.try_get("entities").unwrap_or_else(|_| "[]".into());
    let memory_type: String = row.try_get("memory_type").unwrap_or_default();

    Ok(Memory {
        id: row.try_get("id").unwrap_or_default(),
        namespace: row.try_get("namespace").unwrap_or_default(),
        session_id: row.try_get("session_id").ok().flatten(),
        user_id: row.try_get("user_id").ok().flatten(),
        memory_type: memory_type.parse().unwrap_or_default(),
        text: row.try_get("text").unwrap_or_default(),
        embedding,
        topics: serde_json::from_str(&topics)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?,
        entities: serde_json::from_str(&entities)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?,
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    })
}

/// Write path and similarity search over a [`MemoryBackend`]
#[derive(Clone)]
pub struct LongTermIndex {
    backend: Arc<dyn MemoryBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    enrichment: EnrichmentPipeline,
    extractor: Option<Arc<dyn MemoryExtractor>>,
    retry: RetryPolicy,
}

impl LongTermIndex {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        enrichment: EnrichmentPipeline,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            embedder,
            enrichment,
            extractor: None,
            retry,
        }
    }

    /// Distill new `message` records into episodic and semantic ones
    pub fn with_extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Store `text` under `namespace`, or return the id of the existing record
    pub async fn upsert(
        &self,
        namespace: &str,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<MemoryId> {
        let mut memory = NewMemory::new(text);
        memory.session_id = session_id.map(str::to_string);
        self.create(namespace, &memory).await
    }

    /// Store one record; a newly stored `message` record is also run
    /// through discrete extraction when an extractor is configured.
    pub async fn create(&self, namespace: &str, memory: &NewMemory) -> Result<MemoryId> {
        let (id, inserted) = self.store(namespace, memory).await?;
        if inserted && memory.memory_type == MemoryType::Message {
            self.extract_discrete(namespace, memory).await;
        }
        Ok(id)
    }

    /// Promote a batch; each record is written independently and idempotently
    pub async fn create_many(&self, namespace: &str, memories: &[NewMemory]) -> Result<Vec<MemoryId>> {
        futures::future::try_join_all(memories.iter().map(|m| self.create(namespace, m))).await
    }

    async fn store(&self, namespace: &str, new: &NewMemory) -> Result<(MemoryId, bool)> {
        let text = new.text.as_str();
        if text.trim().is_empty() {
            return Err(MemoryError::Validation("memory text is empty".into()));
        }

        let id = memory_id(namespace, new.session_id.as_deref(), text);
        if self.backend.get(namespace, &id).await?.is_some() {
            tracing::debug!(namespace, memory_id = %id, "memory already stored");
            return Ok((id, false));
        }

        let owned = [text.to_string()];
        let input = &owned[..];
        let embedder = &self.embedder;
        let embedding = retry_transient(&self.retry, "embedding", move || embedder.embed(input))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::permanent("embedding", "no embedding returned"))?;

        let enrichment = self.enrichment.enrich(text).await;

        let memory = Memory {
            id: id.clone(),
            namespace: namespace.to_string(),
            session_id: new.session_id.clone(),
            user_id: new.user_id.clone(),
            memory_type: new.memory_type,
            text: text.to_string(),
            embedding,
            topics: enrichment.topics,
            entities: enrichment.entities,
            created_at: Utc::now(),
        };

        let inserted = self.backend.insert(&memory).await?;
        tracing::debug!(
            namespace,
            memory_id = %id,
            memory_type = memory.memory_type.as_str(),
            inserted,
            topics = memory.topics.len(),
            entities = memory.entities.len(),
            "stored long-term memory"
        );
        Ok((id, inserted))
    }

    /// Failures are logged; the source record stays stored either way.
    async fn extract_discrete(&self, namespace: &str, source: &NewMemory) {
        let Some(extractor) = &self.extractor else {
            return;
        };

        let text = source.text.as_str();
        let extracted = match retry_transient(&self.retry, "memory extraction", move || {
            extractor.extract(text)
        })
        .await
        {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "discrete memory extraction failed");
                return;
            }
        };

        for item in extracted {
            let memory = NewMemory {
                text: item.text,
                session_id: source.session_id.clone(),
                user_id: source.user_id.clone(),
                memory_type: item.memory_type,
            };
            if let Err(e) = self.store(namespace, &memory).await {
                tracing::warn!(
                    namespace,
                    memory_type = memory.memory_type.as_str(),
                    error = %e,
                    "failed to store extracted memory"
                );
            }
        }
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Memory> {
        self.backend
            .get(namespace, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("memory {namespace}/{id}")))
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        if self.backend.delete(namespace, id).await? {
            tracing::debug!(namespace, memory_id = id, "deleted long-term memory");
            Ok(())
        } else {
            Err(MemoryError::NotFound(format!("memory {namespace}/{id}")))
        }
    }

    /// Rank memories in `namespace` by similarity to `query`.
    ///
    /// Embedding or backend failures yield an empty page and a warning.
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        filters: &SearchFilters,
        page: Page,
    ) -> SearchResults {
        match self.try_search(namespace, query, filters, page).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "long-term search unavailable, returning no results");
                SearchResults::empty()
            }
        }
    }

    async fn try_search(
        &self,
        namespace: &str,
        query: &str,
        filters: &SearchFilters,
        page: Page,
    ) -> Result<SearchResults> {
        if page.page_size == 0 {
            return Ok(SearchResults::empty());
        }

        let candidates = self.backend.candidates(namespace, filters).await?;
        if candidates.is_empty() {
            return Ok(SearchResults::empty());
        }

        let owned = [query.to_string()];
        let input = &owned[..];
        let embedder = &self.embedder;
        let query_vector = retry_transient(&self.retry, "embedding", move || embedder.embed(input))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::permanent("embedding", "no embedding returned"))?;

        let mut scored: Vec<(Memory, f32)> = candidates
            .into_iter()
            // Backends are namespace-scoped already; this guards a faulty one.
            .filter(|m| m.namespace == namespace)
            .map(|m| {
                let score = cosine_similarity(&query_vector, &m.embedding);
                (m, score)
            })
            .filter(|(_, score)| {
                filters
                    .distance_threshold
                    .map_or(true, |max| 1.0 - *score <= max)
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = scored.len();
        let offset = page.offset();
        let memories: Vec<ScoredMemory> = scored
            .into_iter()
            .enumerate()
            .skip(offset)
            .take(page.page_size)
            .map(|(i, (memory, score))| ScoredMemory {
                memory,
                score,
                rank: i + 1,
            })
            .collect();

        let next_page = (offset + memories.len() < total).then_some(page.page + 1);

        Ok(SearchResults {
            memories,
            total,
            next_page,
        })
    }
}

impl std::fmt::Debug for LongTermIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongTermIndex")
            .field("backend", &self.backend.name())
            .field("embedder", &self.embedder.name())
            .finish()
    }
}
