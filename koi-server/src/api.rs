use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use koi::{Memory, MemoryError, Page, SearchResults, SessionList, WorkingMemoryView};
use serde::Serialize;
use std::sync::Arc;

use crate::models::{
    AckResponse, AddMessagesRequest, CreateMemoriesRequest, CreateMemoriesResponse,
    HealthResponse, PageQuery, PromptRequest, PromptResponse, SearchRequest,
};
use crate::state::AppState;

/// Memory errors mapped onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(MemoryError);

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MemoryError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
            MemoryError::ConcurrencyTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MemoryError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/namespaces/:namespace/sessions", get(list_sessions))
        .route(
            "/v1/namespaces/:namespace/sessions/:session_id",
            get(get_memory).delete(delete_memory),
        )
        .route(
            "/v1/namespaces/:namespace/sessions/:session_id/messages",
            post(add_messages),
        )
        .route(
            "/v1/namespaces/:namespace/sessions/:session_id/prompt",
            post(memory_prompt),
        )
        .route("/v1/namespaces/:namespace/memories", post(create_memories))
        .route("/v1/namespaces/:namespace/memories/search", post(search))
        .route(
            "/v1/namespaces/:namespace/memories/:id",
            get(get_long_term_memory).delete(delete_long_term_memory),
        )
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    Query(params): Query<PageQuery>,
) -> ApiResult<SessionList> {
    Ok(Json(state.memory.list_sessions(&namespace, params.page()).await?))
}

pub async fn add_messages(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
    Json(payload): Json<AddMessagesRequest>,
) -> ApiResult<WorkingMemoryView> {
    let view = state
        .memory
        .add_messages(
            &namespace,
            &session_id,
            &payload.messages,
            payload.context.as_deref(),
        )
        .await?;
    Ok(Json(view))
}

pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
) -> ApiResult<WorkingMemoryView> {
    Ok(Json(state.memory.get_memory(&namespace, &session_id).await?))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
) -> ApiResult<AckResponse> {
    state.memory.delete_memory(&namespace, &session_id).await?;
    Ok(Json(AckResponse { status: "ok" }))
}

pub async fn memory_prompt(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
    Json(payload): Json<PromptRequest>,
) -> ApiResult<PromptResponse> {
    let prompt = state
        .memory
        .memory_prompt(&namespace, Some(&session_id), &payload.query)
        .await?;
    Ok(Json(PromptResponse { prompt }))
}

pub async fn create_memories(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    Json(payload): Json<CreateMemoriesRequest>,
) -> ApiResult<CreateMemoriesResponse> {
    let ids = state
        .memory
        .create_long_term_memories(&namespace, &payload.memories)
        .await?;
    Ok(Json(CreateMemoriesResponse { ids }))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    Json(payload): Json<SearchRequest>,
) -> ApiResult<SearchResults> {
    let page_size = payload
        .page_size
        .unwrap_or(state.memory.settings().default_search_limit);
    let results = state
        .memory
        .search(
            &namespace,
            &payload.text,
            &payload.filters,
            Page::new(payload.page, page_size),
        )
        .await?;
    Ok(Json(results))
}

pub async fn get_long_term_memory(
    State(state): State<Arc<AppState>>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<Memory> {
    let mut memory = state.memory.get_long_term_memory(&namespace, &id).await?;
    memory.embedding.clear();
    Ok(Json(memory))
}

pub async fn delete_long_term_memory(
    State(state): State<Arc<AppState>>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<AckResponse> {
    state.memory.delete_long_term_memory(&namespace, &id).await?;
    Ok(Json(AckResponse { status: "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use koi::{CompletionProvider, HashEmbeddingProvider, MemoryOrchestrator, Providers, Settings};
    use tower::ServiceExt;

    struct Fixed;

    #[async_trait]
    impl CompletionProvider for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn generate(&self, _model: &str, _prompt: &str) -> koi::Result<String> {
            Ok("summary".to_string())
        }
    }

    async fn app() -> Router {
        let providers = Providers::new(Arc::new(Fixed), Arc::new(HashEmbeddingProvider::default()));
        let memory = MemoryOrchestrator::in_memory(Settings::default(), providers)
            .await
            .unwrap();
        router(Arc::new(AppState {
            memory: Arc::new(memory),
        }))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_role_is_unprocessable() {
        let response = app()
            .await
            .oneshot(json_request(
                "POST",
                "/v1/namespaces/ns/sessions/s/messages",
                serde_json::json!({"messages": [{"role": "system_x", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn add_then_read_session() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/namespaces/ns/sessions/s/messages",
                serde_json::json!({"messages": [{"role": "user", "content": "hello"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/namespaces/ns/sessions/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["messages"][0]["content"], "hello");
        assert_eq!(view["pending"], false);
    }

    #[tokio::test]
    async fn missing_memory_is_not_found() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/v1/namespaces/ns/memories/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_on_empty_namespace_returns_empty_list() {
        let response = app()
            .await
            .oneshot(json_request(
                "POST",
                "/v1/namespaces/proj1/memories/search",
                serde_json::json!({"text": "refund policy"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let results: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(results["memories"].as_array().map(Vec::len), Some(0));
        assert_eq!(results["total"], 0);
    }
}
