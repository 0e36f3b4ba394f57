//! Request handlers for the OpenAI-style routes.

use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{ChatCompletionRequest, ChunkStream, CompletionRequest, LlmEngine};
use crate::rag::{RagEmbedding, RagReranker};

use super::AppState;
use super::error::ApiError;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

fn engine(state: &AppState) -> Result<&LlmEngine, ApiError> {
    state
        .models
        .engine
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("no generation engine is loaded"))
}

fn embedding(state: &AppState) -> Result<&RagEmbedding, ApiError> {
    state
        .models
        .embedding
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("no embedding model is loaded"))
}

fn reranker(state: &AppState) -> Result<&RagReranker, ApiError> {
    state
        .models
        .reranker
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("no rerank model is loaded"))
}

fn parse<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v).map_err(|e| ApiError::bad_request(e.body_text()))
}

fn sse_response(stream: ChunkStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

// ── GET /models ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .models
        .engine
        .as_ref()
        .map(|engine| {
            let base = engine.model_name().to_string();
            engine
                .served_models()
                .iter()
                .map(|id| ModelCard {
                    id: id.clone(),
                    object: "model",
                    created,
                    owned_by: "llm-serve",
                    parent: (*id != base).then(|| base.clone()),
                })
                .collect()
        })
        .unwrap_or_default();

    Json(ModelList { object: "list", data })
}

// ── POST /chat/completions, /completions ──────────────────────────────────────

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse(body)?;
    let engine = engine(&state)?;
    debug!(stream = request.stream, messages = request.messages.len(), "chat completion");

    if request.stream {
        Ok(sse_response(engine.chat_stream(request).await?))
    } else {
        Ok(Json(engine.chat(request).await?).into_response())
    }
}

pub async fn completions(
    State(state): State<AppState>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse(body)?;
    let engine = engine(&state)?;
    debug!(stream = request.stream, "completion");

    if request.stream {
        Ok(sse_response(engine.completion_stream(request).await?))
    } else {
        Ok(Json(engine.completion(request).await?).into_response())
    }
}

// ── POST /embeddings ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    /// A string or an array of strings.
    pub input: Value,
    #[serde(default)]
    pub model: Option<String>,
}

fn embedding_inputs(input: Value) -> Result<Vec<String>, ApiError> {
    match input {
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(ApiError::bad_request("input array must contain only strings")),
            })
            .collect(),
        _ => Err(ApiError::bad_request("input must be a string or an array of strings")),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    body: Result<Json<EmbeddingsRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = parse(body)?;
    let model = embedding(&state)?;
    let inputs = embedding_inputs(request.input)?;

    let vectors = model.embed(&inputs).await?;
    let data: Vec<Value> = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| json!({"object": "embedding", "index": index, "embedding": embedding}))
        .collect();

    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": model.model_name(),
        "usage": {"prompt_tokens": 0, "total_tokens": 0},
    })))
}

// ── POST /rerank ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub return_documents: bool,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn rerank(
    State(state): State<AppState>,
    body: Result<Json<RerankRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = parse(body)?;
    let model = reranker(&state)?;

    let ranked = model.rerank(&request.query, &request.documents, request.top_n).await?;
    let results: Vec<Value> = ranked
        .into_iter()
        .map(|r| {
            let mut item = json!({"index": r.index, "relevance_score": r.score});
            if request.return_documents {
                item["document"] = json!({"text": request.documents[r.index]});
            }
            item
        })
        .collect();

    Ok(Json(json!({"model": model.model_name(), "results": results})))
}

// ── GET /health ───────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    let models = &state.models;
    let mut body = json!({
        "status": "ok",
        "engine": models.engine.as_ref().map(|e| e.kind().as_str()),
        "model": models.engine.as_ref().map(|e| e.model_name()),
        "embedding": models.embedding.is_some(),
        "reranker": models.reranker.is_some(),
    });

    if let Some(engine) = &models.engine {
        let reason = match tokio::time::timeout(HEALTH_TIMEOUT, engine.health()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("engine health check timed out".to_string()),
        };
        if let Some(reason) = reason {
            warn!(%reason, "engine health check failed");
            body["status"] = json!("unhealthy");
            body["error"] = json!(reason);
            return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        }
    }

    Json(body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_input_forms() {
        assert_eq!(embedding_inputs(json!("a")).unwrap(), vec!["a".to_string()]);
        assert_eq!(embedding_inputs(json!(["a", "b"])).unwrap().len(), 2);
        assert!(embedding_inputs(json!([1, 2])).is_err());
        assert!(embedding_inputs(json!(3)).is_err());
    }
}
