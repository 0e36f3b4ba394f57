//! Embedding and reranking models for retrieval.
//!
//! Both are served by a text-embeddings-inference router, either launched
//! here (one process per model) or attached through a configured endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::EngineError;
use crate::engine::openai_compat::OpenAiCompatClient;
use crate::runtime::{LaunchSpec, ManagedServer, RuntimeError, find_program, pick_port};

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RagError {
    #[error("rag program '{0}' not found on PATH")]
    ProgramNotFound(String),
    #[error("rag runtime failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Client(#[from] EngineError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

// ── Shared server handle ──────────────────────────────────────────────────────

#[derive(Debug)]
struct RagServer {
    model: String,
    client: OpenAiCompatClient,
    server: Option<ManagedServer>,
}

impl RagServer {
    async fn start(
        role: &str,
        model: &str,
        device: Option<&str>,
        endpoint: Option<&str>,
        config: &Config,
    ) -> Result<Self, RagError> {
        let timeout = config.server.request_timeout_seconds;

        if let Some(endpoint) = endpoint {
            info!(role, model, endpoint, "attaching to rag server");
            if device.is_some() {
                warn!(role, "device is ignored for an attached rag server");
            }
            return Ok(Self {
                model: model.to_string(),
                client: OpenAiCompatClient::new(endpoint, timeout)?,
                server: None,
            });
        }

        let program = find_program(&config.rag.program)
            .ok_or_else(|| RagError::ProgramNotFound(config.rag.program.clone()))?;
        let port = pick_port()?;
        let spec = LaunchSpec {
            name: role.to_string(),
            program,
            args: build_args(model, &config.runtime.bind_host, port),
            envs: device.and_then(device_env).into_iter().collect(),
            host: config.runtime.bind_host.clone(),
            port,
            health_path: "/health".into(),
            startup_timeout: Duration::from_secs(config.runtime.startup_timeout_seconds),
            shutdown_grace: Duration::from_secs(config.runtime.shutdown_grace_seconds),
        };

        let server = ManagedServer::launch(spec).await?;
        Ok(Self {
            model: model.to_string(),
            client: OpenAiCompatClient::new(server.base_url(), timeout)?,
            server: Some(server),
        })
    }

    async fn shutdown(&self) {
        if let Some(server) = &self.server {
            server.shutdown().await;
        }
    }
}

/// Arguments for `text-embeddings-router`.
pub fn build_args(model: &str, host: &str, port: u16) -> Vec<String> {
    vec![
        "--model-id".to_string(),
        model.to_string(),
        "--hostname".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ]
}

/// `cpu` hides every GPU, `cuda:N` selects N, `cuda` keeps the default.
pub fn device_env(device: &str) -> Option<(String, String)> {
    let device = device.trim().to_ascii_lowercase();
    let visible = match device.as_str() {
        "" | "cuda" | "auto" => return None,
        "cpu" => String::new(),
        other => other.strip_prefix("cuda:").unwrap_or(other).to_string(),
    };
    Some(("CUDA_VISIBLE_DEVICES".to_string(), visible))
}

// ── Embedding ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RagEmbedding {
    inner: RagServer,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

impl RagEmbedding {
    pub async fn new(name: &str, device: Option<&str>, config: &Config) -> Result<Self, RagError> {
        let endpoint = config.rag.embedding_endpoint.as_deref();
        let inner = RagServer::start("embedding", name, device, endpoint, config).await?;
        Ok(Self { inner })
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model
    }

    /// One vector per input, in input order.
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if inputs.is_empty() {
            return Err(RagError::BadRequest("input must not be empty".into()));
        }
        let body = EmbedRequest { inputs, truncate: true };
        let raw = self.inner.client.post_json("/embed", &body).await?;
        let vectors: Vec<Vec<f32>> = serde_json::from_value(raw).map_err(|e| {
            EngineError::Request(format!("failed to parse embedding response: {e}"))
        })?;
        if vectors.len() != inputs.len() {
            return Err(EngineError::Request(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                vectors.len()
            ))
            .into());
        }
        Ok(vectors)
    }

    pub async fn health(&self) -> Result<(), RagError> {
        Ok(self.inner.client.health("/health").await?)
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

// ── Reranker ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RagReranker {
    inner: RagServer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Position in the submitted document list.
    pub index: usize,
    pub score: f32,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    truncate: bool,
}

impl RagReranker {
    pub async fn new(name: &str, device: Option<&str>, config: &Config) -> Result<Self, RagError> {
        let endpoint = config.rag.rerank_endpoint.as_deref();
        let inner = RagServer::start("reranker", name, device, endpoint, config).await?;
        Ok(Self { inner })
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model
    }

    /// Score `documents` against `query`, best first, at most `top_n`.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: Option<usize>,
    ) -> Result<Vec<RerankResult>, RagError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = RerankRequest { query, texts: documents, truncate: true };
        let raw = self.inner.client.post_json("/rerank", &body).await?;
        let results: Vec<RerankResult> = serde_json::from_value(raw)
            .map_err(|e| EngineError::Request(format!("failed to parse rerank response: {e}")))?;
        Ok(rank(results, documents.len(), top_n))
    }

    pub async fn health(&self) -> Result<(), RagError> {
        Ok(self.inner.client.health("/health").await?)
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

/// Drop out-of-range indices, sort by descending score, truncate.
fn rank(mut results: Vec<RerankResult>, len: usize, top_n: Option<usize>) -> Vec<RerankResult> {
    results.retain(|r| r.index < len);
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    if let Some(n) = top_n {
        results.truncate(n);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::routing::post;
    use serde_json::{Value, json};

    async fn fake_tei() -> String {
        let app = axum::Router::new()
            .route(
                "/embed",
                post(|Json(body): Json<Value>| async move {
                    let n = body["inputs"].as_array().map(Vec::len).unwrap_or(0);
                    Json(json!(vec![vec![0.5_f32, 0.25]; n]))
                }),
            )
            .route(
                "/rerank",
                post(|| async {
                    Json(json!([
                        {"index": 0, "score": 0.1},
                        {"index": 2, "score": 0.9},
                        {"index": 1, "score": 0.5}
                    ]))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn attached_config(endpoint: &str) -> Config {
        let mut cfg = Config::test_default();
        cfg.rag.embedding_endpoint = Some(endpoint.to_string());
        cfg.rag.rerank_endpoint = Some(endpoint.to_string());
        cfg
    }

    #[test]
    fn device_mapping() {
        assert_eq!(device_env("cpu"), Some(("CUDA_VISIBLE_DEVICES".into(), String::new())));
        assert_eq!(device_env("cuda:1"), Some(("CUDA_VISIBLE_DEVICES".into(), "1".into())));
        assert_eq!(device_env("0,1"), Some(("CUDA_VISIBLE_DEVICES".into(), "0,1".into())));
        assert_eq!(device_env("cuda"), None);
    }

    #[test]
    fn router_args() {
        assert_eq!(
            build_args("BAAI/bge-m3", "127.0.0.1", 7000),
            ["--model-id", "BAAI/bge-m3", "--hostname", "127.0.0.1", "--port", "7000"]
        );
    }

    #[test]
    fn rank_sorts_and_truncates() {
        let results = vec![
            RerankResult { index: 0, score: 0.2 },
            RerankResult { index: 5, score: 0.99 },
            RerankResult { index: 1, score: 0.7 },
        ];
        let ranked = rank(results, 2, Some(1));
        assert_eq!(ranked, vec![RerankResult { index: 1, score: 0.7 }]);
    }

    #[tokio::test]
    async fn embed_against_attached_server() {
        let endpoint = fake_tei().await;
        let model = RagEmbedding::new("bge", None, &attached_config(&endpoint)).await.unwrap();
        let vectors = model.embed(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.5, 0.25]);
        assert!(matches!(model.embed(&[]).await, Err(RagError::BadRequest(_))));
        model.shutdown().await;
    }

    #[tokio::test]
    async fn rerank_against_attached_server() {
        let endpoint = fake_tei().await;
        let model =
            RagReranker::new("bge-reranker", None, &attached_config(&endpoint)).await.unwrap();
        let docs: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
        let ranked = model.rerank("q", &docs, Some(2)).await.unwrap();
        assert_eq!(ranked.iter().map(|r| r.index).collect::<Vec<_>>(), vec![2, 1]);
        assert!(model.rerank("q", &[], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_router_program_errors() {
        let mut cfg = Config::test_default();
        cfg.rag.program = "no-such-embeddings-router-2d1".into();
        let err = RagEmbedding::new("bge", Some("cpu"), &cfg).await.unwrap_err();
        assert!(matches!(err, RagError::ProgramNotFound(_)));
    }
}
