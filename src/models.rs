//! Composition root: builds the optional models from configuration.
//!
//! Construction is sequential and runs once at startup. The result is held
//! behind an `Arc` for the process lifetime.

use std::sync::Arc;

use axum::Router;
use tracing::{error, info};

use crate::config::{Config, EngineKind};
use crate::engine::{EngineError, LlmEngine};
use crate::error::AppError;
use crate::rag::{RagEmbedding, RagReranker};
use crate::server::{self, AppState};

/// `(embedding, reranker)`.
pub type RagModels = (Option<RagEmbedding>, Option<RagReranker>);

/// Everything the request handlers can use. At most one engine.
#[derive(Debug, Default)]
pub struct Models {
    pub embedding: Option<RagEmbedding>,
    pub reranker: Option<RagReranker>,
    pub engine: Option<LlmEngine>,
}

impl Models {
    pub async fn build(config: &Config) -> Result<Self, AppError> {
        let (embedding, reranker) = create_rag_models(config).await?;
        let engine = create_llm_engine(config).await?;

        info!(
            engine = engine.as_ref().map(|e| e.kind().as_str()).unwrap_or("none"),
            embedding = embedding.is_some(),
            reranker = reranker.is_some(),
            "models ready"
        );
        Ok(Self { embedding, reranker, engine })
    }

    /// Shutdown hook: stop every runtime this process launched.
    pub async fn release(&self) {
        if let Some(engine) = &self.engine {
            engine.shutdown().await;
        }
        if let Some(embedding) = &self.embedding {
            embedding.shutdown().await;
        }
        if let Some(reranker) = &self.reranker {
            reranker.shutdown().await;
        }
        info!("inference resources released");
    }
}

/// The HTTP app shell over the built models.
pub fn create_app(config: Arc<Config>, models: Arc<Models>) -> Router {
    server::router(AppState { config, models })
}

// ── RAG ───────────────────────────────────────────────────────────────────────

/// Each model is built only when its name is configured.
pub async fn create_rag_models(config: &Config) -> Result<RagModels, AppError> {
    if !config.rag_enabled() {
        return Ok((None, None));
    }
    let rag = &config.rag;

    let embedding = match rag.embedding_name.as_deref() {
        Some(name) => Some(RagEmbedding::new(name, rag.embedding_device.as_deref(), config).await?),
        None => None,
    };
    let reranker = match rag.rerank_name.as_deref() {
        Some(name) => Some(RagReranker::new(name, rag.rerank_device.as_deref(), config).await?),
        None => None,
    };
    Ok((embedding, reranker))
}

// ── Generation engines ────────────────────────────────────────────────────────

/// Dispatch on `model.engine` to exactly one constructor.
pub async fn create_llm_engine(config: &Config) -> Result<Option<LlmEngine>, AppError> {
    if !config.llm_enabled() {
        return Ok(None);
    }
    match config.model.engine {
        EngineKind::Default => create_default_engine(config).await,
        EngineKind::Vllm => create_vllm_engine(config).await,
        EngineKind::LlamaCpp => create_llama_cpp_engine(config).await,
        EngineKind::Tgi => create_tgi_engine(config).await,
    }
}

/// The default engine is not optional: a missing runtime fails startup.
pub async fn create_default_engine(config: &Config) -> Result<Option<LlmEngine>, AppError> {
    Ok(Some(crate::engine::default::launch(config).await?))
}

pub async fn create_vllm_engine(config: &Config) -> Result<Option<LlmEngine>, AppError> {
    #[cfg(feature = "engine-vllm")]
    {
        optional(EngineKind::Vllm, crate::engine::vllm::launch(config).await)
    }
    #[cfg(not(feature = "engine-vllm"))]
    {
        let _ = config;
        not_compiled(EngineKind::Vllm, "engine-vllm")
    }
}

pub async fn create_llama_cpp_engine(config: &Config) -> Result<Option<LlmEngine>, AppError> {
    #[cfg(feature = "engine-llama-cpp")]
    {
        optional(EngineKind::LlamaCpp, crate::engine::llama_cpp::launch(config).await)
    }
    #[cfg(not(feature = "engine-llama-cpp"))]
    {
        let _ = config;
        not_compiled(EngineKind::LlamaCpp, "engine-llama-cpp")
    }
}

pub async fn create_tgi_engine(config: &Config) -> Result<Option<LlmEngine>, AppError> {
    #[cfg(feature = "engine-tgi")]
    {
        optional(EngineKind::Tgi, crate::engine::tgi::create(config))
    }
    #[cfg(not(feature = "engine-tgi"))]
    {
        let _ = config;
        not_compiled(EngineKind::Tgi, "engine-tgi")
    }
}

/// A missing optional dependency means no engine; anything else is fatal.
#[allow(dead_code)]
fn optional(
    kind: EngineKind,
    result: Result<LlmEngine, EngineError>,
) -> Result<Option<LlmEngine>, AppError> {
    match result {
        Ok(engine) => Ok(Some(engine)),
        Err(EngineError::Unavailable(reason)) => {
            error!(engine = %kind, %reason, "engine unavailable, continuing without one");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[allow(dead_code)]
fn not_compiled(kind: EngineKind, feature: &str) -> Result<Option<LlmEngine>, AppError> {
    error!(engine = %kind, feature, "engine not compiled in, continuing without one");
    Ok(None)
}
