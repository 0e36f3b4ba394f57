//! Text-generation engines.
//!
//! `LlmEngine` is an enum over the concrete engines. The alternate engines
//! sit behind cargo features; the default engine is always built.
//!
//! Engine instances are owned by `Models` for the process lifetime and
//! shared with request handlers by reference. Every operation is an
//! `async fn` on the enum so callers need no trait-object machinery.

pub mod default;
pub mod local;
pub mod openai_compat;
pub mod types;

#[cfg(feature = "engine-llama-cpp")]
pub mod llama_cpp;
#[cfg(feature = "engine-tgi")]
pub mod tgi;
#[cfg(feature = "engine-vllm")]
pub mod vllm;

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::{Config, ModelConfig};
use crate::runtime::{LaunchSpec, ManagedServer, RuntimeError};

pub use crate::config::EngineKind;
pub use local::LocalEngine;
pub use types::{ChatCompletionRequest, CompletionRequest};

/// Raw SSE bytes from an upstream streaming response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, EngineError>> + Send>>;

/// Models that ship their own chat handling; a configured custom template
/// is not forwarded to them.
pub const EXCLUDE_MODELS: &[&str] = &["baichuan-13b", "baichuan2-13b", "qwen", "chatglm3"];

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// An optional dependency (feature, binary, Python package) is missing.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine startup failed: {0}")]
    Startup(#[from] RuntimeError),
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

// ── Engine enum ───────────────────────────────────────────────────────────────

/// The one active generation engine.
#[derive(Debug)]
pub enum LlmEngine {
    Default(LocalEngine),
    #[cfg(feature = "engine-vllm")]
    Vllm(LocalEngine),
    #[cfg(feature = "engine-llama-cpp")]
    LlamaCpp(LocalEngine),
    #[cfg(feature = "engine-tgi")]
    Tgi(tgi::TgiEngine),
}

macro_rules! dispatch {
    ($self:expr, $e:ident => $body:expr) => {
        match $self {
            LlmEngine::Default($e) => $body,
            #[cfg(feature = "engine-vllm")]
            LlmEngine::Vllm($e) => $body,
            #[cfg(feature = "engine-llama-cpp")]
            LlmEngine::LlamaCpp($e) => $body,
            #[cfg(feature = "engine-tgi")]
            LlmEngine::Tgi($e) => $body,
        }
    };
}

impl LlmEngine {
    pub fn kind(&self) -> EngineKind {
        match self {
            LlmEngine::Default(_) => EngineKind::Default,
            #[cfg(feature = "engine-vllm")]
            LlmEngine::Vllm(_) => EngineKind::Vllm,
            #[cfg(feature = "engine-llama-cpp")]
            LlmEngine::LlamaCpp(_) => EngineKind::LlamaCpp,
            #[cfg(feature = "engine-tgi")]
            LlmEngine::Tgi(_) => EngineKind::Tgi,
        }
    }

    pub fn model_name(&self) -> &str {
        dispatch!(self, e => e.model_name())
    }

    /// Model ids accepted in the `model` field (base model plus adapters).
    pub fn served_models(&self) -> &[String] {
        dispatch!(self, e => e.served_models())
    }

    pub async fn chat(&self, request: ChatCompletionRequest) -> Result<Value, EngineError> {
        validate_messages(&request)?;
        dispatch!(self, e => e.chat(request).await)
    }

    pub async fn chat_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        validate_messages(&request)?;
        dispatch!(self, e => e.chat_stream(request).await)
    }

    pub async fn completion(&self, request: CompletionRequest) -> Result<Value, EngineError> {
        dispatch!(self, e => e.completion(request).await)
    }

    pub async fn completion_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<ChunkStream, EngineError> {
        dispatch!(self, e => e.completion_stream(request).await)
    }

    pub async fn health(&self) -> Result<(), EngineError> {
        dispatch!(self, e => e.health().await)
    }

    /// Release the runtime. Safe to call more than once.
    pub async fn shutdown(&self) {
        dispatch!(self, e => e.shutdown().await)
    }
}

fn validate_messages(request: &ChatCompletionRequest) -> Result<(), EngineError> {
    if request.messages.is_empty() {
        return Err(EngineError::BadRequest("messages must not be empty".into()));
    }
    Ok(())
}

// ── Shared helpers for the local engines ──────────────────────────────────────

/// `true` if `model_name` is on the special processing list.
pub fn is_excluded_model(model_name: &str) -> bool {
    let name = model_name.trim().to_ascii_lowercase();
    EXCLUDE_MODELS.contains(&name.as_str())
}

/// The chat template to forward, if any.
pub fn chat_template_for(model: &ModelConfig) -> Option<&str> {
    let template = model.chat_template.as_deref()?;
    if is_excluded_model(&model.model_name) {
        warn!(
            model = %model.model_name,
            "model ships its own chat handling, ignoring chat_template"
        );
        return None;
    }
    Some(template)
}

/// Resolve a runtime program, or report the engine as unavailable.
pub(crate) fn require_program(engine: EngineKind, program: &str) -> Result<PathBuf, EngineError> {
    crate::runtime::find_program(program).ok_or_else(|| {
        EngineError::Unavailable(format!("{engine}: program '{program}' not found on PATH"))
    })
}

/// A launch description for `program` on `port`, using `[runtime]` settings.
pub(crate) fn launch_spec(
    engine: EngineKind,
    program: PathBuf,
    args: Vec<String>,
    port: u16,
    config: &Config,
) -> LaunchSpec {
    LaunchSpec {
        name: engine.to_string(),
        program,
        args,
        envs: Vec::new(),
        host: config.runtime.bind_host.clone(),
        port,
        health_path: "/health".into(),
        startup_timeout: Duration::from_secs(config.runtime.startup_timeout_seconds),
        shutdown_grace: Duration::from_secs(config.runtime.shutdown_grace_seconds),
    }
}

/// Launch the runtime and wrap it as a [`LocalEngine`].
pub(crate) async fn launch_local(
    spec: LaunchSpec,
    config: &Config,
    extra_models: Vec<String>,
) -> Result<LocalEngine, EngineError> {
    let server = ManagedServer::launch(spec).await?;
    LocalEngine::launched(
        server,
        config.server.request_timeout_seconds,
        config.model.model_name.clone(),
        extra_models,
    )
}

/// `--flag value` when `value` is set.
pub(crate) fn push_opt<T: ToString>(args: &mut Vec<String>, flag: &str, value: Option<T>) {
    if let Some(v) = value {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

/// `--flag` when `enabled`.
#[cfg(feature = "engine-vllm")]
pub(crate) fn push_flag(args: &mut Vec<String>, flag: &str, enabled: bool) {
    if enabled {
        args.push(flag.to_string());
    }
}
