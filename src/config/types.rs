//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that the composition root and
//! engines consume. Raw TOML deserialization types live in `raw.rs`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

// ── Tasks ────────────────────────────────────────────────────────────────────

/// Task name that enables the generation engine.
pub const TASK_LLM: &str = "llm";
/// Task name that enables the embedding and reranking models.
pub const TASK_RAG: &str = "rag";

// ── Engine kind ──────────────────────────────────────────────────────────────

/// The generation engine selected by `model.engine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Local transformer-library engine.
    Default,
    /// High-throughput batching engine.
    Vllm,
    /// Quantized CPU/GPU engine.
    LlamaCpp,
    /// Remote text-generation-inference client.
    Tgi,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Default => "default",
            EngineKind::Vllm => "vllm",
            EngineKind::LlamaCpp => "llama.cpp",
            EngineKind::Tgi => "tgi",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(EngineKind::Default),
            "vllm" => Ok(EngineKind::Vllm),
            "llama.cpp" | "llama_cpp" | "llamacpp" => Ok(EngineKind::LlamaCpp),
            "tgi" => Ok(EngineKind::Tgi),
            other => Err(format!("unknown engine: {other:?}")),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// HTTP listener configuration (`[server]`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix for the OpenAI-style routes, e.g. `/v1`.
    pub api_prefix: String,
    pub log_level: String,
    /// Upper bound for a single non-streaming upstream call.
    pub request_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

/// Model selection shared by all engines (`[model]`).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Enabled tasks, lowercased (`"llm"`, `"rag"`).
    pub tasks: Vec<String>,
    /// Master switch: when `false` no model is constructed at all.
    pub activate_inference: bool,
    pub engine: EngineKind,
    /// Name the model is served under.
    pub model_name: String,
    /// Weights location (directory, file, or hub id), already `~`-expanded.
    pub model_path: PathBuf,
    /// `None` when unset or `<= 0` in the file.
    pub context_length: Option<u32>,
    pub chat_template: Option<String>,
}

// ── RAG ──────────────────────────────────────────────────────────────────────

/// Embedding and reranking models (`[rag]`).
#[derive(Debug, Clone)]
pub struct RagConfig {
    pub embedding_name: Option<String>,
    pub embedding_device: Option<String>,
    /// Attach to a running embedding server instead of launching one.
    pub embedding_endpoint: Option<String>,
    pub rerank_name: Option<String>,
    pub rerank_device: Option<String>,
    pub rerank_endpoint: Option<String>,
    /// Binary used to serve RAG models.
    pub program: String,
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Settings for locally launched runtime processes (`[runtime]`).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interface the child runtimes listen on.
    pub bind_host: String,
    pub startup_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

// ── Engines ──────────────────────────────────────────────────────────────────

/// Local transformer-library engine (`[engine.default]`).
#[derive(Debug, Clone, Default)]
pub struct DefaultEngineConfig {
    pub program: String,
    pub device_map: Option<String>,
    pub load_in_8bit: bool,
    pub load_in_4bit: bool,
    pub dtype: Option<String>,
    pub rope_scaling: Option<String>,
    pub flash_attn: bool,
}

/// Batching engine (`[engine.vllm]`).
#[derive(Debug, Clone, Default)]
pub struct VllmConfig {
    /// Python interpreter that has the `vllm` package installed.
    pub python: String,
    pub tokenizer_mode: Option<String>,
    pub trust_remote_code: bool,
    pub tensor_parallel_size: Option<u32>,
    pub dtype: Option<String>,
    pub gpu_memory_utilization: Option<f32>,
    pub max_num_seqs: Option<u32>,
    pub enforce_eager: bool,
    pub max_seq_len_to_capture: Option<u32>,
    pub max_loras: Option<u32>,
    pub max_lora_rank: Option<u32>,
    pub lora_extra_vocab_size: Option<u32>,
    /// `None` when unset or `<= 0` in the file.
    pub max_num_batched_tokens: Option<u32>,
    pub quantization_method: Option<String>,
    /// `None` when unset or `<= 0` in the file.
    pub max_cpu_loras: Option<u32>,
    pub disable_log_stats: bool,
    /// Raw `name=path+name=path` adapter list.
    pub lora_modules: String,
}

/// RoPE scaling mode for llama.cpp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeScalingType {
    None,
    Linear,
    Yarn,
}

impl RopeScalingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RopeScalingType::None => "none",
            RopeScalingType::Linear => "linear",
            RopeScalingType::Yarn => "yarn",
        }
    }
}

/// Quantized engine (`[engine.llama_cpp]`).
#[derive(Debug, Clone, Default)]
pub struct LlamaCppConfig {
    pub program: String,
    pub n_gpu_layers: Option<i32>,
    pub main_gpu: Option<u32>,
    pub tensor_split: Vec<f32>,
    pub n_batch: Option<u32>,
    pub n_threads: Option<u32>,
    pub n_threads_batch: Option<u32>,
    pub rope_scaling_type: Option<RopeScalingType>,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
}

/// Remote inference server (`[engine.tgi]`).
#[derive(Debug, Clone)]
pub struct TgiConfig {
    pub endpoint: String,
    pub timeout_seconds: u64,
}

/// Per-engine sections. Only the section matching `model.engine` is used.
#[derive(Debug, Clone)]
pub struct EnginesConfig {
    pub default: DefaultEngineConfig,
    pub vllm: VllmConfig,
    pub llama_cpp: LlamaCppConfig,
    pub tgi: TgiConfig,
}

// ── Top level ────────────────────────────────────────────────────────────────

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub rag: RagConfig,
    pub runtime: RuntimeConfig,
    pub engines: EnginesConfig,
    /// Bearer tokens from `LLM_SERVE_API_KEYS`. Empty disables auth.
    /// Never sourced from TOML.
    pub api_keys: Vec<String>,
}

impl Config {
    /// `true` if `task` is listed and inference is active.
    pub fn task_enabled(&self, task: &str) -> bool {
        self.model.activate_inference && self.model.tasks.iter().any(|t| t == task)
    }

    /// Returns `true` if a generation engine should be constructed.
    pub fn llm_enabled(&self) -> bool {
        self.task_enabled(TASK_LLM)
    }

    /// Returns `true` if embedding/reranking models should be constructed.
    pub fn rag_enabled(&self) -> bool {
        self.task_enabled(TASK_RAG)
    }
}
