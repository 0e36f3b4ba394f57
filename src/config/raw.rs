//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use serde::Deserialize;

use super::types::RopeScalingType;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape, the serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub server: RawServer,
    #[serde(default)]
    pub model: RawModel,
    #[serde(default)]
    pub rag: RawRag,
    #[serde(default)]
    pub runtime: RawRuntime,
    #[serde(default)]
    pub engine: RawEngines,
}

// ── Server ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawServer {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_prefix: default_api_prefix(),
            log_level: default_log_level(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawModel {
    #[serde(default = "default_tasks")]
    pub tasks: Vec<String>,
    #[serde(default = "default_true")]
    pub activate_inference: bool,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,
    /// `<= 0` means "let the runtime decide".
    #[serde(default = "default_unset")]
    pub context_length: i64,
    #[serde(default)]
    pub chat_template: Option<String>,
}

impl Default for RawModel {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            activate_inference: true,
            engine: default_engine(),
            model_name: None,
            model_path: None,
            context_length: default_unset(),
            chat_template: None,
        }
    }
}

// ── RAG ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawRag {
    #[serde(default)]
    pub embedding_name: Option<String>,
    #[serde(default)]
    pub embedding_device: Option<String>,
    #[serde(default)]
    pub embedding_endpoint: Option<String>,
    #[serde(default)]
    pub rerank_name: Option<String>,
    #[serde(default)]
    pub rerank_device: Option<String>,
    #[serde(default)]
    pub rerank_endpoint: Option<String>,
    #[serde(default = "default_rag_program")]
    pub program: String,
}

impl Default for RawRag {
    fn default() -> Self {
        Self {
            embedding_name: None,
            embedding_device: None,
            embedding_endpoint: None,
            rerank_name: None,
            rerank_device: None,
            rerank_endpoint: None,
            program: default_rag_program(),
        }
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawRuntime {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for RawRuntime {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

// ── Engines ──────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct RawEngines {
    #[serde(default)]
    pub default: RawDefaultEngine,
    #[serde(default)]
    pub vllm: RawVllm,
    #[serde(default)]
    pub llama_cpp: RawLlamaCpp,
    #[serde(default)]
    pub tgi: RawTgi,
}

#[derive(Deserialize)]
pub(super) struct RawDefaultEngine {
    #[serde(default = "default_mistralrs_program")]
    pub program: String,
    #[serde(default)]
    pub device_map: Option<String>,
    #[serde(default)]
    pub load_in_8bit: bool,
    #[serde(default)]
    pub load_in_4bit: bool,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub rope_scaling: Option<String>,
    #[serde(default)]
    pub flash_attn: bool,
}

impl Default for RawDefaultEngine {
    fn default() -> Self {
        Self {
            program: default_mistralrs_program(),
            device_map: None,
            load_in_8bit: false,
            load_in_4bit: false,
            dtype: None,
            rope_scaling: None,
            flash_attn: false,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawVllm {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default)]
    pub tokenizer_mode: Option<String>,
    #[serde(default)]
    pub trust_remote_code: bool,
    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f32>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub enforce_eager: bool,
    #[serde(default)]
    pub max_seq_len_to_capture: Option<u32>,
    #[serde(default)]
    pub max_loras: Option<u32>,
    #[serde(default)]
    pub max_lora_rank: Option<u32>,
    #[serde(default)]
    pub lora_extra_vocab_size: Option<u32>,
    #[serde(default = "default_unset")]
    pub max_num_batched_tokens: i64,
    #[serde(default)]
    pub quantization_method: Option<String>,
    #[serde(default = "default_unset")]
    pub max_cpu_loras: i64,
    #[serde(default = "default_true")]
    pub disable_log_stats: bool,
    #[serde(default)]
    pub lora_modules: String,
}

impl Default for RawVllm {
    fn default() -> Self {
        Self {
            python: default_python(),
            tokenizer_mode: None,
            trust_remote_code: false,
            tensor_parallel_size: None,
            dtype: None,
            gpu_memory_utilization: None,
            max_num_seqs: None,
            enforce_eager: false,
            max_seq_len_to_capture: None,
            max_loras: None,
            max_lora_rank: None,
            lora_extra_vocab_size: None,
            max_num_batched_tokens: default_unset(),
            quantization_method: None,
            max_cpu_loras: default_unset(),
            disable_log_stats: true,
            lora_modules: String::new(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawLlamaCpp {
    #[serde(default = "default_llama_server_program")]
    pub program: String,
    #[serde(default)]
    pub n_gpu_layers: Option<i32>,
    #[serde(default)]
    pub main_gpu: Option<u32>,
    #[serde(default)]
    pub tensor_split: Vec<f32>,
    #[serde(default)]
    pub n_batch: Option<u32>,
    #[serde(default)]
    pub n_threads: Option<u32>,
    #[serde(default)]
    pub n_threads_batch: Option<u32>,
    #[serde(default)]
    pub rope_scaling_type: Option<RopeScalingType>,
    #[serde(default)]
    pub rope_freq_base: Option<f32>,
    #[serde(default)]
    pub rope_freq_scale: Option<f32>,
}

impl Default for RawLlamaCpp {
    fn default() -> Self {
        Self {
            program: default_llama_server_program(),
            n_gpu_layers: None,
            main_gpu: None,
            tensor_split: Vec::new(),
            n_batch: None,
            n_threads: None,
            n_threads_batch: None,
            rope_scaling_type: None,
            rope_freq_base: None,
            rope_freq_scale: None,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawTgi {
    #[serde(default = "default_tgi_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_tgi_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for RawTgi {
    fn default() -> Self {
        Self {
            endpoint: default_tgi_endpoint(),
            timeout_seconds: default_tgi_timeout_seconds(),
        }
    }
}

// ── Default functions (used by serde) ────────────────────────────────────────

pub(super) fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn default_port() -> u16 {
    8000
}

pub(super) fn default_api_prefix() -> String {
    "/v1".to_string()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_request_timeout_seconds() -> u64 {
    600
}

pub(super) fn default_tasks() -> Vec<String> {
    vec!["llm".to_string()]
}

pub(super) fn default_engine() -> String {
    "default".to_string()
}

pub(super) fn default_unset() -> i64 {
    -1
}

pub(super) fn default_rag_program() -> String {
    "text-embeddings-router".to_string()
}

pub(super) fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

pub(super) fn default_startup_timeout_seconds() -> u64 {
    600
}

pub(super) fn default_shutdown_grace_seconds() -> u64 {
    10
}

pub(super) fn default_mistralrs_program() -> String {
    "mistralrs-server".to_string()
}

pub(super) fn default_python() -> String {
    "python3".to_string()
}

pub(super) fn default_llama_server_program() -> String {
    "llama-server".to_string()
}

pub(super) fn default_tgi_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

pub(super) fn default_tgi_timeout_seconds() -> u64 {
    600
}


fn default_true() -> bool {
    true
}
