//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `LLM_SERVE_LOG_LEVEL`, `LLM_SERVE_ENGINE` and
//! `LLM_SERVE_API_KEYS` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

use super::raw::RawConfig;
use super::types::*;

/// Values taken from the environment rather than the file.
///
/// Tests build this directly instead of mutating env vars.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub engine: Option<String>,
    pub api_keys: Option<String>,
}

impl ConfigOverrides {
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("LLM_SERVE_LOG_LEVEL").ok(),
            engine: env::var("LLM_SERVE_ENGINE").ok(),
            api_keys: env::var("LLM_SERVE_API_KEYS").ok(),
        }
    }
}

/// Deep-merge two TOML values.
/// Tables are merged recursively; the overlay only needs to specify keys that
/// differ from the base. For every other type (string, integer, array, …)
/// the overlay value replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load config from the given path, or `config/default.toml`, then apply env-var overrides.
/// If no path is given and `config/default.toml` does not exist, built-in defaults are used.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let overrides = ConfigOverrides::from_env();

    if let Some(path) = config_path {
        return load_from(Path::new(path), &overrides);
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(default_path, &overrides)
    } else {
        resolve(RawConfig::default(), &overrides)
    }
}

/// Load from an explicit path with explicit overrides.
/// Follows `[meta] base = "..."` inheritance chains before resolving.
pub fn load_from(path: &Path, overrides: &ConfigOverrides) -> Result<Config, AppError> {
    let merged_val = load_raw_merged(path, &mut HashSet::new())?;

    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    resolve(parsed, overrides)
}

fn resolve(parsed: RawConfig, overrides: &ConfigOverrides) -> Result<Config, AppError> {
    let s = parsed.server;
    let m = parsed.model;

    let engine_name = overrides.engine.as_deref().unwrap_or(&m.engine);
    let engine: EngineKind = engine_name.parse().map_err(AppError::Config)?;

    let de = parsed.engine.default;
    if de.load_in_8bit && de.load_in_4bit {
        return Err(AppError::Config(
            "engine.default: load_in_8bit and load_in_4bit are mutually exclusive".into(),
        ));
    }

    let model_path = m.model_path.as_deref().map(expand_home).unwrap_or_default();
    let model_name = m
        .model_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_model_name(&model_path));

    let api_prefix = normalize_prefix(&s.api_prefix);

    let vllm = parsed.engine.vllm;
    let llama = parsed.engine.llama_cpp;
    let rag = parsed.rag;

    Ok(Config {
        server: ServerConfig {
            host: s.host,
            port: s.port,
            api_prefix,
            log_level: overrides.log_level.clone().unwrap_or(s.log_level),
            request_timeout_seconds: s.request_timeout_seconds,
        },
        model: ModelConfig {
            tasks: m.tasks.iter().map(|t| t.trim().to_ascii_lowercase()).collect(),
            activate_inference: m.activate_inference,
            engine,
            model_name,
            model_path,
            context_length: positive(m.context_length),
            chat_template: non_empty(m.chat_template),
        },
        rag: RagConfig {
            embedding_name: non_empty(rag.embedding_name),
            embedding_device: non_empty(rag.embedding_device),
            embedding_endpoint: non_empty(rag.embedding_endpoint),
            rerank_name: non_empty(rag.rerank_name),
            rerank_device: non_empty(rag.rerank_device),
            rerank_endpoint: non_empty(rag.rerank_endpoint),
            program: rag.program,
        },
        runtime: RuntimeConfig {
            bind_host: parsed.runtime.bind_host,
            startup_timeout_seconds: parsed.runtime.startup_timeout_seconds,
            shutdown_grace_seconds: parsed.runtime.shutdown_grace_seconds,
        },
        engines: EnginesConfig {
            default: DefaultEngineConfig {
                program: de.program,
                device_map: non_empty(de.device_map),
                load_in_8bit: de.load_in_8bit,
                load_in_4bit: de.load_in_4bit,
                dtype: non_empty(de.dtype),
                rope_scaling: non_empty(de.rope_scaling),
                flash_attn: de.flash_attn,
            },
            vllm: VllmConfig {
                python: vllm.python,
                tokenizer_mode: non_empty(vllm.tokenizer_mode),
                trust_remote_code: vllm.trust_remote_code,
                tensor_parallel_size: vllm.tensor_parallel_size,
                dtype: non_empty(vllm.dtype),
                gpu_memory_utilization: vllm.gpu_memory_utilization,
                max_num_seqs: vllm.max_num_seqs,
                enforce_eager: vllm.enforce_eager,
                max_seq_len_to_capture: vllm.max_seq_len_to_capture,
                max_loras: vllm.max_loras,
                max_lora_rank: vllm.max_lora_rank,
                lora_extra_vocab_size: vllm.lora_extra_vocab_size,
                max_num_batched_tokens: positive(vllm.max_num_batched_tokens),
                quantization_method: non_empty(vllm.quantization_method),
                max_cpu_loras: positive(vllm.max_cpu_loras),
                disable_log_stats: vllm.disable_log_stats,
                lora_modules: vllm.lora_modules,
            },
            llama_cpp: LlamaCppConfig {
                program: llama.program,
                n_gpu_layers: llama.n_gpu_layers,
                main_gpu: llama.main_gpu,
                tensor_split: llama.tensor_split,
                n_batch: llama.n_batch,
                n_threads: llama.n_threads,
                n_threads_batch: llama.n_threads_batch,
                rope_scaling_type: llama.rope_scaling_type,
                rope_freq_base: llama.rope_freq_base,
                rope_freq_scale: llama.rope_freq_scale,
            },
            tgi: TgiConfig {
                endpoint: parsed.engine.tgi.endpoint.trim_end_matches('/').to_string(),
                timeout_seconds: parsed.engine.tgi.timeout_seconds,
            },
        },
        api_keys: overrides
            .api_keys
            .as_deref()
            .map(parse_api_keys)
            .unwrap_or_default(),
    })
}

/// Map the file's "`<= 0` means unset" integers onto `Option`.
fn positive(value: i64) -> Option<u32> {
    if value > 0 {
        u32::try_from(value).ok()
    } else {
        None
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `"/v1/"` → `"/v1"`, `"v1"` → `"/v1"`, `""` → `""` (routes at the root).
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Served name when `model_name` is not configured: the last path segment.
fn default_model_name(model_path: &Path) -> String {
    model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
