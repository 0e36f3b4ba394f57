//! Batching engine: vLLM's OpenAI-compatible API server.
//!
//! vLLM is a Python package, so availability is probed with
//! `python -c "import vllm"` before anything is launched.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{Config, EngineKind};
use crate::runtime::python_has_module;

use super::{
    EngineError, LlmEngine, chat_template_for, launch_local, launch_spec, push_flag, push_opt,
};

/// One `name=path` LoRA adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraModule {
    pub name: String,
    pub path: String,
}

/// Parse `name=path+name=path`. Items without `=` are skipped.
pub fn parse_lora_modules(raw: &str) -> Vec<LoraModule> {
    raw.split('+')
        .map(str::trim)
        .filter_map(|item| {
            let (name, path) = item.split_once('=')?;
            let (name, path) = (name.trim(), path.trim());
            if name.is_empty() || path.is_empty() {
                debug!(item, "skipping malformed lora module");
                return None;
            }
            Some(LoraModule { name: name.to_string(), path: path.to_string() })
        })
        .collect()
}

/// Arguments after `python`.
pub fn build_args(config: &Config, port: u16, loras: &[LoraModule]) -> Vec<String> {
    let model = &config.model;
    let v = &config.engines.vllm;

    let mut args = vec![
        "-m".to_string(),
        "vllm.entrypoints.openai.api_server".to_string(),
        "--model".to_string(),
        model.model_path.to_string_lossy().into_owned(),
        "--served-model-name".to_string(),
        model.model_name.clone(),
        "--host".to_string(),
        config.runtime.bind_host.clone(),
        "--port".to_string(),
        port.to_string(),
    ];

    push_opt(&mut args, "--tokenizer-mode", v.tokenizer_mode.as_deref());
    push_flag(&mut args, "--trust-remote-code", v.trust_remote_code);
    push_opt(&mut args, "--tensor-parallel-size", v.tensor_parallel_size);
    push_opt(&mut args, "--dtype", v.dtype.as_deref());
    push_opt(&mut args, "--gpu-memory-utilization", v.gpu_memory_utilization);
    push_opt(&mut args, "--max-num-seqs", v.max_num_seqs);
    push_flag(&mut args, "--enforce-eager", v.enforce_eager);
    push_opt(&mut args, "--max-seq-len-to-capture", v.max_seq_len_to_capture);
    push_opt(&mut args, "--max-model-len", model.context_length);
    push_opt(&mut args, "--max-num-batched-tokens", v.max_num_batched_tokens);
    push_opt(&mut args, "--quantization", v.quantization_method.as_deref());
    push_flag(&mut args, "--disable-log-stats", v.disable_log_stats);
    args.push("--disable-log-requests".to_string());
    push_opt(&mut args, "--chat-template", chat_template_for(model));
    push_opt(&mut args, "--max-loras", v.max_loras);
    push_opt(&mut args, "--max-lora-rank", v.max_lora_rank);
    push_opt(&mut args, "--lora-extra-vocab-size", v.lora_extra_vocab_size);
    push_opt(&mut args, "--max-cpu-loras", v.max_cpu_loras);

    if !loras.is_empty() {
        args.push("--enable-lora".to_string());
        args.push("--lora-modules".to_string());
        args.extend(loras.iter().map(|l| format!("{}={}", l.name, l.path)));
    }

    args
}

/// Fails with [`EngineError::Unavailable`] when the package is not installed.
pub async fn probe(python: &Path) -> Result<(), EngineError> {
    if python_has_module(python, "vllm").await {
        Ok(())
    } else {
        Err(EngineError::Unavailable(format!(
            "vllm: python package not importable with '{}'",
            python.display()
        )))
    }
}

pub async fn launch(config: &Config) -> Result<LlmEngine, EngineError> {
    let python = crate::runtime::find_program(&config.engines.vllm.python)
        .unwrap_or_else(|| PathBuf::from(&config.engines.vllm.python));
    probe(&python).await?;

    let loras = parse_lora_modules(&config.engines.vllm.lora_modules);
    let port = crate::runtime::pick_port()?;
    let args = build_args(config, port, &loras);
    info!(
        model = %config.model.model_name,
        loras = loras.len(),
        "starting vllm engine"
    );

    let spec = launch_spec(EngineKind::Vllm, python, args, port, config);
    let extra = loras.into_iter().map(|l| l.name).collect();
    Ok(LlmEngine::Vllm(launch_local(spec, config, extra).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut cfg = Config::test_default();
        cfg.model.model_path = "/models/llama-3-8b".into();
        cfg.model.model_name = "llama-3-8b".into();
        cfg
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).map(|i| args[i + 1].as_str())
    }

    #[test]
    fn lora_parsing_skips_malformed_items() {
        let loras = parse_lora_modules("sql=/loras/sql + bad +chat = /loras/chat+=x+");
        assert_eq!(
            loras,
            vec![
                LoraModule { name: "sql".into(), path: "/loras/sql".into() },
                LoraModule { name: "chat".into(), path: "/loras/chat".into() },
            ]
        );
        assert!(parse_lora_modules("").is_empty());
    }

    #[test]
    fn base_args() {
        let args = build_args(&config(), 5000, &[]);
        assert_eq!(&args[..2], ["-m", "vllm.entrypoints.openai.api_server"]);
        assert_eq!(value_after(&args, "--model"), Some("/models/llama-3-8b"));
        assert_eq!(value_after(&args, "--served-model-name"), Some("llama-3-8b"));
        assert_eq!(value_after(&args, "--port"), Some("5000"));
        assert!(args.contains(&"--disable-log-requests".to_string()));
        assert!(args.contains(&"--disable-log-stats".to_string()));
        assert!(!args.contains(&"--enable-lora".to_string()));
        assert!(!args.contains(&"--max-model-len".to_string()));
        assert!(!args.contains(&"--max-num-batched-tokens".to_string()));
    }

    #[test]
    fn set_options_are_emitted() {
        let mut cfg = config();
        cfg.model.context_length = Some(8192);
        cfg.engines.vllm.tensor_parallel_size = Some(2);
        cfg.engines.vllm.gpu_memory_utilization = Some(0.85);
        cfg.engines.vllm.trust_remote_code = true;
        cfg.engines.vllm.max_num_batched_tokens = Some(16384);
        cfg.engines.vllm.quantization_method = Some("awq".into());
        cfg.engines.vllm.disable_log_stats = false;
        let args = build_args(&cfg, 5000, &[]);
        assert_eq!(value_after(&args, "--max-model-len"), Some("8192"));
        assert_eq!(value_after(&args, "--tensor-parallel-size"), Some("2"));
        assert_eq!(value_after(&args, "--gpu-memory-utilization"), Some("0.85"));
        assert_eq!(value_after(&args, "--max-num-batched-tokens"), Some("16384"));
        assert_eq!(value_after(&args, "--quantization"), Some("awq"));
        assert!(args.contains(&"--trust-remote-code".to_string()));
        assert!(!args.contains(&"--disable-log-stats".to_string()));
    }

    #[test]
    fn lora_args() {
        let mut cfg = config();
        cfg.engines.vllm.max_loras = Some(2);
        cfg.engines.vllm.max_cpu_loras = Some(4);
        let loras = parse_lora_modules("sql=/loras/sql+chat=/loras/chat");
        let args = build_args(&cfg, 5000, &loras);
        assert!(args.contains(&"--enable-lora".to_string()));
        assert_eq!(value_after(&args, "--max-loras"), Some("2"));
        assert_eq!(value_after(&args, "--max-cpu-loras"), Some("4"));
        let at = args.iter().position(|a| a == "--lora-modules").unwrap();
        assert_eq!(&args[at + 1..], ["sql=/loras/sql", "chat=/loras/chat"]);
    }

    #[test]
    fn lora_sizing_emitted_without_adapters() {
        let mut cfg = config();
        cfg.engines.vllm.max_loras = Some(3);
        cfg.engines.vllm.max_lora_rank = Some(32);
        let args = build_args(&cfg, 5000, &[]);
        assert_eq!(value_after(&args, "--max-loras"), Some("3"));
        assert_eq!(value_after(&args, "--max-lora-rank"), Some("32"));
        assert!(!args.contains(&"--enable-lora".to_string()));
        assert!(!args.contains(&"--lora-modules".to_string()));
    }

    #[tokio::test]
    async fn missing_python_package_is_unavailable() {
        let err = probe(Path::new("/nonexistent/python3")).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
