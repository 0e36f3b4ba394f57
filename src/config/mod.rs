//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the file passed with `-f`), then applies
//! `LLM_SERVE_*` env overrides.
//!
//! # Module layout
//!
//! - **types**: public configuration structs (`Config`, `ModelConfig`,
//!   per-engine sections, `EngineKind`).
//! - **raw**: raw TOML deserialization types. These mirror the file shape
//!   and use serde defaults; kept private.
//! - **load**: loading logic: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`, `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{ConfigOverrides, expand_home, load, load_from};
pub use types::*;

impl Config {
    /// `Config` for tests. No tasks enabled, so nothing is launched.
    pub fn test_default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                api_prefix: raw::default_api_prefix(),
                log_level: "info".into(),
                request_timeout_seconds: 5,
            },
            model: ModelConfig {
                tasks: Vec::new(),
                activate_inference: true,
                engine: EngineKind::Default,
                model_name: "test-model".into(),
                model_path: std::path::PathBuf::from("/nonexistent/model"),
                context_length: None,
                chat_template: None,
            },
            rag: RagConfig {
                embedding_name: None,
                embedding_device: None,
                embedding_endpoint: None,
                rerank_name: None,
                rerank_device: None,
                rerank_endpoint: None,
                program: raw::default_rag_program(),
            },
            runtime: RuntimeConfig {
                bind_host: raw::default_bind_host(),
                startup_timeout_seconds: 1,
                shutdown_grace_seconds: 1,
            },
            engines: EnginesConfig {
                default: DefaultEngineConfig {
                    program: raw::default_mistralrs_program(),
                    ..Default::default()
                },
                vllm: VllmConfig {
                    python: raw::default_python(),
                    disable_log_stats: true,
                    ..Default::default()
                },
                llama_cpp: LlamaCppConfig {
                    program: raw::default_llama_server_program(),
                    ..Default::default()
                },
                tgi: TgiConfig {
                    endpoint: "http://127.0.0.1:0".into(),
                    timeout_seconds: 1,
                },
            },
            api_keys: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[model]
model_name = "qwen2-7b"
model_path = "/models/qwen2-7b"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn no_overrides() -> ConfigOverrides {
        ConfigOverrides::default()
    }

    #[test]
    fn parse_minimal_config_with_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert_eq!(cfg.model.model_name, "qwen2-7b");
        assert_eq!(cfg.model.engine, EngineKind::Default);
        assert_eq!(cfg.model.tasks, vec!["llm".to_string()]);
        assert!(cfg.model.activate_inference);
        assert_eq!(cfg.model.context_length, None);
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.api_prefix, "/v1");
        assert_eq!(cfg.engines.llama_cpp.program, "llama-server");
        assert!(cfg.engines.vllm.disable_log_stats);
        assert!(cfg.api_keys.is_empty());
    }

    #[test]
    fn non_positive_lengths_are_unset() {
        let f = write_toml(
            r#"
[model]
context_length = 0

[engine.vllm]
max_num_batched_tokens = -1
max_cpu_loras = 4
"#,
        );
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert_eq!(cfg.model.context_length, None);
        assert_eq!(cfg.engines.vllm.max_num_batched_tokens, None);
        assert_eq!(cfg.engines.vllm.max_cpu_loras, Some(4));
    }

    #[test]
    fn engine_names_parse() {
        assert_eq!("default".parse::<EngineKind>(), Ok(EngineKind::Default));
        assert_eq!("vllm".parse::<EngineKind>(), Ok(EngineKind::Vllm));
        assert_eq!("llama.cpp".parse::<EngineKind>(), Ok(EngineKind::LlamaCpp));
        assert_eq!("LLAMA_CPP".parse::<EngineKind>(), Ok(EngineKind::LlamaCpp));
        assert_eq!("tgi".parse::<EngineKind>(), Ok(EngineKind::Tgi));
        assert!("onnx".parse::<EngineKind>().is_err());
        assert_eq!(EngineKind::LlamaCpp.to_string(), "llama.cpp");
    }

    #[test]
    fn unknown_engine_is_config_error() {
        let f = write_toml("[model]\nengine = \"exllama\"\n");
        let msg = load_from(f.path(), &no_overrides()).unwrap_err().to_string();
        assert!(msg.contains("config error"));
        assert!(msg.contains("exllama"));
    }

    #[test]
    fn conflicting_quantization_flags_error() {
        let f = write_toml("[engine.default]\nload_in_8bit = true\nload_in_4bit = true\n");
        assert!(load_from(f.path(), &no_overrides()).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let overrides = ConfigOverrides {
            log_level: Some("debug".into()),
            engine: Some("tgi".into()),
            api_keys: Some("sk-one, ,sk-two".into()),
        };
        let cfg = load_from(f.path(), &overrides).unwrap();
        assert_eq!(cfg.server.log_level, "debug");
        assert_eq!(cfg.model.engine, EngineKind::Tgi);
        assert_eq!(cfg.api_keys, vec!["sk-one".to_string(), "sk-two".to_string()]);
    }

    #[test]
    fn task_switches_respect_activate_inference() {
        let f = write_toml("[model]\ntasks = [\"LLM\", \"rag\"]\n");
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert!(cfg.llm_enabled());
        assert!(cfg.rag_enabled());

        let f = write_toml("[model]\ntasks = [\"llm\", \"rag\"]\nactivate_inference = false\n");
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert!(!cfg.llm_enabled());
        assert!(!cfg.rag_enabled());
    }

    #[test]
    fn model_name_defaults_to_path_tail() {
        let f = write_toml("[model]\nmodel_path = \"/models/Mistral-7B-Instruct\"\n");
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert_eq!(cfg.model.model_name, "Mistral-7B-Instruct");
    }

    #[test]
    fn api_prefix_is_normalized() {
        let f = write_toml("[server]\napi_prefix = \"api/v1/\"\n");
        let cfg = load_from(f.path(), &no_overrides()).unwrap();
        assert_eq!(cfg.server.api_prefix, "/api/v1");
    }

    #[test]
    fn base_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.toml");
        std::fs::write(&base, "[model]\nengine = \"vllm\"\nmodel_name = \"base\"\n").unwrap();
        let child = dir.path().join("child.toml");
        std::fs::write(&child, "[meta]\nbase = \"base.toml\"\n\n[model]\nmodel_name = \"child\"\n")
            .unwrap();

        let cfg = load_from(&child, &no_overrides()).unwrap();
        assert_eq!(cfg.model.engine, EngineKind::Vllm);
        assert_eq!(cfg.model.model_name, "child");
    }

    #[test]
    fn circular_base_errors() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        let b = dir.path().join("b.toml");
        std::fs::write(&a, "[meta]\nbase = \"b.toml\"\n").unwrap();
        std::fs::write(&b, "[meta]\nbase = \"a.toml\"\n").unwrap();
        let msg = load_from(&a, &no_overrides()).unwrap_err().to_string();
        assert!(msg.contains("circular"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), &no_overrides());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/models/llama");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with("models/llama"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
