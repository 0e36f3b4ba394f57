//! Quantized engine: llama.cpp's `llama-server`.

use tracing::info;

use crate::config::{Config, EngineKind};

use super::{
    EngineError, LlmEngine, chat_template_for, launch_local, launch_spec, push_opt,
    require_program,
};

/// Context size used when `context_length` is unset.
pub const DEFAULT_CTX_SIZE: u32 = 2048;

pub fn build_args(config: &Config, port: u16) -> Vec<String> {
    let model = &config.model;
    let l = &config.engines.llama_cpp;

    let mut args = vec![
        "--model".to_string(),
        model.model_path.to_string_lossy().into_owned(),
        "--alias".to_string(),
        model.model_name.clone(),
        "--host".to_string(),
        config.runtime.bind_host.clone(),
        "--port".to_string(),
        port.to_string(),
        "--ctx-size".to_string(),
        model.context_length.unwrap_or(DEFAULT_CTX_SIZE).to_string(),
    ];

    push_opt(&mut args, "--n-gpu-layers", l.n_gpu_layers);
    push_opt(&mut args, "--main-gpu", l.main_gpu);
    if !l.tensor_split.is_empty() {
        let split = l.tensor_split.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",");
        args.extend(["--tensor-split".to_string(), split]);
    }
    push_opt(&mut args, "--batch-size", l.n_batch);
    push_opt(&mut args, "--threads", l.n_threads);
    push_opt(&mut args, "--threads-batch", l.n_threads_batch);
    push_opt(&mut args, "--rope-scaling", l.rope_scaling_type.map(|r| r.as_str()));
    push_opt(&mut args, "--rope-freq-base", l.rope_freq_base);
    push_opt(&mut args, "--rope-freq-scale", l.rope_freq_scale);
    push_opt(&mut args, "--chat-template", chat_template_for(model));

    args
}

pub async fn launch(config: &Config) -> Result<LlmEngine, EngineError> {
    let program = require_program(EngineKind::LlamaCpp, &config.engines.llama_cpp.program)?;
    let port = crate::runtime::pick_port()?;
    let args = build_args(config, port);
    info!(model = %config.model.model_name, "starting llama.cpp engine");

    let spec = launch_spec(EngineKind::LlamaCpp, program, args, port, config);
    Ok(LlmEngine::LlamaCpp(launch_local(spec, config, Vec::new()).await?))
}
