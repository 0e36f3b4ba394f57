//! Default engine: a local transformer runtime (`mistralrs-server`).
//!
//! Always compiled in. A missing binary is reported as unavailable like the
//! other engines, but the composition root treats it as fatal.

use tracing::{info, warn};

use crate::config::{Config, EngineKind};

use super::{
    EngineError, LlmEngine, chat_template_for, launch_local, launch_spec, push_opt, require_program,
};

/// Command-line arguments for `mistralrs-server`.
///
/// Global options come first, then the `plain` model subcommand with its
/// own options (`-m`, `--dtype`, `--max-seq-len`).
pub fn build_args(config: &Config, port: u16) -> Vec<String> {
    let model = &config.model;
    let settings = &config.engines.default;

    let mut args = vec![
        "--serve-ip".to_string(),
        config.runtime.bind_host.clone(),
        "--port".to_string(),
        port.to_string(),
    ];

    if settings.device_map.as_deref().is_some_and(|d| d.eq_ignore_ascii_case("cpu")) {
        args.push("--cpu".to_string());
    }

    let isq = if settings.load_in_8bit {
        Some("Q8_0")
    } else if settings.load_in_4bit {
        Some("Q4K")
    } else {
        None
    };
    push_opt(&mut args, "--isq", isq);
    push_opt(&mut args, "--chat-template", chat_template_for(model));

    args.push("plain".to_string());
    args.push("-m".to_string());
    args.push(model.model_path.to_string_lossy().into_owned());

    let dtype = settings.dtype.as_deref().filter(|d| !d.eq_ignore_ascii_case("auto"));
    push_opt(&mut args, "--dtype", dtype);
    push_opt(&mut args, "--max-seq-len", model.context_length);

    args
}

pub async fn launch(config: &Config) -> Result<LlmEngine, EngineError> {
    let settings = &config.engines.default;
    let program = require_program(EngineKind::Default, &settings.program)?;

    if settings.rope_scaling.is_some() {
        warn!("engine.default.rope_scaling has no effect on this runtime, ignoring");
    }
    if settings.flash_attn {
        warn!("engine.default.flash_attn has no effect on this runtime, ignoring");
    }

    let port = crate::runtime::pick_port()?;
    let args = build_args(config, port);
    info!(model = %config.model.model_name, path = %config.model.model_path.display(), "starting default engine");

    let spec = launch_spec(EngineKind::Default, program, args, port, config);
    Ok(LlmEngine::Default(launch_local(spec, config, Vec::new()).await?))
}
