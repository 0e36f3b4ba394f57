//! Process-wide tracing setup.
//!
//! Runtime child output is logged at `debug` under this crate's target, so
//! `-vv` shows it. The HTTP client and server plumbing stays at `info` unless
//! a directive names it explicitly.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use crate::error::AppError;

/// Crates that are chatty at `debug` and only interesting when asked for.
const PLUMBING_CRATES: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls", "tower_http"];

/// Install the global subscriber, writing to stderr.
///
/// See [`build_filter`] for how `level` and `RUST_LOG` combine.
pub fn init(level: &str, prefer_level: bool) -> Result<(), AppError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(level, rust_log.as_deref(), prefer_level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// The effective filter.
///
/// With `prefer_level` (a CLI `-v` was given) `level` wins and `rust_log` is
/// the fallback when `level` does not parse. Otherwise `rust_log` wins and
/// `level` comes from config.
pub fn build_filter(
    level: &str,
    rust_log: Option<&str>,
    prefer_level: bool,
) -> Result<EnvFilter, AppError> {
    let candidates = if prefer_level {
        [Some(level), rust_log]
    } else {
        [rust_log, Some(level)]
    };

    let mut failures = Vec::new();
    for directives in candidates.into_iter().flatten().map(str::trim) {
        if directives.is_empty() {
            continue;
        }
        match EnvFilter::try_new(directives) {
            Ok(filter) => return Ok(quiet_plumbing(filter, directives)),
            Err(e) => failures.push(format!("'{directives}': {e}")),
        }
    }

    if failures.is_empty() {
        return Err(AppError::Logger("no log level given".into()));
    }
    Err(AppError::Logger(format!("invalid log filter {}", failures.join("; "))))
}

/// A bare `debug`/`trace` level keeps [`PLUMBING_CRATES`] at `info`.
fn quiet_plumbing(mut filter: EnvFilter, directives: &str) -> EnvFilter {
    let verbose = parse_level(directives).is_ok_and(|l| l >= LevelFilter::DEBUG);
    if !verbose {
        return filter;
    }
    for name in PLUMBING_CRATES {
        if let Ok(directive) = format!("{name}=info").parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Parse a bare level name (`error` … `trace`, or `off`).
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(filter: &EnvFilter) -> String {
        filter.to_string().to_ascii_lowercase()
    }

    #[test]
    fn valid_levels_parse() {
        for l in &["error", "warn", "info", "debug", "trace"] {
            assert!(parse_level(l).is_ok(), "expected '{l}' to be valid");
        }
    }

    #[test]
    fn invalid_level_errors() {
        assert!(parse_level("verbose").is_err());
        assert!(parse_level("").is_err());
        assert!(parse_level("llm_serve=debug").is_err());
    }

    #[test]
    fn cli_level_beats_rust_log() {
        let filter = build_filter("debug", Some("warn"), true).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn rust_log_beats_config_level() {
        let filter = build_filter("debug", Some("warn"), false).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));

        let filter = build_filter("error", None, false).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::ERROR));
    }

    #[test]
    fn unparsable_first_choice_falls_back() {
        let filter = build_filter("llm_serve=loud", Some("info"), true).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));

        let err = build_filter("llm_serve=loud", Some("x=loud"), true).unwrap_err();
        assert!(err.to_string().contains("invalid log filter"));
        assert!(build_filter("  ", None, false).is_err());
    }

    #[test]
    fn plumbing_quieted_only_for_bare_verbose_levels() {
        let debug = rendered(&build_filter("debug", None, true).unwrap());
        assert!(debug.contains("hyper=info"));
        assert!(debug.contains("reqwest=info"));

        let info = rendered(&build_filter("info", None, true).unwrap());
        assert!(!info.contains("hyper"));

        let explicit = rendered(&build_filter("llm_serve=trace", None, true).unwrap());
        assert!(!explicit.contains("hyper"));
    }

    #[test]
    fn init_info_succeeds_or_already_init() {
        // Another test in this process may have installed the subscriber first.
        match init("info", true) {
            Ok(()) => {}
            Err(AppError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
