//! Managed inference runtimes: child processes that serve a model over HTTP.
//!
//! The local engines and the RAG models all follow the same lifecycle:
//! spawn the runtime binary with arguments built from config, forward its
//! output into the log, poll its health endpoint until it answers, and stop
//! it on shutdown. [`ManagedServer`] owns that lifecycle; callers only build
//! a [`LaunchSpec`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} exited during startup ({status})")]
    ExitedEarly { name: String, status: String },
    #[error("{name} did not become healthy within {secs}s")]
    StartupTimeout { name: String, secs: u64 },
    #[error("no free local port: {0}")]
    Port(std::io::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Resolve `program` on `PATH` (or as a literal path).
///
/// `None` means the runtime is not installed on this host.
pub fn find_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// `true` if `python -c "import <module>"` succeeds.
pub async fn python_has_module(python: &Path, module: &str) -> bool {
    let status = Command::new(python)
        .args(["-c", &format!("import {module}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) => s.success(),
        Err(e) => {
            debug!(python = %python.display(), error = %e, "python probe failed to run");
            false
        }
    }
}

/// Pick a free local TCP port for a child runtime.
pub fn pick_port() -> Result<u16, RuntimeError> {
    if let Some(port) = portpicker::pick_unused_port() {
        return Ok(port);
    }
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(RuntimeError::Port)?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(RuntimeError::Port)
}

// ── LaunchSpec ────────────────────────────────────────────────────────────────

/// Everything needed to start one runtime process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Log tag, e.g. `"vllm"` or `"embedding"`.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Address the runtime was told to listen on.
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl LaunchSpec {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ── ManagedServer ─────────────────────────────────────────────────────────────

/// A running child runtime. Dropping it kills the process.
#[derive(Debug)]
pub struct ManagedServer {
    name: String,
    base_url: String,
    shutdown_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ManagedServer {
    /// Spawn the runtime and wait until its health endpoint answers.
    pub async fn launch(spec: LaunchSpec) -> Result<Self, RuntimeError> {
        info!(
            runtime = %spec.name,
            program = %spec.program.display(),
            port = spec.port,
            "launching runtime"
        );
        debug!(runtime = %spec.name, args = ?spec.args, "runtime arguments");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn { name: spec.name.clone(), source })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.name.clone(), stderr);
        }

        let base_url = spec.base_url();
        if let Err(e) = wait_for_health(&mut child, &spec, &base_url).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        info!(runtime = %spec.name, %base_url, "runtime ready");
        Ok(Self {
            name: spec.name,
            base_url,
            shutdown_grace: spec.shutdown_grace,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `http://host:port` of the running runtime.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop the runtime: SIGTERM, wait up to the grace period, then kill.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        terminate(&child);
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(runtime = %self.name, %status, "runtime stopped"),
            Ok(Err(e)) => warn!(runtime = %self.name, error = %e, "failed to reap runtime"),
            Err(_) => {
                warn!(runtime = %self.name, "runtime ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

async fn wait_for_health(
    child: &mut Child,
    spec: &LaunchSpec,
    base_url: &str,
) -> Result<(), RuntimeError> {
    let client = reqwest::Client::builder()
        .timeout(HEALTH_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| RuntimeError::Client(e.to_string()))?;
    let url = format!("{base_url}{}", spec.health_path);
    let started = Instant::now();

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(RuntimeError::ExitedEarly {
                name: spec.name.clone(),
                status: status.to_string(),
            });
        }

        if started.elapsed() > spec.startup_timeout {
            return Err(RuntimeError::StartupTimeout {
                name: spec.name.clone(),
                secs: spec.startup_timeout.as_secs(),
            });
        }

        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => debug!(runtime = %spec.name, status = %resp.status(), "runtime not ready"),
            Err(e) => debug!(runtime = %spec.name, error = %e, "runtime not reachable yet"),
        }

        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

/// Forward each line the runtime prints into the log.
fn forward_output<R>(name: String, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(runtime = %name, "{line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            name: "test".into(),
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            envs: Vec::new(),
            host: "127.0.0.1".into(),
            port: pick_port().unwrap(),
            health_path: "/health".into(),
            startup_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    #[test]
    fn missing_program_is_none() {
        assert!(find_program("definitely-not-an-inference-runtime-4f2a").is_none());
    }

    #[test]
    fn pick_port_returns_nonzero() {
        assert_ne!(pick_port().unwrap(), 0);
    }

    #[test]
    fn base_url_uses_host_and_port() {
        let mut s = spec("/bin/true", &[]);
        s.port = 9123;
        assert_eq!(s.base_url(), "http://127.0.0.1:9123");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = ManagedServer::launch(spec("/nonexistent/runtime-bin", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_reported() {
        let err = ManagedServer::launch(spec("/bin/sh", &["-c", "exit 3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ExitedEarly { .. }), "got {err}");
    }

    #[tokio::test]
    async fn missing_python_has_no_module() {
        assert!(!python_has_module(Path::new("/nonexistent/python"), "vllm").await);
    }
}
