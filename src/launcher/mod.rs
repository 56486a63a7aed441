//! The launcher shim: run a program with its HTTP(S) traffic detoured
//! through the store-and-forward proxy.
//!
//! `wonder_run` owns the whole lifecycle: it prepares the rendezvous
//! directory, obtains the interception CA, binds and starts the proxy,
//! spawns the user's program with the proxy and trust-store environment
//! set, forwards termination signals, and propagates the child's exit code
//! after shutting the proxy down.
//!
//! The child never learns the transport is a directory: it sees an ordinary
//! loopback HTTP proxy plus a CA bundle its TLS stack already trusts.

mod error;

pub use error::LaunchError;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::envelope::DEFAULT_MAX_RESPONSE_SIZE;
use crate::proxy::{ProxyCa, ProxyConfig, ProxyServer};
use crate::store::RendezvousStore;

/// Exit code when the proxy cannot be started.
pub const EXIT_PROXY_FAILURE: i32 = 2;

/// Exit code when the requested program does not exist.
pub const EXIT_PROGRAM_MISSING: i32 = 127;

/// How long the child gets between SIGTERM and SIGKILL.
const CHILD_TERM_GRACE: Duration = Duration::from_secs(5);

/// Configuration for one launch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Rendezvous root shared with the forwarder.
    pub shared_dir: PathBuf,
    /// Loopback port for the proxy; 0 picks an ephemeral port.
    pub proxy_port: u16,
    /// Stable CA directory; `None` means a fresh ephemeral CA per launch.
    pub ca_dir: Option<PathBuf>,
    /// Per-flow response deadline.
    pub response_timeout: Duration,
    /// Response-size ceiling advertised in request envelopes.
    pub max_response_size: u64,
    /// Program to run, bare name or path.
    pub program: String,
    /// Arguments passed through verbatim.
    pub args: Vec<String>,
}

impl LaunchConfig {
    /// Defaults for a program under a shared directory.
    pub fn new(shared_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            proxy_port: 9025,
            ca_dir: None,
            response_timeout: Duration::from_secs(300),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Run the program through the relay; returns its exit code.
///
/// Startup order matters for the exit-code contract: the rendezvous layout
/// and CA come first, then the proxy binds (bind failure is the proxy-
/// startup error), and only with the proxy up is the program resolved and
/// spawned (missing program is its own error). The proxy is torn down on
/// every path out, child failure included.
pub fn run(config: LaunchConfig) -> Result<i32, LaunchError> {
    let store = Arc::new(RendezvousStore::open(&config.shared_dir)?);

    let ca = match &config.ca_dir {
        Some(dir) => ProxyCa::load_or_generate(dir)?,
        None => ProxyCa::generate()?,
    };
    let ca = Arc::new(ca);
    let ca_bundle_path = ca.create_combined_bundle()?;

    // the envelope's source process is the program as the user named it;
    // resolution happens after the proxy is up
    let source_process = Path::new(&config.program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.program.clone());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(LaunchError::Runtime)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_config = ProxyConfig {
        listen_addr: format!("127.0.0.1:{}", config.proxy_port)
            .parse()
            .expect("loopback address is always valid"),
        ca: ca.clone(),
        store: store.clone(),
        response_timeout: config.response_timeout,
        max_response_size: config.max_response_size,
        source_process,
    };
    let server = rt
        .block_on(ProxyServer::bind(proxy_config, shutdown_rx))
        .map_err(LaunchError::ProxyStartup)?;
    let proxy_addr = server.local_addr();

    let proxy_handle = rt.spawn(async move {
        if let Err(e) = server.run().await {
            error!("proxy server error: {e}");
        }
    });

    let result = run_child(&config, &rt, proxy_addr.port(), &ca_bundle_path);

    // tear the proxy down; in-flight orphan requests are the sweeper's job
    let _ = shutdown_tx.send(true);
    rt.block_on(async {
        let _ = tokio::time::timeout(Duration::from_secs(2), proxy_handle).await;
    });

    result
}

/// Resolve, spawn, and wait on the user's program under a running proxy.
fn run_child(
    config: &LaunchConfig,
    rt: &tokio::runtime::Runtime,
    proxy_port: u16,
    ca_bundle_path: &Path,
) -> Result<i32, LaunchError> {
    let program_path = resolve_program(&config.program)?;
    info!(program = %program_path.display(), proxy_port, "spawning child through the relay");

    // spawn the child with the proxy and trust-store environment
    let mut command = Command::new(&program_path);
    command.args(&config.args);
    for (key, value) in child_env(proxy_port, ca_bundle_path) {
        command.env(key, value);
    }
    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::ProgramNotFound(config.program.clone())
        } else {
            LaunchError::Child(e)
        }
    })?;

    // forward termination signals to the child, escalating after a grace
    let child_pid = child.id() as i32;
    rt.spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("signal received, terminating child");
        terminate_child(child_pid).await;
    });

    let status = child.wait().map_err(LaunchError::Child)?;
    debug!(?status, "child exited");

    Ok(exit_code(status))
}

/// SIGTERM, wait the grace period, SIGKILL whatever is left.
async fn terminate_child(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    let _ = kill(pid, Signal::SIGTERM);
    tokio::time::sleep(CHILD_TERM_GRACE).await;
    // no-op if the child is already gone
    let _ = kill(pid, Signal::SIGKILL);
}

/// Resolve a program name to a path: bare names through `PATH`, anything
/// with a separator as a filesystem path.
pub fn resolve_program(program: &str) -> Result<PathBuf, LaunchError> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if path.exists() {
            Ok(path)
        } else {
            Err(LaunchError::ProgramNotFound(program.to_string()))
        }
    } else {
        which::which(program).map_err(|_| LaunchError::ProgramNotFound(program.to_string()))
    }
}

/// Environment injected into the child: proxy hints in both cases (curl
/// reads the lowercase names) and every common trust-store variable
/// pointing at the combined bundle.
pub fn child_env(proxy_port: u16, ca_bundle: &Path) -> Vec<(String, String)> {
    let proxy_url = format!("http://127.0.0.1:{proxy_port}");
    let bundle = ca_bundle.display().to_string();

    let mut env = Vec::new();
    for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        env.push((key.to_string(), proxy_url.clone()));
    }
    for key in [
        "SSL_CERT_FILE",
        "REQUESTS_CA_BUNDLE",
        "CURL_CA_BUNDLE",
        "NODE_EXTRA_CA_CERTS",
        "GIT_SSL_CAINFO",
    ] {
        env.push((key.to_string(), bundle.clone()));
    }
    env
}

/// Map an exit status to a shell-style code (`128 + signal` when killed).
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program_bare_name() {
        let path = resolve_program("sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_resolve_program_absolute_path() {
        let path = resolve_program("/bin/sh").unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_program_missing() {
        assert!(matches!(
            resolve_program("no-such-program-anywhere"),
            Err(LaunchError::ProgramNotFound(_))
        ));
        assert!(matches!(
            resolve_program("/no/such/path/anywhere"),
            Err(LaunchError::ProgramNotFound(_))
        ));
    }

    #[test]
    fn test_child_env_shape() {
        let env = child_env(9025, Path::new("/tmp/ca/combined-ca-bundle.crt"));
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("HTTP_PROXY"), Some("http://127.0.0.1:9025"));
        assert_eq!(get("https_proxy"), Some("http://127.0.0.1:9025"));
        assert_eq!(
            get("SSL_CERT_FILE"),
            Some("/tmp/ca/combined-ca-bundle.crt")
        );
        assert_eq!(
            get("NODE_EXTRA_CA_CERTS"),
            Some("/tmp/ca/combined-ca-bundle.crt")
        );
    }

    #[test]
    fn test_launch_propagates_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LaunchConfig::new(dir.path(), "sh");
        config.proxy_port = 0; // ephemeral port keeps tests parallel-safe
        config.args = vec!["-c".into(), "exit 7".into()];

        let code = run(config).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_launch_success_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LaunchConfig::new(dir.path(), "true");
        config.proxy_port = 0;

        assert_eq!(run(config).unwrap(), 0);
    }

    #[test]
    fn test_launch_missing_program_fails_after_proxy_is_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LaunchConfig::new(dir.path(), "no-such-program-anywhere");
        config.proxy_port = 0;

        // the proxy binds and is torn down again; the launch still reports
        // the missing program as such
        assert!(matches!(
            run(config),
            Err(LaunchError::ProgramNotFound(_))
        ));
    }
}
