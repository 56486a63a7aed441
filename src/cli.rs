//! Command-line definitions for the three della-wonders binaries.
//!
//! Uses clap's derive API. The shared directory and proxy port fall back to
//! the `DELLA_SHARED_DIR` and `DELLA_PROXY_PORT` environment variables;
//! explicit flags win over both.

use clap::Parser;
use std::path::PathBuf;

/// Run a program with its HTTP(S) traffic relayed through the
/// store-and-forward proxy.
///
/// The program is spawned with `HTTP_PROXY`/`HTTPS_PROXY` pointing at a
/// local intercepting proxy and with the proxy's CA in its trust-store
/// environment. Every request is serialized into the shared directory and
/// answered when the Internet-side forwarder deposits a response.
#[derive(Parser, Debug)]
#[command(name = "wonder_run")]
#[command(author, version, about)]
pub struct WonderRunCli {
    /// Program to run through the proxy (bare name or path).
    pub program: String,

    /// Arguments passed to the program verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Directory for request/response exchange.
    #[arg(
        long = "shared-dir",
        env = "DELLA_SHARED_DIR",
        default_value = "/tmp/shared"
    )]
    pub shared_dir: PathBuf,

    /// Local proxy port. Port 0 picks an ephemeral port.
    #[arg(long = "proxy-port", env = "DELLA_PROXY_PORT", default_value_t = 9025)]
    pub proxy_port: u16,

    /// Persist the interception CA in this directory across launches.
    ///
    /// Without it a fresh CA is generated per launch and wiped on exit.
    #[arg(long = "ca-dir")]
    pub ca_dir: Option<PathBuf>,

    /// Seconds each request waits for its response before a 504.
    #[arg(long = "timeout", default_value_t = 300)]
    pub timeout: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Run the Internet-side forwarder daemon.
///
/// Watches the shared directory for request envelopes, applies the security
/// filter, executes approved requests against the real network, and
/// publishes response envelopes. Runs until SIGINT/SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "start_wonders")]
#[command(author, version, about)]
pub struct StartWondersCli {
    /// Directory for request/response exchange.
    #[arg(
        long = "shared-dir",
        env = "DELLA_SHARED_DIR",
        default_value = "/tmp/shared"
    )]
    pub shared_dir: PathBuf,

    /// Block a domain and its subdomains (repeatable).
    #[arg(long = "block-domain", value_name = "DOMAIN")]
    pub block_domains: Vec<String>,

    /// Additional content-scan regex (repeatable, audit-only).
    #[arg(long = "block-pattern", value_name = "REGEX")]
    pub block_patterns: Vec<String>,

    /// Concurrent request workers.
    #[arg(long = "workers", default_value_t = 8)]
    pub workers: usize,

    /// Seconds before an unanswered request is swept with a synthetic 504.
    #[arg(long = "stale-after", default_value_t = 600)]
    pub stale_after: u64,

    /// Total seconds allowed per outbound request attempt.
    #[arg(long = "request-timeout", default_value_t = 30)]
    pub request_timeout: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Inspect the rendezvous directory.
#[derive(Parser, Debug)]
#[command(name = "wonder_status")]
#[command(author, version, about)]
pub struct WonderStatusCli {
    /// Directory for request/response exchange.
    #[arg(
        long = "shared-dir",
        env = "DELLA_SHARED_DIR",
        default_value = "/tmp/shared"
    )]
    pub shared_dir: PathBuf,
}

/// Initialize the tracing subscriber on stderr.
///
/// Verbosity: 0 = warn (or `RUST_LOG`), 1 = info, 2 = debug, 3+ = trace.
pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    // ignore a second init (tests call this repeatedly)
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wonder_run_basic() {
        let cli = WonderRunCli::parse_from(["wonder_run", "my_script"]);
        assert_eq!(cli.program, "my_script");
        assert!(cli.args.is_empty());
        assert_eq!(cli.proxy_port, 9025);
        assert_eq!(cli.timeout, 300);
        assert!(cli.ca_dir.is_none());
    }

    #[test]
    fn test_wonder_run_passes_args_through() {
        let cli = WonderRunCli::parse_from([
            "wonder_run",
            "--proxy-port",
            "9100",
            "my_script",
            "--flag",
            "value",
        ]);
        assert_eq!(cli.program, "my_script");
        assert_eq!(cli.args, vec!["--flag", "value"]);
        assert_eq!(cli.proxy_port, 9100);
    }

    #[test]
    fn test_start_wonders_repeatable_blocks() {
        let cli = StartWondersCli::parse_from([
            "start_wonders",
            "--block-domain",
            "evil.test",
            "--block-domain",
            "worse.test",
            "-vv",
        ]);
        assert_eq!(cli.block_domains, vec!["evil.test", "worse.test"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.workers, 8);
        assert_eq!(cli.stale_after, 600);
    }

    #[test]
    fn test_wonder_status_defaults() {
        let cli = WonderStatusCli::parse_from(["wonder_status"]);
        assert_eq!(cli.shared_dir, PathBuf::from("/tmp/shared"));
    }

    #[test]
    fn test_shared_dir_flag_overrides_default() {
        let cli = WonderStatusCli::parse_from([
            "wonder_status",
            "--shared-dir",
            "/srv/relay",
        ]);
        assert_eq!(cli.shared_dir, PathBuf::from("/srv/relay"));
    }
}
