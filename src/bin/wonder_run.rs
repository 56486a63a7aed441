//! `wonder_run`: launch a program with its HTTP(S) traffic relayed through
//! the store-and-forward proxy.
//!
//! Exit code is the child's exit code; proxy startup failure exits 2 and a
//! missing program exits 127.

use clap::Parser;
use std::time::Duration;

use della_wonders::cli::{init_tracing, WonderRunCli};
use della_wonders::launcher::{
    run, LaunchConfig, LaunchError, EXIT_PROGRAM_MISSING, EXIT_PROXY_FAILURE,
};

fn main() {
    let cli = WonderRunCli::parse();
    init_tracing(cli.verbose);

    let config = LaunchConfig {
        shared_dir: cli.shared_dir,
        proxy_port: cli.proxy_port,
        ca_dir: cli.ca_dir,
        response_timeout: Duration::from_secs(cli.timeout),
        max_response_size: della_wonders::envelope::DEFAULT_MAX_RESPONSE_SIZE,
        program: cli.program,
        args: cli.args,
    };

    match run(config) {
        Ok(code) => std::process::exit(code),
        Err(e @ LaunchError::ProgramNotFound(_)) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_PROGRAM_MISSING);
        }
        Err(e @ LaunchError::ProxyStartup(_)) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_PROXY_FAILURE);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
