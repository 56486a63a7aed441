//! `wonder_status`: print counters for a rendezvous directory.
//!
//! Exits 0 unless the directory exists but cannot be read.

use clap::Parser;

use della_wonders::cli::WonderStatusCli;
use della_wonders::status::gather;

fn main() {
    let cli = WonderStatusCli::parse();

    match gather(&cli.shared_dir) {
        Ok(report) => print!("{report}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
