//! yodi — entry point.
//!
//! Parses the connection flags, sets up `tracing` on stderr (redirected
//! to the log file once the supervisor has booted), and hands off to the
//! supervisor. There are no subcommands: a bare invocation *is* the
//! supervised agent process.

use clap::Parser;
use yodi::cli::Cli;
use yodi::config::Config;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_cli(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = yodi::supervisor::run(config) {
        tracing::error!(error = %e, "supervisor exited with an error");
        std::process::exit(1);
    }
}
