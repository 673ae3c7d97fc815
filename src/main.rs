//! CSOPESY emulator CLI entry point.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use csopesy::shell::Shell;

/// CSOPESY emulator - a multi-core scheduler and demand-paging playground
#[derive(Parser)]
#[command(name = "csopesy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file loaded by the `initialize` command
    #[arg(long, default_value = "config.txt")]
    config: PathBuf,

    /// RNG seed for reproducible process generation
    #[arg(long)]
    seed: Option<u64>,
}

fn main() {
    let cli = Cli::parse();

    // Keep the interactive prompt quiet unless RUST_LOG asks for more.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut shell = Shell::new(cli.config, cli.seed);
    std::process::exit(shell.run());
}
