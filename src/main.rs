//! loadstage: staged virtual-user load generator with threshold-based pass/fail.
//!
//! Exit status: 0 when every threshold passed, 99 on a threshold breach,
//! 1 on any fatal error.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

/// Staged virtual-user load generator for HTTP services
#[derive(Parser)]
#[command(name = "loadstage")]
#[command(about = "Ramp virtual users against an HTTP service and judge the results", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose diagnostics on stderr (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> ExitCode {
    // .env must be loaded before parsing so `TARGET_URL` can come from it
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.execute() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Diagnostics go to stderr so stdout carries only the summary.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("loadstage=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
