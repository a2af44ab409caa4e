//! `loadstage` CLI subcommands.
//!
//! Provides `run` (execute a load test) and `init` (generate starter config).

mod init;
mod run;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

use loadstage::loadtest::config::HumanDuration;

/// Exit status for a completed run with at least one failed threshold.
pub const THRESHOLD_BREACH_EXIT: u8 = 99;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test against an HTTP service
    ///
    /// Executes the stages and scenarios defined in .loadstage/loadtest.toml
    /// (or a custom config path). Reports results to the terminal and writes
    /// a JSON report to .loadstage/reports/.
    Run {
        /// Path to config file (default: auto-discover .loadstage/loadtest.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target base URL
        #[arg(long, env = "TARGET_URL")]
        url: Option<String>,

        /// Number of virtual users (overrides config, flat mode only)
        #[arg(long)]
        vus: Option<u32>,

        /// Test duration, e.g. `30s` or `2m` (overrides config, flat mode only)
        #[arg(long)]
        duration: Option<HumanDuration>,

        /// Iteration limit (overrides config)
        #[arg(long)]
        iterations: Option<u64>,

        /// Disable JSON report output
        #[arg(long)]
        no_report: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Generate a starter loadtest config file
    ///
    /// Creates .loadstage/loadtest.toml with a staged ramp-up, three weighted
    /// scenarios and example thresholds.
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    /// Execute the selected subcommand.
    pub fn execute(self) -> Result<ExitCode> {
        match self {
            Command::Run {
                config,
                url,
                vus,
                duration,
                iterations,
                no_report,
                no_color,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(run::RunOptions {
                    config_path: config,
                    url,
                    vus,
                    duration: duration.map(HumanDuration::as_duration),
                    iterations,
                    no_report,
                    no_color,
                }))
            },
            Command::Init { force } => {
                init::execute_init(&std::env::current_dir()?, force)?;
                Ok(ExitCode::SUCCESS)
            },
        }
    }
}
