//! `loadstage run` command implementation.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use loadstage::loadtest::config::{HumanDuration, LoadTestConfig};
use loadstage::loadtest::engine::LoadTestEngine;
use loadstage::loadtest::report::{JsonReporter, ReportContext, Reporter, TerminalReporter};

use super::THRESHOLD_BREACH_EXIT;

/// Resolved `run` flags.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub url: Option<String>,
    pub vus: Option<u32>,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    pub no_report: bool,
    pub no_color: bool,
}

/// Execute the `run` command.
///
/// Loads config (via explicit path or auto-discovery), applies CLI overrides,
/// runs the engine, prints the summary and writes the JSON report. The exit
/// code reflects the threshold verdict.
pub async fn execute_run(opts: RunOptions) -> Result<ExitCode> {
    let url = opts.url.clone().context(
        "No target URL.\nPass `--url http://host:port` or set TARGET_URL (a .env file works too).",
    )?;

    let config_file = match &opts.config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `loadstage init` to create one.",
                    path.display()
                );
            }
            path.clone()
        },
        None => {
            let cwd = std::env::current_dir()?;
            discover_config(&cwd).context(
                "No loadtest config found.\n\
                 Run `loadstage init` to create .loadstage/loadtest.toml,\n\
                 or use `--config path/to/file.toml` to specify one.",
            )?
        },
    };

    eprintln!("Loading config from: {}", config_file.display());
    let mut config = LoadTestConfig::load(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;

    apply_overrides(&mut config, &opts);

    if opts.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let engine = LoadTestEngine::from_config(&config, &url)
        .context("Invalid load test configuration")?
        .with_live_display(true)
        .with_no_color(opts.no_color)
        .with_ctrl_c(true);
    let schedule = engine.schedule().clone();

    let summary = engine.run().await;

    let ctx = ReportContext {
        target_url: &url,
        config: &config,
        schedule: &schedule,
    };
    TerminalReporter.report(&summary, &ctx)?;

    if !opts.no_report {
        let reporter = JsonReporter::new(std::env::current_dir()?);
        match reporter.write(&summary, &ctx) {
            Ok(path) => {
                eprintln!();
                eprintln!("Report written to: {}", path.display());
            },
            Err(e) => {
                // Non-fatal: the run itself completed
                eprintln!();
                eprintln!("Warning: {e}");
            },
        }
    }

    if summary.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(THRESHOLD_BREACH_EXIT))
    }
}

/// Apply CLI flag overrides to a loaded config.
///
/// When stages are present, `--vus` and `--duration` are ignored (stages
/// define both) and a warning is printed.
fn apply_overrides(config: &mut LoadTestConfig, opts: &RunOptions) {
    if config.has_stages() {
        if let Some(v) = opts.vus {
            eprintln!(
                "Warning: --vus={v} ignored because config contains [[stage]] blocks (stages define VU targets)"
            );
        }
        if let Some(d) = opts.duration {
            eprintln!(
                "Warning: --duration={} ignored because config contains [[stage]] blocks",
                HumanDuration(d)
            );
        }
    } else {
        if let Some(v) = opts.vus {
            config.settings.vus = Some(v);
        }
        if let Some(d) = opts.duration {
            config.settings.duration = Some(HumanDuration(d));
        }
    }
    if let Some(n) = opts.iterations {
        config.settings.iterations = Some(n);
    }
}

/// Discover `.loadstage/loadtest.toml` by walking parent directories.
///
/// Starts from `start` and walks up until either the file is found or the
/// filesystem root is reached, like `.git` discovery.
fn discover_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".loadstage").join("loadtest.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
