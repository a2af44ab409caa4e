//! Reporters for completed load test runs.
//!
//! A [`Reporter`] consumes the immutable [`RunSummary`] produced by the engine.
//! Two implementations ship with the crate:
//! - [`TerminalReporter`] prints the k6-style summary from [`render_summary`]
//! - [`JsonReporter`] writes a schema-versioned JSON report file containing
//!   every final metric, threshold verdicts, the breaking point and the full
//!   resolved config for reproducibility. Designed for CI/CD consumption.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::loadtest::breaking::BreakingPoint;
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::engine::{RunSummary, StopReason};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::MetricValues;
use crate::loadtest::schedule::Schedule;
use crate::loadtest::summary::render_summary;
use crate::loadtest::threshold::ThresholdReport;

/// Schema version for the JSON report format.
///
/// Increment when making breaking changes to the report structure.
/// External tools key on this field to determine parser compatibility.
pub const SCHEMA_VERSION: &str = "1.0";

/// Directory, relative to the project root, that JSON reports are written to.
pub const REPORTS_DIR: &str = ".loadstage/reports";

/// What was run, for reporters that describe the test alongside its results.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub target_url: &'a str,
    pub config: &'a LoadTestConfig,
    pub schedule: &'a Schedule,
}

/// Renders a finished run somewhere.
pub trait Reporter {
    fn report(&self, summary: &RunSummary, ctx: &ReportContext<'_>) -> Result<(), LoadTestError>;
}

/// Prints the k6-style summary to stdout.
#[derive(Debug, Default)]
pub struct TerminalReporter;

impl Reporter for TerminalReporter {
    fn report(&self, summary: &RunSummary, ctx: &ReportContext<'_>) -> Result<(), LoadTestError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", render_summary(summary, ctx))
            .map_err(|e| LoadTestError::report(format!("failed to write summary: {e}")))
    }
}

/// Writes `loadtest-<timestamp>.json` under `<base_dir>/.loadstage/reports/`.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    base_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path the report for `summary` will be written to.
    pub fn report_path(&self, summary: &RunSummary) -> PathBuf {
        self.base_dir
            .join(REPORTS_DIR)
            .join(report_filename(&summary.started_at))
    }

    /// Writes the report and returns its path.
    pub fn write(
        &self,
        summary: &RunSummary,
        ctx: &ReportContext<'_>,
    ) -> Result<PathBuf, LoadTestError> {
        let report = LoadTestReport::from_summary(summary, ctx);
        write_report(&report, &self.report_path(summary))
    }
}

impl Reporter for JsonReporter {
    fn report(&self, summary: &RunSummary, ctx: &ReportContext<'_>) -> Result<(), LoadTestError> {
        let path = self.write(summary, ctx)?;
        tracing::info!(path = %path.display(), "report written");
        Ok(())
    }
}

/// Top-level JSON report structure.
///
/// Self-contained: anyone reading just the JSON file should understand the
/// test configuration and outcomes.
#[derive(Debug, Serialize)]
pub struct LoadTestReport {
    /// Report format version for parser compatibility.
    pub schema_version: String,
    /// RFC 3339 timestamp when the run started.
    pub started_at: String,
    pub target_url: String,
    /// Actual run duration in seconds, drain included.
    pub duration_secs: f64,
    pub stop_reason: StopReason,
    pub graceful: bool,
    pub peak_vus: u32,
    /// Overall verdict: every determined threshold passed.
    pub passed: bool,
    pub thresholds: ThresholdReport,
    pub metrics: BTreeMap<String, MetricValues>,
    pub breaking_point: BreakingPointReport,
    /// Full resolved configuration (with CLI overrides applied).
    pub config: serde_json::Value,
}

/// Breaking point detection result for the JSON report.
///
/// Included in every report. When no breaking point was detected,
/// `detected` is `false` and the event is omitted.
#[derive(Debug, Serialize)]
pub struct BreakingPointReport {
    pub detected: bool,
    #[serde(flatten)]
    pub event: Option<BreakingPoint>,
}

impl LoadTestReport {
    pub fn from_summary(summary: &RunSummary, ctx: &ReportContext<'_>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            started_at: summary
                .started_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            target_url: ctx.target_url.to_string(),
            duration_secs: summary.elapsed.as_secs_f64(),
            stop_reason: summary.stop_reason,
            graceful: summary.graceful,
            peak_vus: summary.peak_vus,
            passed: summary.passed(),
            thresholds: summary.thresholds.clone(),
            metrics: summary.metrics.clone(),
            breaking_point: BreakingPointReport {
                detected: summary.breaking_point.is_some(),
                event: summary.breaking_point.clone(),
            },
            config: serde_json::to_value(ctx.config).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Write a JSON report to `path`, creating parent directories as needed.
pub fn write_report(report: &LoadTestReport, path: &Path) -> Result<PathBuf, LoadTestError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| {
            LoadTestError::report(format!("cannot create {}: {e}", dir.display()))
        })?;
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| LoadTestError::report(format!("cannot serialize report: {e}")))?;
    std::fs::write(path, json)
        .map_err(|e| LoadTestError::report(format!("cannot write {}: {e}", path.display())))?;
    Ok(path.to_path_buf())
}

/// Generate the report filename for a given timestamp.
///
/// Uses hyphens instead of colons for cross-platform filename compatibility.
/// Millisecond resolution keeps runs started within the same second apart.
pub fn report_filename(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    format!("loadtest-{}.json", timestamp.format("%Y-%m-%dT%H-%M-%S-%3f"))
}
