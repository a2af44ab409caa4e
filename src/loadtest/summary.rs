//! k6-style terminal summary renderer for load test results.
//!
//! Produces a colorized, human-readable summary with:
//! - ASCII art header with the run configuration
//! - Threshold verdicts with ✓/✗ marks and the value each was judged against
//! - Dotted-line metric rows (metric.........: value), one per registered metric
//! - Breaking point warning and stop reason
//!
//! [`render_summary`] is a pure function: structured data in, [`String`] out.
//! Color coding is applied via the `colored` crate, which respects the global
//! override set by `colored::control::set_override(false)` when `--no-color`
//! is active or stdout is piped.

use colored::Colorize;

use crate::loadtest::config::HumanDuration;
use crate::loadtest::engine::{RunSummary, StopReason};
use crate::loadtest::metrics::{MetricValues, TrendValues};
use crate::loadtest::report::ReportContext;
use crate::loadtest::threshold::{Outcome, ThresholdResult};

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 40;

/// Render a k6-style terminal summary.
///
/// # Layout
///
/// ```text
///           /\      |  loadstage
///          /  \     |
///     /\  /    \    |  target:    http://localhost:3000
///    /  \/      \   |  vus:       max 10 over 3 stages
///   /    \       \  |  duration:  1m 30s
///  /      \       \ |  scenarios: 3
///
///   thresholds:
///     ✓ http_req_duration: p(95)<500 (actual 182.00)
///     ✗ http_req_failed: rate<0.01 (actual 0.03)
///
/// ✓ checks..................................: 97.00%  ✓ 970  ✗ 30
///   http_req_duration.......................: avg=95.2ms  min=12ms  med=88ms ...
/// ✗ http_req_failed.........................: 3.00%  ✓ 30  ✗ 970
///   http_reqs...............................: 1000  11.1/s
/// ```
pub fn render_summary(summary: &RunSummary, ctx: &ReportContext<'_>) -> String {
    let mut lines = Vec::new();

    lines.push(render_header(ctx));

    if !summary.thresholds.results.is_empty() {
        lines.push("  thresholds:".to_string());
        for result in &summary.thresholds.results {
            lines.push(format!("    {}", render_threshold(result)));
        }
        lines.push(String::new());
    }

    for (name, values) in &summary.metrics {
        let mark = metric_mark(&summary.thresholds.results, name);
        let row = format_metric_row(name, &format_values(values), PAD_WIDTH);
        // The mark takes the first indentation column.
        lines.push(format!("{mark}{}", &row[1..]));
    }

    lines.push(String::new());
    lines.push(format_metric_row(
        "vus_max",
        &summary.peak_vus.to_string(),
        PAD_WIDTH,
    ));
    lines.push(format_metric_row(
        "elapsed",
        &format!("{:.1}s", summary.elapsed.as_secs_f64()),
        PAD_WIDTH,
    ));

    if let Some(bp) = &summary.breaking_point {
        lines.push(String::new());
        lines.push(format!(
            "  {} breaking point at {} VUs after {:.0}s ({}: {})",
            "WARNING:".yellow().bold(),
            bp.vus,
            bp.detected_after.as_secs_f64(),
            bp.reason,
            bp.detail,
        ));
    }

    match summary.stop_reason {
        StopReason::ScheduleComplete => {}
        StopReason::IterationLimit => {
            lines.push(String::new());
            lines.push("  stopped: iteration limit reached".to_string());
        }
        StopReason::Interrupted => {
            lines.push(String::new());
            lines.push("  stopped: interrupted".yellow().to_string());
        }
    }
    if !summary.graceful {
        lines.push(
            "  graceful stop expired; in-flight iterations were not recorded"
                .yellow()
                .to_string(),
        );
    }

    lines.push(String::new());
    let verdict = if summary.passed() {
        "  all thresholds passed".green().bold().to_string()
    } else {
        format!(
            "  {} of {} thresholds failed",
            summary.thresholds.failed(),
            summary.thresholds.results.len()
        )
        .red()
        .bold()
        .to_string()
    };
    lines.push(verdict);

    lines.join("\n")
}

/// Render the ASCII art header with run configuration details.
fn render_header(ctx: &ReportContext<'_>) -> String {
    let stages = ctx.schedule.stages().len();
    let vus = if stages > 1 {
        format!("max {} over {} stages", ctx.schedule.max_target(), stages)
    } else {
        ctx.schedule.max_target().to_string()
    };
    let duration = HumanDuration(ctx.schedule.total_duration()).to_string();
    let duration = match ctx.config.settings.iterations {
        Some(n) => format!("{duration} (or {n} iterations)"),
        None => duration,
    };
    format!(
        r#"
          /\      |  {}
         /  \     |
    /\  /    \    |  target:    {}
   /  \/      \   |  vus:       {}
  /    \       \  |  duration:  {}
 /      \       \ |  scenarios: {}
"#,
        "loadstage".bold(),
        ctx.target_url,
        vus,
        duration,
        ctx.config.scenario.len(),
    )
}

fn render_threshold(result: &ThresholdResult) -> String {
    let actual = result
        .actual
        .map_or_else(|| "no data".to_string(), |v| format!("actual {v:.2}"));
    let line = format!("{}: {} ({})", result.metric, result.expression, actual);
    match result.outcome {
        Outcome::Pass => format!("{} {}", "✓".green(), line),
        Outcome::Fail => format!("{} {}", "✗".red(), line.red()),
        Outcome::Undetermined => format!("{} {}", "?".yellow(), line),
    }
}

/// Threshold mark for a metric row: ✗ if any threshold failed, ✓ if any passed.
fn metric_mark(results: &[ThresholdResult], metric: &str) -> String {
    let mut outcomes = results
        .iter()
        .filter(|r| r.metric == metric)
        .map(|r| r.outcome)
        .peekable();
    if outcomes.peek().is_none() {
        return " ".to_string();
    }
    let outcomes: Vec<Outcome> = outcomes.collect();
    if outcomes.contains(&Outcome::Fail) {
        "✗".red().to_string()
    } else if outcomes.contains(&Outcome::Pass) {
        "✓".green().to_string()
    } else {
        "?".yellow().to_string()
    }
}

fn format_values(values: &MetricValues) -> String {
    match values {
        MetricValues::Counter { count, rate } => format!("{count}  {rate:.1}/s"),
        MetricValues::Rate {
            passes,
            fails,
            rate,
        } => format!(
            "{:.2}%  {} {}  {} {}",
            rate * 100.0,
            "✓".green(),
            passes,
            "✗".red(),
            fails
        ),
        MetricValues::Trend(trend) => format_trend(trend),
    }
}

fn format_trend(trend: &TrendValues) -> String {
    let mut parts = vec![
        format!("avg={}", format_ms(trend.avg)),
        format!("min={}", format_ms(trend.min)),
        format!("med={}", format_ms(trend.med)),
        format!("max={}", format_ms(trend.max)),
    ];
    parts.extend(
        trend
            .percentiles
            .iter()
            .map(|(key, value)| format!("{key}={}", format_ms(*value))),
    );
    parts.join("  ")
}

/// Formats a millisecond value the way k6 does: `850µs`, `95.2ms`, `1.25s`.
fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else if ms > 0.0 && ms < 1.0 {
        format!("{:.0}µs", ms * 1000.0)
    } else {
        let s = format!("{ms:.2}");
        let s = s.trim_end_matches('0').trim_end_matches('.');
        format!("{s}ms")
    }
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}
