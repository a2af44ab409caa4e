//! k6-style live terminal display for load test progress.
//!
//! Renders a compact, in-place updating line showing live/target VU count,
//! requests per second, P95 latency, error count/rate, iterations and elapsed
//! time. Updates from a watch channel every progress tick, not per-request.
//!
//! Multi-stage schedules get a `[stage N/M]` prefix.

use crate::loadtest::engine::DisplayState;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// P95 above this many milliseconds is highlighted.
const SLOW_P95_MS: f64 = 1000.0;

/// Live progress spinner on stderr.
pub struct LiveDisplay {
    _multi: MultiProgress,
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display.
    ///
    /// If `no_color` is true or stderr is not a terminal (piped),
    /// color output is disabled.
    pub fn new(no_color: bool) -> Self {
        if no_color || !std::io::stderr().is_terminal() {
            colored::control::set_override(false);
        }

        let multi = MultiProgress::new();
        let status_bar = multi.add(ProgressBar::new_spinner());
        let style = ProgressStyle::with_template("{spinner:.cyan} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        status_bar.set_style(style);
        status_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            _multi: multi,
            status_bar,
        }
    }

    /// Format a single line of live status.
    ///
    /// Color coding:
    /// - Green for healthy metrics
    /// - Red for errors (when failed requests > 0)
    /// - Yellow for high P95 latency (> 1000ms)
    pub fn format_status(state: &DisplayState) -> String {
        let snap = &state.snapshot;
        let elapsed_secs = state.elapsed.as_secs_f64();
        let rps = if elapsed_secs > 0.0 {
            snap.total_requests as f64 / elapsed_secs
        } else {
            0.0
        };

        let vu_str = format!("{}/{}", state.live_vus, state.target_vus);
        let rps_str = format!("{:.1}", rps);
        let p95_str = format!("{:.0}ms", snap.p95_ms);
        let error_count_str = snap.failed_requests.to_string();
        let error_rate_str = format!("{:.1}%", snap.error_rate * 100.0);

        let p95_display = if snap.p95_ms > SLOW_P95_MS {
            p95_str.yellow().to_string()
        } else {
            p95_str.green().to_string()
        };
        let error_display = if snap.failed_requests > 0 {
            format!("{} ({})", error_count_str.red(), error_rate_str.red())
        } else {
            format!("{} ({})", error_count_str, error_rate_str)
        };

        let metrics_line = format!(
            "vus: {}  |  rps: {}  |  p95: {}  |  errors: {}  |  iters: {}  |  elapsed: {}s",
            vu_str.green(),
            rps_str.green(),
            p95_display,
            error_display,
            snap.iterations,
            state.elapsed.as_secs()
        );

        match &state.stage_label {
            Some(label) => format!("  [{}]  {}", label, metrics_line),
            None => format!("  {}", metrics_line),
        }
    }

    pub fn update(&self, state: &DisplayState) {
        self.status_bar.set_message(Self::format_status(state));
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

/// Run the live display loop.
///
/// Redraws on every [`DisplayState`] published to the watch channel. Stops when
/// the [`CancellationToken`] is cancelled or the sender is dropped. A detected
/// breaking point is printed once as a warning line.
pub async fn display_loop(
    mut display_rx: watch::Receiver<DisplayState>,
    cancel: CancellationToken,
    no_color: bool,
) {
    let display = LiveDisplay::new(no_color);
    let mut bp_shown = false;

    eprintln!();
    eprintln!("  Running load test...");
    eprintln!();

    loop {
        tokio::select! {
            result = display_rx.changed() => {
                if result.is_err() {
                    break;
                }
                let state = display_rx.borrow_and_update().clone();
                display.update(&state);
                if !bp_shown {
                    if let Some(ref warning) = state.breaking_point {
                        display.status_bar.suspend(|| {
                            eprintln!("  {} {}", "WARNING:".yellow().bold(), warning);
                        });
                        bp_shown = true;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let state = display_rx.borrow().clone();
                display.update(&state);
                break;
            }
        }
    }

    display.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::LiveSnapshot;

    fn state(snapshot: LiveSnapshot, elapsed_secs: u64) -> DisplayState {
        DisplayState {
            snapshot,
            elapsed: Duration::from_secs(elapsed_secs),
            live_vus: 5,
            target_vus: 10,
            stage_label: None,
            breaking_point: None,
        }
    }

    #[test]
    fn test_format_status_zero_state() {
        let status = LiveDisplay::format_status(&DisplayState {
            target_vus: 10,
            ..DisplayState::default()
        });

        assert!(status.contains("0/10"), "Should contain VU count 0/10, got: {status}");
        assert!(status.contains("0.0"), "Should contain rps 0.0, got: {status}");
        assert!(status.contains("errors:"), "Should contain errors label, got: {status}");
    }

    #[test]
    fn test_format_status_with_errors() {
        let snap = LiveSnapshot {
            total_requests: 60,
            failed_requests: 6,
            error_rate: 0.1,
            p95_ms: 42.0,
            p99_ms: 80.0,
            window_p99_ms: None,
            iterations: 58,
        };
        let status = LiveDisplay::format_status(&state(snap, 30));

        assert!(status.contains("rps:"), "Should contain rps label, got: {status}");
        assert!(status.contains("2.0"), "Should contain 60/30s = 2.0 rps, got: {status}");
        assert!(status.contains("42ms"), "Should contain p95=42ms, got: {status}");
        assert!(status.contains("10.0%"), "Should contain error rate, got: {status}");
        assert!(status.contains("iters: 58"), "Should contain iterations, got: {status}");
    }

    #[test]
    fn test_format_status_high_p95() {
        let snap = LiveSnapshot {
            p95_ms: 1500.0,
            ..LiveSnapshot::default()
        };
        let status = LiveDisplay::format_status(&state(snap, 10));
        assert!(status.contains("1500ms"), "Should contain 1500ms, got: {status}");
    }

    #[test]
    fn test_format_status_stage_label() {
        let mut with_stage = state(LiveSnapshot::default(), 10);
        with_stage.stage_label = Some("stage 2/3".to_string());
        let status = LiveDisplay::format_status(&with_stage);
        assert!(status.contains("[stage 2/3]"), "Should contain stage label, got: {status}");
        assert!(status.contains("vus:"), "Should still contain vus label, got: {status}");

        let status = LiveDisplay::format_status(&state(LiveSnapshot::default(), 10));
        assert!(!status.contains('['), "No brackets without stage label, got: {status}");
    }

    #[test]
    fn test_live_display_new_does_not_panic() {
        let display = LiveDisplay::new(true);
        display.finish();
    }
}
