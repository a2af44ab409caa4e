//! Rolling-window breaking point detector.
//!
//! [`BreakingPointDetector`] is fed a [`LiveSnapshot`] on every progress tick
//! and flags the first moment the target service starts degrading under load.
//! Detection fires once per run and never stops the test; the event ends up in
//! the run summary.
//!
//! The window is split in half and the newer half is compared against the
//! older half, so the detector calibrates itself to each service's normal
//! latency instead of relying on absolute limits.
//!
//! # Detection Conditions
//!
//! 1. **Error rate spike**: recent error rate > 10% AND > 2x baseline
//! 2. **Latency degradation**: recent P99 > 3x baseline P99
//!
//! Both signals are per tick: error rates come from counter deltas and P99
//! from the requests completed since the previous tick (see
//! [`MetricRegistry::window_snapshot`]), so a late degradation is not diluted
//! by everything recorded before it. Ticks without completed requests carry
//! no latency sample.
//!
//! [`MetricRegistry::window_snapshot`]: crate::loadtest::metrics::MetricRegistry::window_snapshot

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::loadtest::metrics::LiveSnapshot;

/// Default rolling window size (number of ticks).
const DEFAULT_WINDOW_SIZE: usize = 10;

/// Minimum error rate threshold before detection triggers.
const ERROR_RATE_ABSOLUTE_THRESHOLD: f64 = 0.10;

/// Error rate must be this multiple of baseline to trigger.
const ERROR_RATE_RELATIVE_MULTIPLIER: f64 = 2.0;

/// P99 latency must be this multiple of baseline to trigger.
const P99_RELATIVE_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone)]
struct WindowSample {
    error_rate: f64,
    p99_ms: Option<f64>,
    active_vus: u32,
}

/// Why a breaking point was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakingReason {
    ErrorRateSpike,
    LatencyDegradation,
}

impl fmt::Display for BreakingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorRateSpike => f.write_str("error_rate_spike"),
            Self::LatencyDegradation => f.write_str("latency_degradation"),
        }
    }
}

/// A detected breaking point event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakingPoint {
    /// Virtual users active when the degradation was detected.
    pub vus: u32,
    pub reason: BreakingReason,
    /// Human-readable explanation.
    pub detail: String,
    /// Run time at which the detection fired.
    #[serde(serialize_with = "serialize_secs")]
    pub detected_after: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Fire-once rolling-window degradation detector.
pub struct BreakingPointDetector {
    window: VecDeque<WindowSample>,
    window_size: usize,
    previous: Option<(u64, u64)>,
    breaking_point: Option<BreakingPoint>,
}

impl BreakingPointDetector {
    /// Creates a detector over `window_size` ticks (at least 2).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(2);
        Self {
            window: VecDeque::with_capacity(window_size + 1),
            window_size,
            previous: None,
            breaking_point: None,
        }
    }

    /// Creates a detector with [`DEFAULT_WINDOW_SIZE`] (10 ticks).
    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }

    /// Observes one progress tick.
    ///
    /// Returns `Some` exactly once, on the first tick that satisfies a
    /// detection condition with a full window.
    pub fn observe(
        &mut self,
        snapshot: &LiveSnapshot,
        active_vus: u32,
        elapsed: Duration,
    ) -> Option<BreakingPoint> {
        let (prev_total, prev_failed) = self.previous.unwrap_or((0, 0));
        self.previous = Some((snapshot.total_requests, snapshot.failed_requests));
        let delta_total = snapshot.total_requests.saturating_sub(prev_total);
        let delta_failed = snapshot.failed_requests.saturating_sub(prev_failed);
        let error_rate = if delta_total == 0 {
            0.0
        } else {
            delta_failed as f64 / delta_total as f64
        };

        self.window.push_back(WindowSample {
            error_rate,
            p99_ms: snapshot.window_p99_ms,
            active_vus,
        });
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        if self.breaking_point.is_some() || self.window.len() < self.window_size {
            return None;
        }

        let half = self.window_size / 2;
        let baseline_error = mean(self.window.iter().take(half).map(|s| s.error_rate));
        let baseline_p99 = mean(self.window.iter().take(half).filter_map(|s| s.p99_ms));
        let recent_error = mean(self.window.iter().skip(half).map(|s| s.error_rate));
        let recent_p99 = mean(self.window.iter().skip(half).filter_map(|s| s.p99_ms));
        let vus = self.window.back().map_or(0, |s| s.active_vus);

        let event = if recent_error > ERROR_RATE_ABSOLUTE_THRESHOLD
            && recent_error > baseline_error * ERROR_RATE_RELATIVE_MULTIPLIER
        {
            BreakingPoint {
                vus,
                reason: BreakingReason::ErrorRateSpike,
                detail: format!(
                    "Error rate {:.1}% exceeds threshold (>10% and >{}x baseline {:.1}%)",
                    recent_error * 100.0,
                    ERROR_RATE_RELATIVE_MULTIPLIER,
                    baseline_error * 100.0,
                ),
                detected_after: elapsed,
            }
        } else if baseline_p99 > 0.0 && recent_p99 > baseline_p99 * P99_RELATIVE_MULTIPLIER {
            BreakingPoint {
                vus,
                reason: BreakingReason::LatencyDegradation,
                detail: format!(
                    "P99 {recent_p99:.0}ms exceeds {P99_RELATIVE_MULTIPLIER}x baseline {baseline_p99:.0}ms"
                ),
                detected_after: elapsed,
            }
        } else {
            return None;
        };

        tracing::warn!(vus = event.vus, reason = %event.reason, "{}", event.detail);
        self.breaking_point = Some(event.clone());
        Some(event)
    }

    /// Returns the detected breaking point, if any.
    pub fn breaking_point(&self) -> Option<&BreakingPoint> {
        self.breaking_point.as_ref()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u64), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
