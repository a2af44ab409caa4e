//! Concurrent metric collectors and the per-run registry that owns them.
//!
//! Three collector kinds are supported:
//!
//! - [`Counter`]: monotonically increasing count (`http_reqs`, `iterations`).
//! - [`Rate`]: fraction of `true` observations (`checks`, `http_req_failed`).
//! - [`Trend`]: distribution of durations in milliseconds (`http_req_duration`).
//!
//! # Design
//!
//! - **Written from the worker**: virtual users record directly into the
//!   collectors, there is no aggregator task in between. Counters and rates
//!   are plain atomics; a trend takes a short [`parking_lot::Mutex`] for the
//!   push and never holds it across an await point.
//! - **Commutative**: every collector produces the same final state for any
//!   interleaving of the same observations.
//! - **Exact at finalize, cheap while live**: trends keep the raw samples for
//!   nearest-rank percentiles at the end of the run, plus an HdrHistogram that
//!   the progress display can query every couple of seconds without sorting.
//! - **Owned by the run**: a [`MetricRegistry`] is built per run and shared by
//!   `Arc`; nothing is global, so independent runs can share a process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::loadtest::error::LoadTestError;

/// Total HTTP requests issued (counter).
pub const HTTP_REQS: &str = "http_reqs";
/// Response time reported by the work unit (trend, ms).
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Requests that failed at transport level or returned a status outside 200-399 (rate).
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// One observation per evaluated check (rate).
pub const CHECKS: &str = "checks";
/// Completed virtual user iterations (counter).
pub const ITERATIONS: &str = "iterations";
/// Wall-clock duration of a full iteration including think time (trend, ms).
pub const ITERATION_DURATION: &str = "iteration_duration";

/// Percentiles reported for every trend unless overridden in the config.
pub const DEFAULT_PERCENTILES: [f64; 3] = [90.0, 95.0, 99.0];

/// Kind of a registered metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// Lock-free monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the counter.
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds one to the counter.
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Lock-free rate of `true` observations.
///
/// The two counters are independent relaxed atomics: a read racing with
/// writers may pair a fresh `passes` with a stale `total`. Values are only
/// consistent once writers have quiesced, which is the case at finalize.
#[derive(Debug, Default)]
pub struct Rate {
    passes: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one boolean observation.
    pub fn add(&self, value: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if value {
            self.passes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of `true` observations.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Total number of observations.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of `false` observations.
    pub fn fails(&self) -> u64 {
        self.total().saturating_sub(self.passes())
    }

    /// Fraction of `true` observations. Returns 0.0 when nothing was recorded.
    pub fn value(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.passes() as f64 / total as f64).min(1.0)
    }
}

struct TrendState {
    samples: Vec<f64>,
    sum: f64,
    min: f64,
    max: f64,
    /// Microsecond histogram for live snapshots.
    live: Histogram<u64>,
    /// Same as `live`, but reset every time a window percentile is taken.
    window: Histogram<u64>,
}

fn micros_histogram() -> Histogram<u64> {
    let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
    histogram.auto(true);
    histogram
}

impl TrendState {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            live: micros_histogram(),
            window: micros_histogram(),
        }
    }
}

/// Distribution of numeric observations, in milliseconds.
pub struct Trend {
    state: Mutex<TrendState>,
}

impl fmt::Debug for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trend").field("count", &self.count()).finish()
    }
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

impl Trend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrendState::new()),
        }
    }

    /// Records one observation in milliseconds. Non-finite values are ignored.
    pub fn add(&self, value_ms: f64) {
        if !value_ms.is_finite() {
            return;
        }
        let micros = (value_ms.max(0.0) * 1000.0).round() as u64;
        let mut state = self.state.lock();
        state.samples.push(value_ms);
        state.sum += value_ms;
        state.min = state.min.min(value_ms);
        state.max = state.max.max(value_ms);
        let _ = state.live.record(micros);
        let _ = state.window.record(micros);
    }

    /// Records a [`Duration`] as fractional milliseconds.
    pub fn add_duration(&self, duration: Duration) {
        self.add(duration.as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> u64 {
        self.state.lock().samples.len() as u64
    }

    /// Approximate percentile from the live histogram, in milliseconds.
    ///
    /// Cheap enough to call on every display tick. Returns 0.0 when empty.
    pub fn live_percentile(&self, p: f64) -> f64 {
        let state = self.state.lock();
        if state.live.is_empty() {
            return 0.0;
        }
        state.live.value_at_quantile((p / 100.0).clamp(0.0, 1.0)) as f64 / 1000.0
    }

    /// Approximate percentile of the observations recorded since the previous
    /// call, in milliseconds, then starts a new window. `None` when nothing
    /// was recorded in between.
    pub fn take_window_percentile(&self, p: f64) -> Option<f64> {
        let mut state = self.state.lock();
        if state.window.is_empty() {
            return None;
        }
        let value = state.window.value_at_quantile((p / 100.0).clamp(0.0, 1.0)) as f64 / 1000.0;
        state.window.reset();
        Some(value)
    }

    /// Exact summary over all samples, including the requested percentiles.
    ///
    /// Samples are copied out under the lock and sorted after it is released.
    pub fn values(&self, percentiles: &[f64]) -> TrendValues {
        let (mut sorted, sum, min, max) = {
            let state = self.state.lock();
            (state.samples.clone(), state.sum, state.min, state.max)
        };

        if sorted.is_empty() {
            return TrendValues::empty(percentiles);
        }

        sorted.sort_by(f64::total_cmp);
        let count = sorted.len() as u64;
        let pct = |p: f64| percentile(&sorted, p).unwrap_or(0.0);

        TrendValues {
            count,
            avg: sum / count as f64,
            min,
            med: pct(50.0),
            max,
            percentiles: percentiles
                .iter()
                .map(|p| (percentile_key(*p), pct(*p)))
                .collect(),
        }
    }
}

/// Nearest-rank percentile over ascending `sorted` samples.
///
/// The rank is `ceil(p / 100 * N)` clamped to `[1, N]`; the sample at that
/// rank is returned. `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    // float-to-int casts saturate (NaN -> 0), the clamp handles both ends
    let rank = (((p / 100.0) * n as f64).ceil() as usize).clamp(1, n);
    Some(sorted[rank - 1])
}

/// Key used for a percentile in summaries and thresholds, e.g. `p(95)`.
pub fn percentile_key(p: f64) -> String {
    format!("p({p})")
}

/// Final statistics of a trend, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendValues {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    /// Percentiles keyed by [`percentile_key`].
    pub percentiles: BTreeMap<String, f64>,
}

impl TrendValues {
    fn empty(percentiles: &[f64]) -> Self {
        Self {
            count: 0,
            avg: 0.0,
            min: 0.0,
            med: 0.0,
            max: 0.0,
            percentiles: percentiles.iter().map(|p| (percentile_key(*p), 0.0)).collect(),
        }
    }

    /// Looks up a computed percentile.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles.get(&percentile_key(p)).copied()
    }
}

/// Final value of one metric, as captured in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricValues {
    Counter {
        count: u64,
        /// Per-second rate over the run's wall-clock duration.
        rate: f64,
    },
    Rate {
        passes: u64,
        fails: u64,
        rate: f64,
    },
    Trend(TrendValues),
}

impl MetricValues {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations behind this value.
    pub fn observations(&self) -> u64 {
        match self {
            Self::Counter { count, .. } => *count,
            Self::Rate { passes, fails, .. } => passes + fails,
            Self::Trend(t) => t.count,
        }
    }
}

/// Shared handle to a registered collector.
#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    Rate(Arc<Rate>),
    Trend(Arc<Trend>),
}

impl Metric {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Arc::new(Counter::new())),
            MetricKind::Rate => Self::Rate(Arc::new(Rate::new())),
            MetricKind::Trend => Self::Trend(Arc::new(Trend::new())),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    fn values(&self, elapsed: Duration, percentiles: &[f64]) -> MetricValues {
        match self {
            Self::Counter(c) => {
                let secs = elapsed.as_secs_f64();
                let count = c.count();
                MetricValues::Counter {
                    count,
                    rate: if secs > 0.0 { count as f64 / secs } else { 0.0 },
                }
            }
            Self::Rate(r) => {
                let passes = r.passes();
                let total = r.total();
                MetricValues::Rate {
                    passes,
                    fails: total.saturating_sub(passes),
                    rate: r.value(),
                }
            }
            Self::Trend(t) => MetricValues::Trend(t.values(percentiles)),
        }
    }
}

/// Registry of every metric collected during one run.
///
/// Metrics are registered while the run is being assembled; once the registry
/// is wrapped in an `Arc` and handed to virtual users it is read-only, so
/// lookups never lock.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, Metric>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Creates a registry pre-populated with the built-in metrics.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for (name, kind) in [
            (HTTP_REQS, MetricKind::Counter),
            (HTTP_REQ_DURATION, MetricKind::Trend),
            (HTTP_REQ_FAILED, MetricKind::Rate),
            (CHECKS, MetricKind::Rate),
            (ITERATIONS, MetricKind::Counter),
            (ITERATION_DURATION, MetricKind::Trend),
        ] {
            registry
                .metrics
                .insert(name.to_string(), Metric::new(kind));
        }
        registry
    }

    /// Creates a registry with no metrics at all.
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    /// Registers `name` as `kind`, returning the existing handle if it is
    /// already registered with the same kind.
    ///
    /// Registering an existing name with a different kind is a configuration error.
    pub fn register(&mut self, name: &str, kind: MetricKind) -> Result<Metric, LoadTestError> {
        if let Some(existing) = self.metrics.get(name) {
            if existing.kind() != kind {
                return Err(LoadTestError::validation(format!(
                    "Metric '{name}' is already registered as a {}, cannot register it as a {kind}",
                    existing.kind()
                )));
            }
            return Ok(existing.clone());
        }
        let metric = Metric::new(kind);
        self.metrics.insert(name.to_string(), metric.clone());
        Ok(metric)
    }

    /// Registers (or fetches) a rate metric.
    pub fn register_rate(&mut self, name: &str) -> Result<Arc<Rate>, LoadTestError> {
        match self.register(name, MetricKind::Rate)? {
            Metric::Rate(rate) => Ok(rate),
            _ => unreachable!("register returns the requested kind"),
        }
    }

    /// Registers (or fetches) a trend metric.
    pub fn register_trend(&mut self, name: &str) -> Result<Arc<Trend>, LoadTestError> {
        match self.register(name, MetricKind::Trend)? {
            Metric::Trend(trend) => Ok(trend),
            _ => unreachable!("register returns the requested kind"),
        }
    }

    /// Registers (or fetches) a counter metric.
    pub fn register_counter(&mut self, name: &str) -> Result<Arc<Counter>, LoadTestError> {
        match self.register(name, MetricKind::Counter)? {
            Metric::Counter(counter) => Ok(counter),
            _ => unreachable!("register returns the requested kind"),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.metrics.get(name).map(Metric::kind)
    }

    pub fn counter(&self, name: &str) -> Option<Arc<Counter>> {
        match self.metrics.get(name)? {
            Metric::Counter(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<Arc<Rate>> {
        match self.metrics.get(name)? {
            Metric::Rate(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn trend(&self, name: &str) -> Option<Arc<Trend>> {
        match self.metrics.get(name)? {
            Metric::Trend(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Names of all registered metrics, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Final values of every metric.
    ///
    /// `elapsed` is the run's wall-clock duration (for counter rates) and
    /// `percentiles` lists the percentiles computed for each trend.
    pub fn finalize(&self, elapsed: Duration, percentiles: &[f64]) -> BTreeMap<String, MetricValues> {
        self.metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.values(elapsed, percentiles)))
            .collect()
    }

    /// Cheap point-in-time view of the built-in request metrics.
    pub fn live_snapshot(&self) -> LiveSnapshot {
        let total_requests = self.counter(HTTP_REQS).map_or(0, |c| c.count());
        let (failed_requests, error_rate) = self
            .rate(HTTP_REQ_FAILED)
            .map_or((0, 0.0), |r| (r.passes(), r.value()));
        let (p95, p99) = self.trend(HTTP_REQ_DURATION).map_or((0.0, 0.0), |t| {
            (t.live_percentile(95.0), t.live_percentile(99.0))
        });
        LiveSnapshot {
            total_requests,
            failed_requests,
            error_rate,
            p95_ms: p95,
            p99_ms: p99,
            window_p99_ms: None,
            iterations: self.counter(ITERATIONS).map_or(0, |c| c.count()),
        }
    }

    /// [`Self::live_snapshot`] plus the p99 of requests completed since the
    /// previous windowed snapshot. Only one consumer should take windows.
    pub fn window_snapshot(&self) -> LiveSnapshot {
        let window_p99_ms = self
            .trend(HTTP_REQ_DURATION)
            .and_then(|t| t.take_window_percentile(99.0));
        LiveSnapshot {
            window_p99_ms,
            ..self.live_snapshot()
        }
    }
}

/// Point-in-time view of request metrics used by the live display and
/// breaking point detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Fraction of failed requests (0.0..=1.0).
    pub error_rate: f64,
    pub p95_ms: f64,
    /// p99 over the whole run so far.
    pub p99_ms: f64,
    /// p99 since the previous windowed snapshot, set by
    /// [`MetricRegistry::window_snapshot`].
    pub window_p99_ms: Option<f64>,
    pub iterations: u64,
}

/// Handles to the built-in metrics, resolved once per run.
#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
    pub http_reqs: Arc<Counter>,
    pub http_req_duration: Arc<Trend>,
    pub http_req_failed: Arc<Rate>,
    pub checks: Arc<Rate>,
    pub iterations: Arc<Counter>,
    pub iteration_duration: Arc<Trend>,
}

impl BuiltinMetrics {
    /// Resolves (registering when missing) every built-in metric.
    pub fn resolve(registry: &mut MetricRegistry) -> Result<Self, LoadTestError> {
        Ok(Self {
            http_reqs: registry.register_counter(HTTP_REQS)?,
            http_req_duration: registry.register_trend(HTTP_REQ_DURATION)?,
            http_req_failed: registry.register_rate(HTTP_REQ_FAILED)?,
            checks: registry.register_rate(CHECKS)?,
            iterations: registry.register_counter(ITERATIONS)?,
            iteration_duration: registry.register_trend(ITERATION_DURATION)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_empty_is_zero() {
        let rate = Rate::new();
        assert_eq!(rate.value(), 0.0);
        assert_eq!(rate.total(), 0);
    }

    #[test]
    fn test_rate_value() {
        let rate = Rate::new();
        for i in 0..10 {
            rate.add(i < 3);
        }
        assert_eq!(rate.passes(), 3);
        assert_eq!(rate.fails(), 7);
        assert!((rate.value() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_rate_concurrent_adds_lose_nothing() {
        let rate = Arc::new(Rate::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let rate = rate.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        rate.add((i + t) % 4 == 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rate.total(), 8000);
        assert_eq!(rate.passes(), 2000);
        assert!((rate.value() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.count(), 5);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50.0));
        assert_eq!(percentile(&sorted, 95.0), Some(95.0));
        assert_eq!(percentile(&sorted, 99.0), Some(99.0));
        assert_eq!(percentile(&sorted, 100.0), Some(100.0));
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));

        let small = [10.0, 20.0, 30.0, 40.0];
        // ceil(0.9 * 4) = 4
        assert_eq!(percentile(&small, 90.0), Some(40.0));
        // ceil(0.5 * 4) = 2
        assert_eq!(percentile(&small, 50.0), Some(20.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_percentile_key_format() {
        assert_eq!(percentile_key(95.0), "p(95)");
        assert_eq!(percentile_key(99.9), "p(99.9)");
    }

    #[test]
    fn test_trend_values() {
        let trend = Trend::new();
        for v in [40.0, 10.0, 30.0, 20.0] {
            trend.add(v);
        }
        let values = trend.values(&DEFAULT_PERCENTILES);
        assert_eq!(values.count, 4);
        assert_eq!(values.min, 10.0);
        assert_eq!(values.max, 40.0);
        assert!((values.avg - 25.0).abs() < 1e-9);
        assert_eq!(values.med, 20.0);
        assert_eq!(values.percentile(95.0), Some(40.0));
        assert_eq!(values.percentile(42.0), None);
    }

    #[test]
    fn test_trend_empty_values() {
        let values = Trend::new().values(&[95.0]);
        assert_eq!(values.count, 0);
        assert_eq!(values.percentile(95.0), Some(0.0));
    }

    #[test]
    fn test_trend_ignores_non_finite() {
        let trend = Trend::new();
        trend.add(f64::NAN);
        trend.add(f64::INFINITY);
        trend.add(5.0);
        assert_eq!(trend.count(), 1);
    }

    #[test]
    fn test_trend_add_duration_uses_millis() {
        let trend = Trend::new();
        trend.add_duration(Duration::from_micros(1500));
        let values = trend.values(&[]);
        assert!((values.max - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_trend_live_percentile_close_to_exact() {
        let trend = Trend::new();
        for i in 1..=1000 {
            trend.add(f64::from(i));
        }
        let live = trend.live_percentile(95.0);
        assert!((live - 950.0).abs() < 2.0, "live p95 was {live}");
        assert_eq!(Trend::new().live_percentile(95.0), 0.0);
    }

    #[test]
    fn test_registry_has_builtins() {
        let registry = MetricRegistry::new();
        assert_eq!(registry.kind(HTTP_REQS), Some(MetricKind::Counter));
        assert_eq!(registry.kind(HTTP_REQ_DURATION), Some(MetricKind::Trend));
        assert_eq!(registry.kind(HTTP_REQ_FAILED), Some(MetricKind::Rate));
        assert_eq!(registry.kind(CHECKS), Some(MetricKind::Rate));
        assert_eq!(registry.kind(ITERATIONS), Some(MetricKind::Counter));
        assert_eq!(registry.kind(ITERATION_DURATION), Some(MetricKind::Trend));
    }

    #[test]
    fn test_register_same_kind_returns_same_collector() {
        let mut registry = MetricRegistry::new();
        let a = registry.register_rate("errors").unwrap();
        let b = registry.register_rate("errors").unwrap();
        a.add(true);
        assert_eq!(b.total(), 1);
    }

    #[test]
    fn test_register_conflicting_kind_fails() {
        let mut registry = MetricRegistry::new();
        let err = registry.register_trend(CHECKS).unwrap_err();
        assert!(err.to_string().contains("already registered as a rate"));
    }

    #[test]
    fn test_finalize() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        builtins.http_reqs.add(20);
        builtins.checks.add(true);
        builtins.checks.add(false);
        builtins.http_req_duration.add(100.0);

        let values = registry.finalize(Duration::from_secs(10), &[95.0]);
        assert_eq!(
            values[HTTP_REQS],
            MetricValues::Counter {
                count: 20,
                rate: 2.0
            }
        );
        assert_eq!(
            values[CHECKS],
            MetricValues::Rate {
                passes: 1,
                fails: 1,
                rate: 0.5
            }
        );
        match &values[HTTP_REQ_DURATION] {
            MetricValues::Trend(t) => assert_eq!(t.percentile(95.0), Some(100.0)),
            other => panic!("expected trend, got {other:?}"),
        }
        assert_eq!(values[ITERATIONS].observations(), 0);
    }

    #[test]
    fn test_independent_registries_do_not_share_state() {
        let a = MetricRegistry::new();
        let b = MetricRegistry::new();
        a.counter(HTTP_REQS).unwrap().inc();
        assert_eq!(b.counter(HTTP_REQS).unwrap().count(), 0);
    }

    #[test]
    fn test_live_snapshot() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        for i in 0..10 {
            builtins.http_reqs.inc();
            builtins.http_req_failed.add(i == 0);
            builtins.http_req_duration.add(50.0);
        }
        let live = registry.live_snapshot();
        assert_eq!(live.total_requests, 10);
        assert_eq!(live.failed_requests, 1);
        assert!((live.error_rate - 0.1).abs() < 1e-9);
        assert!((live.p99_ms - 50.0).abs() < 0.1);
        assert_eq!(live.window_p99_ms, None);
    }

    #[test]
    fn test_window_snapshot_covers_only_recent_requests() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        for _ in 0..1000 {
            builtins.http_req_duration.add(50.0);
        }
        let first = registry.window_snapshot().window_p99_ms.unwrap();
        assert!((first - 50.0).abs() < 0.1);

        // Nothing recorded since the last window
        assert_eq!(registry.window_snapshot().window_p99_ms, None);

        for _ in 0..10 {
            builtins.http_req_duration.add(400.0);
        }
        let snap = registry.window_snapshot();
        assert!((snap.window_p99_ms.unwrap() - 400.0).abs() < 1.0);
        // The run-wide p99 is still dominated by the earlier samples
        assert!(snap.p99_ms < 100.0);
    }

    #[test]
    fn test_metric_values_serialize_tagged() {
        let json = serde_json::to_value(MetricValues::Rate {
            passes: 1,
            fails: 0,
            rate: 1.0,
        })
        .unwrap();
        assert_eq!(json["type"], "rate");
        assert_eq!(json["passes"], 1);
    }
}
