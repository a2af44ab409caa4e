//! Scenario runner: weighted scenario selection and one-iteration execution.
//!
//! A [`Scenario`] pairs a [`WorkUnit`] (anything that performs one unit of
//! work and returns a [`Response`]) with named [`Check`]s and optional custom
//! metrics. The [`ScenarioRunner`] picks one scenario per iteration, runs it,
//! and records every observation straight into the run's collectors.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use tokio::time::Instant;

use crate::loadtest::error::{LoadTestError, ScenarioError};
use crate::loadtest::metrics::{BuiltinMetrics, Rate, Trend};

/// Allowed distance between the summed scenario weights and 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-3;

/// Result of one successful unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    /// Time the work unit itself measured (request sent to body received).
    pub elapsed: Duration,
}

impl Response {
    /// Parses the body as JSON; `None` when it is not valid JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Whether the status counts as a successful request (200-399).
    pub fn is_success_status(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// One unit of work performed per iteration, typically a single HTTP request.
///
/// A transport failure is returned as [`ScenarioError`]; a non-2xx status is
/// still an `Ok` response and is judged by the checks.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn execute(&self) -> Result<Response, ScenarioError>;
}

type Predicate = dyn Fn(&Response) -> bool + Send + Sync;

/// A named predicate over a [`Response`].
#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Arc<Predicate>,
}

impl Check {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applies the predicate. A panicking predicate counts as a failed check.
    pub fn evaluate(&self, response: &Response) -> bool {
        std::panic::catch_unwind(AssertUnwindSafe(|| (self.predicate)(response))).unwrap_or(false)
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// A weighted scenario in the mix.
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub weight: f64,
    pub work: Arc<dyn WorkUnit>,
    pub checks: Vec<Check>,
    /// Receives `true` when any check of an iteration fails.
    pub error_metric: Option<Arc<Rate>>,
    /// Receives the wall-clock duration of each successful execution.
    pub trend: Option<Arc<Trend>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, weight: f64, work: Arc<dyn WorkUnit>) -> Self {
        Self {
            name: name.into(),
            weight,
            work,
            checks: Vec::new(),
            error_metric: None,
            trend: None,
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_error_metric(mut self, rate: Arc<Rate>) -> Self {
        self.error_metric = Some(rate);
        self
    }

    pub fn with_trend(mut self, trend: Arc<Trend>) -> Self {
        self.trend = Some(trend);
        self
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("checks", &self.checks)
            .finish_non_exhaustive()
    }
}

/// Selects a scenario index from one uniform draw over the cumulative weights.
///
/// Sampling goes through [`WeightedIndex`]: the first scenario, in declared
/// order, whose cumulative weight exceeds the draw wins. With weights
/// 0.3 / 0.3 / 0.4 the boundaries are 0.3 / 0.6 / 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSelector {
    dist: WeightedIndex<f64>,
    bounds: Vec<f64>,
}

impl WeightedSelector {
    pub fn new(weights: &[f64]) -> Result<Self, LoadTestError> {
        if weights.is_empty() {
            return Err(LoadTestError::validation("At least one scenario is required"));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(LoadTestError::validation(
                "Scenario weights must be finite and non-negative",
            ));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(LoadTestError::validation(format!(
                "Scenario weights must sum to 1.0 (got {total})"
            )));
        }
        let dist = WeightedIndex::new(weights).map_err(|e| {
            LoadTestError::validation(format!("Invalid scenario weights: {e}"))
        })?;
        // Normalized so the last boundary is exactly 1.0, as the sampler
        // draws over the actual total.
        let bounds = weights
            .iter()
            .scan(0.0, |acc, w| {
                *acc += w;
                Some(*acc / total)
            })
            .collect();
        Ok(Self { dist, bounds })
    }

    /// Cumulative boundaries in `(0, 1]`, one per scenario.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Selection for a given draw in `[0, 1)`, over the same boundaries the
    /// sampler uses.
    pub fn pick(&self, draw: f64) -> usize {
        self.bounds
            .partition_point(|bound| *bound <= draw)
            .min(self.bounds.len() - 1)
    }

    /// Draws from `rng` and selects.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.dist.sample(rng)
    }
}

/// What one iteration did, for logging and tests.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub scenario: usize,
    /// `true` when the work unit succeeded and every check passed.
    pub passed: bool,
    pub elapsed: Duration,
    pub error: Option<ScenarioError>,
}

/// Executes iterations of the scenario mix and records their observations.
pub struct ScenarioRunner {
    scenarios: Vec<Scenario>,
    selector: WeightedSelector,
    metrics: BuiltinMetrics,
}

impl ScenarioRunner {
    pub fn new(scenarios: Vec<Scenario>, metrics: BuiltinMetrics) -> Result<Self, LoadTestError> {
        let weights: Vec<f64> = scenarios.iter().map(|s| s.weight).collect();
        let selector = WeightedSelector::new(&weights)?;
        Ok(Self {
            scenarios,
            selector,
            metrics,
        })
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn metrics(&self) -> &BuiltinMetrics {
        &self.metrics
    }

    /// Runs one iteration: select, execute, check, record.
    ///
    /// Nothing is recorded until the work unit has finished, so dropping the
    /// returned future part-way leaves the collectors untouched.
    pub async fn run_iteration<R: Rng + ?Sized>(&self, rng: &mut R) -> IterationOutcome {
        let index = self.selector.sample(rng);
        self.run_scenario(index).await
    }

    /// Runs the scenario at `index` once and records its observations.
    pub async fn run_scenario(&self, index: usize) -> IterationOutcome {
        let scenario = &self.scenarios[index];
        let start = Instant::now();
        let result = AssertUnwindSafe(scenario.work.execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ScenarioError::Panicked {
                    message: panic_message(panic.as_ref()),
                })
            });
        let elapsed = start.elapsed();

        self.metrics.http_reqs.inc();

        match result {
            Ok(response) => {
                self.metrics.http_req_duration.add_duration(response.elapsed);
                self.metrics
                    .http_req_failed
                    .add(!response.is_success_status());

                let mut all_passed = true;
                for check in &scenario.checks {
                    let ok = check.evaluate(&response);
                    self.metrics.checks.add(ok);
                    all_passed &= ok;
                }
                if let Some(errors) = &scenario.error_metric {
                    errors.add(!all_passed);
                }
                if let Some(trend) = &scenario.trend {
                    trend.add_duration(elapsed);
                }

                IterationOutcome {
                    scenario: index,
                    passed: all_passed,
                    elapsed,
                    error: None,
                }
            }
            Err(err) => {
                if let ScenarioError::Panicked { message } = &err {
                    tracing::warn!(scenario = %scenario.name, %message, "work unit panicked");
                } else {
                    tracing::debug!(
                        scenario = %scenario.name,
                        category = err.error_category(),
                        error = %err,
                        "work unit failed"
                    );
                }
                self.metrics.http_req_failed.add(true);
                for _ in &scenario.checks {
                    self.metrics.checks.add(false);
                }
                if let Some(errors) = &scenario.error_metric {
                    errors.add(true);
                }

                IterationOutcome {
                    scenario: index,
                    passed: false,
                    elapsed,
                    error: Some(err),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::MetricRegistry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixed {
        status: u16,
        body: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl WorkUnit for Fixed {
        async fn execute(&self) -> Result<Response, ScenarioError> {
            tokio::time::sleep(self.delay).await;
            Ok(Response {
                status: self.status,
                body: self.body.as_bytes().to_vec(),
                elapsed: self.delay,
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl WorkUnit for Failing {
        async fn execute(&self) -> Result<Response, ScenarioError> {
            Err(ScenarioError::Timeout)
        }
    }

    struct Panicking;

    #[async_trait]
    impl WorkUnit for Panicking {
        async fn execute(&self) -> Result<Response, ScenarioError> {
            panic!("work unit exploded")
        }
    }

    fn ok_unit(body: &'static str) -> Arc<dyn WorkUnit> {
        Arc::new(Fixed {
            status: 200,
            body,
            delay: Duration::from_millis(100),
        })
    }

    fn status_check() -> Check {
        Check::new("status is 200", |r| r.status == 200)
    }

    fn json_check() -> Check {
        Check::new("is healthy", |r| {
            r.json()
                .and_then(|v| v.get("status").cloned())
                .is_some_and(|s| s == "healthy")
        })
    }

    #[test]
    fn test_selector_boundaries() {
        let selector = WeightedSelector::new(&[0.3, 0.3, 0.4]).unwrap();
        assert_eq!(selector.pick(0.0), 0);
        assert_eq!(selector.pick(0.29), 0);
        assert_eq!(selector.pick(0.3), 1);
        assert_eq!(selector.pick(0.59), 1);
        assert_eq!(selector.pick(0.6), 2);
        assert_eq!(selector.pick(0.999), 2);
    }

    #[test]
    fn test_selector_zero_weight_never_picked_and_bounds_normalized() {
        let selector = WeightedSelector::new(&[0.5, 0.0, 0.4995]).unwrap();
        assert_eq!(selector.bounds().last(), Some(&1.0));
        assert!((0..1000).all(|i| selector.pick(f64::from(i) / 1000.0) != 1));
        assert_eq!(selector.pick(0.9999), 2);

        let mut rng = StdRng::seed_from_u64(7);
        assert!((0..2000).all(|_| selector.sample(&mut rng) != 1));
    }

    #[test]
    fn test_selector_rejects_empty_and_negative() {
        assert!(WeightedSelector::new(&[]).is_err());
        assert!(WeightedSelector::new(&[1.5, -0.5]).is_err());
        assert!(WeightedSelector::new(&[0.5, 0.4]).is_err());
    }

    #[test]
    fn test_selector_sample_distribution() {
        let selector = WeightedSelector::new(&[0.3, 0.3, 0.4]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0u32; 3];
        for _ in 0..10_000 {
            counts[selector.sample(&mut rng)] += 1;
        }
        for (count, expected) in counts.iter().zip([3000, 3000, 4000]) {
            assert!(
                (i64::from(*count) - expected).abs() < 300,
                "counts {counts:?}"
            );
        }
    }

    #[test]
    fn test_check_panic_is_failure() {
        let check = Check::new("explodes", |_| panic!("bad predicate"));
        let response = Response {
            status: 200,
            body: Vec::new(),
            elapsed: Duration::ZERO,
        };
        assert!(!check.evaluate(&response));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_iteration_records_everything() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let errors = registry.register_rate("errors").unwrap();
        let latency = registry.register_trend("health_check_latency").unwrap();

        let scenario = Scenario::new("health", 1.0, ok_unit(r#"{"status":"healthy"}"#))
            .with_check(status_check())
            .with_check(json_check())
            .with_error_metric(errors.clone())
            .with_trend(latency.clone());
        let runner = ScenarioRunner::new(vec![scenario], builtins.clone()).unwrap();

        let outcome = runner.run_scenario(0).await;
        assert!(outcome.passed);
        assert_eq!(outcome.elapsed, Duration::from_millis(100));
        assert_eq!(builtins.http_reqs.count(), 1);
        assert_eq!(builtins.checks.passes(), 2);
        assert_eq!(builtins.http_req_failed.passes(), 0);
        assert_eq!(errors.total(), 1);
        assert_eq!(errors.passes(), 0);
        assert_eq!(latency.values(&[]).max, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_body_is_failed_check() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let errors = registry.register_rate("errors").unwrap();
        let scenario = Scenario::new("health", 1.0, ok_unit("<html>oops</html>"))
            .with_check(status_check())
            .with_check(json_check())
            .with_error_metric(errors.clone());
        let runner = ScenarioRunner::new(vec![scenario], builtins.clone()).unwrap();

        let outcome = runner.run_scenario(0).await;
        assert!(!outcome.passed);
        assert!(outcome.error.is_none());
        assert_eq!(builtins.checks.passes(), 1);
        assert_eq!(builtins.checks.fails(), 1);
        assert_eq!(errors.passes(), 1);
    }

    #[tokio::test]
    async fn test_error_status_marks_request_failed() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let unit = Arc::new(Fixed {
            status: 503,
            body: "",
            delay: Duration::ZERO,
        });
        let runner = ScenarioRunner::new(
            vec![Scenario::new("down", 1.0, unit).with_check(status_check())],
            builtins.clone(),
        )
        .unwrap();

        runner.run_scenario(0).await;
        assert_eq!(builtins.http_req_failed.passes(), 1);
        assert_eq!(builtins.checks.fails(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_fails_all_checks_without_duration() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let latency = registry.register_trend("latency").unwrap();
        let runner = ScenarioRunner::new(
            vec![Scenario::new("timeout", 1.0, Arc::new(Failing))
                .with_check(status_check())
                .with_check(json_check())
                .with_trend(latency.clone())],
            builtins.clone(),
        )
        .unwrap();

        let outcome = runner.run_scenario(0).await;
        assert!(matches!(outcome.error, Some(ScenarioError::Timeout)));
        assert_eq!(builtins.checks.fails(), 2);
        assert_eq!(builtins.http_req_failed.passes(), 1);
        assert_eq!(builtins.http_req_duration.count(), 0);
        assert_eq!(latency.count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_work_unit_is_recovered() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let runner = ScenarioRunner::new(
            vec![Scenario::new("boom", 1.0, Arc::new(Panicking)).with_check(status_check())],
            builtins.clone(),
        )
        .unwrap();

        let outcome = runner.run_scenario(0).await;
        match outcome.error {
            Some(ScenarioError::Panicked { message }) => {
                assert!(message.contains("exploded"))
            }
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_eq!(builtins.checks.fails(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_iteration_records_nothing() {
        let mut registry = MetricRegistry::new();
        let builtins = BuiltinMetrics::resolve(&mut registry).unwrap();
        let runner = ScenarioRunner::new(
            vec![Scenario::new("slow", 1.0, ok_unit("{}")).with_check(status_check())],
            builtins.clone(),
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let interrupted =
            tokio::time::timeout(Duration::from_millis(10), runner.run_iteration(&mut rng)).await;
        assert!(interrupted.is_err());
        assert_eq!(builtins.http_reqs.count(), 0);
        assert_eq!(builtins.checks.total(), 0);
    }
}
