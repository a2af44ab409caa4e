//! Load test execution engine.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Ticks the [`Schedule`] at a fixed reconcile interval and resizes the
//!   [`VirtualUserPool`] to the current target
//! - Publishes live snapshots through a watch channel for the progress display
//!   and runs breaking point detection on each of them
//! - Stops on the first of: schedule complete, iteration limit, external stop
//!   (Ctrl+C), then drains VUs within the graceful stop window
//! - Finalizes the metric registry and evaluates thresholds into a [`RunSummary`]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::loadtest::breaking::{BreakingPoint, BreakingPointDetector};
use crate::loadtest::client::build_scenarios;
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::display::display_loop;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{
    BuiltinMetrics, LiveSnapshot, MetricRegistry, MetricValues, DEFAULT_PERCENTILES,
};
use crate::loadtest::scenario::{Scenario, ScenarioRunner};
use crate::loadtest::schedule::Schedule;
use crate::loadtest::threshold::{ThresholdReport, ThresholdSet};
use crate::loadtest::vu::{ActiveVuCounter, IterationBudget, ThinkTime, VirtualUserPool};

/// How often live snapshots are taken for the display and breaking point detection.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Compile-time Send bounds verification for channel-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<DisplayState>();
    _assert_send::<RunSummary>();
}

/// Display state published through the watch channel to the live terminal display.
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub snapshot: LiveSnapshot,
    pub elapsed: Duration,
    /// VU tasks alive, retiring ones included.
    pub live_vus: u32,
    /// Scheduler target at `elapsed`.
    pub target_vus: u32,
    /// Current stage label, e.g. `"stage 2/3"`, for multi-stage schedules.
    pub stage_label: Option<String>,
    /// Breaking point warning, set once when degradation is detected.
    pub breaking_point: Option<String>,
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The schedule's total duration elapsed.
    ScheduleComplete,
    /// The global iteration limit was reached.
    IterationLimit,
    /// Stopped from outside (Ctrl+C or [`LoadTestEngine::stop_token`]).
    Interrupted,
}

/// Immutable result of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    /// Wall-clock run time, drain included.
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    /// `false` if the graceful stop window expired and iterations were interrupted.
    pub graceful: bool,
    /// Highest number of concurrently live VUs observed by the scheduler.
    pub peak_vus: u32,
    /// Final value of every metric, keyed by name.
    pub metrics: BTreeMap<String, MetricValues>,
    pub thresholds: ThresholdReport,
    /// Breaking point event, if degradation was detected during the run.
    pub breaking_point: Option<BreakingPoint>,
}

impl RunSummary {
    /// Whether every determined threshold passed.
    pub fn passed(&self) -> bool {
        self.thresholds.overall_pass
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Top-level load test engine configuration and entry point.
pub struct LoadTestEngine {
    schedule: Schedule,
    registry: Arc<MetricRegistry>,
    runner: Arc<ScenarioRunner>,
    thresholds: ThresholdSet,
    percentiles: Vec<f64>,
    think: ThinkTime,
    reconcile_interval: Duration,
    graceful_stop: Duration,
    max_iterations: Option<u64>,
    live_display: bool,
    no_color: bool,
    ctrl_c: bool,
    stop: CancellationToken,
}

impl LoadTestEngine {
    /// Creates an engine over `scenarios`, whose custom metrics must already
    /// be registered in `registry`. Built-in metrics are added if missing.
    pub fn new(
        schedule: Schedule,
        mut registry: MetricRegistry,
        scenarios: Vec<Scenario>,
    ) -> Result<Self, LoadTestError> {
        let builtins = BuiltinMetrics::resolve(&mut registry)?;
        let runner = ScenarioRunner::new(scenarios, builtins)?;
        Ok(Self {
            schedule,
            registry: Arc::new(registry),
            runner: Arc::new(runner),
            thresholds: ThresholdSet::default(),
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            think: ThinkTime::none(),
            reconcile_interval: Duration::from_secs(1),
            graceful_stop: Duration::from_secs(30),
            max_iterations: None,
            live_display: false,
            no_color: false,
            ctrl_c: false,
            stop: CancellationToken::new(),
        })
    }

    /// Builds an HTTP load test from a config file against `base_url`.
    ///
    /// Every configuration error (schedule, weights, metrics, thresholds)
    /// surfaces here, before anything is spawned.
    pub fn from_config(config: &LoadTestConfig, base_url: &str) -> Result<Self, LoadTestError> {
        config.validate()?;
        let schedule = config.schedule()?;
        let mut registry = config.metric_registry()?;
        let scenarios = build_scenarios(config, base_url, &mut registry)?;
        let thresholds = config.threshold_set(&registry)?;
        let percentiles = config.summary_percentiles(&thresholds);
        let (min_think, max_think) = config.settings.think_time_range();

        let mut engine = Self::new(schedule, registry, scenarios)?
            .with_thresholds(thresholds)
            .with_percentiles(percentiles)
            .with_think_time(ThinkTime::new(min_think, max_think))
            .with_reconcile_interval(config.settings.reconcile_interval.0)
            .with_graceful_stop(config.settings.graceful_stop.0);
        if let Some(n) = config.settings.iterations {
            engine = engine.with_iterations(n);
        }
        Ok(engine)
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdSet) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Percentiles computed for every trend in the summary. Percentiles used by
    /// thresholds are always computed as well.
    pub fn with_percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    pub fn with_think_time(mut self, think: ThinkTime) -> Self {
        self.think = think;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_graceful_stop(mut self, grace: Duration) -> Self {
        self.graceful_stop = grace;
        self
    }

    /// Sets an iteration limit. The test stops after this many total iterations
    /// across all VUs (first-limit-wins with duration).
    pub fn with_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// Enables the live progress line on stderr.
    pub fn with_live_display(mut self, enabled: bool) -> Self {
        self.live_display = enabled;
        self
    }

    /// Disables colored output.
    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    /// Installs the two-phase Ctrl+C handler for the duration of the run.
    pub fn with_ctrl_c(mut self, enabled: bool) -> Self {
        self.ctrl_c = enabled;
        self
    }

    /// Token that stops the run gracefully when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn max_iterations(&self) -> Option<u64> {
        self.max_iterations
    }

    /// Run the load test to completion.
    pub async fn run(self) -> RunSummary {
        let started_at = Utc::now();
        let start = Instant::now();
        let total_stages = self.schedule.stages().len();

        tracing::info!(
            stages = total_stages,
            duration = ?self.schedule.total_duration(),
            max_vus = self.schedule.max_target(),
            "load test starting"
        );

        let budget = self.max_iterations.map(|n| Arc::new(IterationBudget::new(n)));
        let budget_exhausted = budget
            .as_ref()
            .map_or_else(CancellationToken::new, |b| b.exhausted().clone());
        let mut pool = VirtualUserPool::new(self.runner.clone(), self.think);
        if let Some(budget) = budget {
            pool = pool.with_iteration_budget(budget);
        }

        let ctrl_c_handle = self.ctrl_c.then(|| tokio::spawn(handle_ctrl_c(self.stop.clone())));

        // Progress publisher and live display
        let progress_cancel = CancellationToken::new();
        let (display_tx, display_rx) = watch::channel(DisplayState::default());
        let progress_handle = tokio::spawn(progress_loop(
            self.registry.clone(),
            self.schedule.clone(),
            pool.live_counter(),
            display_tx,
            progress_cancel.clone(),
            start,
        ));
        let display_handle = self.live_display.then(|| {
            tokio::spawn(display_loop(
                display_rx,
                progress_cancel.clone(),
                self.no_color,
            ))
        });

        // Stage scheduler loop
        let mut tick = tokio::time::interval(self.reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current_stage = None;
        let mut peak_vus = 0;

        let stop_reason = loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break StopReason::Interrupted,
                _ = budget_exhausted.cancelled() => break StopReason::IterationLimit,
                _ = tick.tick() => {
                    let now = self.schedule.tick(start.elapsed());
                    if now.finished {
                        break StopReason::ScheduleComplete;
                    }
                    if current_stage != Some(now.stage_index) {
                        current_stage = Some(now.stage_index);
                        tracing::info!(
                            stage = now.stage_index + 1,
                            of = total_stages,
                            target = self.schedule.stages()[now.stage_index].target,
                            "entering stage"
                        );
                    }
                    pool.reconcile(now.target);
                    peak_vus = peak_vus.max(pool.live());
                }
            }
        };

        tracing::info!(reason = ?stop_reason, live_vus = pool.live(), "stopping load test");
        let graceful = pool.drain(self.graceful_stop).await;
        let elapsed = start.elapsed();

        progress_cancel.cancel();
        let breaking_point = progress_handle.await.ok().flatten();
        if let Some(handle) = display_handle {
            let _ = handle.await;
        }
        if let Some(handle) = ctrl_c_handle {
            handle.abort();
        }

        let percentiles = self.thresholds.merge_percentiles(&self.percentiles);
        let metrics = self.registry.finalize(elapsed, &percentiles);
        let thresholds = self.thresholds.evaluate(&metrics);
        tracing::info!(
            elapsed = ?elapsed,
            passed = thresholds.overall_pass,
            "load test finished"
        );

        RunSummary {
            started_at,
            elapsed,
            stop_reason,
            graceful,
            peak_vus,
            metrics,
            thresholds,
            breaking_point,
        }
    }
}

/// Snapshot publisher.
///
/// Every [`PROGRESS_INTERVAL`] it reads the registry, feeds the breaking point
/// detector and publishes a [`DisplayState`]. Returns the detected breaking
/// point, if any, once cancelled.
async fn progress_loop(
    registry: Arc<MetricRegistry>,
    schedule: Schedule,
    live_vus: ActiveVuCounter,
    display_tx: watch::Sender<DisplayState>,
    cancel: CancellationToken,
    start: Instant,
) -> Option<BreakingPoint> {
    let mut detector = BreakingPointDetector::with_default_window();
    let mut warning: Option<String> = None;
    let total_stages = schedule.stages().len();
    let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let publish = |warning: &Option<String>| {
        let elapsed = start.elapsed();
        let now = schedule.tick(elapsed);
        display_tx.send_replace(DisplayState {
            snapshot: registry.live_snapshot(),
            elapsed,
            live_vus: live_vus.get(),
            target_vus: now.target,
            stage_label: (total_stages > 1)
                .then(|| format!("stage {}/{}", now.stage_index + 1, total_stages)),
            breaking_point: warning.clone(),
        });
    };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let elapsed = start.elapsed();
                let snapshot = registry.window_snapshot();
                if let Some(bp) = detector.observe(&snapshot, live_vus.get(), elapsed) {
                    warning = Some(format!(
                        "Breaking point detected at {} VUs ({}: {})",
                        bp.vus, bp.reason, bp.detail
                    ));
                }
                publish(&warning);
            }
        }
    }

    publish(&warning);
    detector.breaking_point().cloned()
}

/// Ctrl+C handler with two-phase shutdown.
///
/// First Ctrl+C triggers a graceful stop via the cancellation token.
/// Second Ctrl+C performs a hard abort via `std::process::exit(1)`.
async fn handle_ctrl_c(stop: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        return;
    }
    eprintln!("\nReceived Ctrl+C, stopping gracefully...");
    stop.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nReceived second Ctrl+C, aborting immediately.");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::ScenarioError;
    use crate::loadtest::scenario::{Check, Response, WorkUnit};
    use crate::loadtest::schedule::Stage;
    use crate::loadtest::threshold::Outcome;
    use async_trait::async_trait;

    struct Sleepy {
        work: Duration,
        status: u16,
    }

    #[async_trait]
    impl WorkUnit for Sleepy {
        async fn execute(&self) -> Result<Response, ScenarioError> {
            tokio::time::sleep(self.work).await;
            Ok(Response {
                status: self.status,
                body: br#"{"ok":true}"#.to_vec(),
                elapsed: self.work,
            })
        }
    }

    fn engine(stages: Vec<Stage>, work_ms: u64, status: u16) -> LoadTestEngine {
        let schedule = Schedule::new(stages).unwrap();
        let scenario = Scenario::new(
            "sleepy",
            1.0,
            Arc::new(Sleepy {
                work: Duration::from_millis(work_ms),
                status,
            }),
        )
        .with_check(Check::new("status is 200", |r| r.status == 200));
        LoadTestEngine::new(schedule, MetricRegistry::new(), vec![scenario]).unwrap()
    }

    fn table(metric: &str, exprs: &[&str]) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            metric.to_string(),
            exprs.iter().map(|e| e.to_string()).collect(),
        )])
    }

    fn counter(summary: &RunSummary, name: &str) -> u64 {
        match &summary.metrics[name] {
            MetricValues::Counter { count, .. } => *count,
            other => panic!("{name} is not a counter: {other:?}"),
        }
    }

    #[test]
    fn test_engine_builder() {
        let engine = engine(vec![Stage::new(Duration::from_secs(10), 2)], 10, 200)
            .with_iterations(1000)
            .with_no_color(true);
        assert_eq!(engine.max_iterations(), Some(1000));
        assert_eq!(engine.schedule().max_target(), 2);
        assert!(engine.registry().kind("checks").is_some());
    }

    #[test]
    fn test_from_config_surfaces_errors_before_start() {
        let config: LoadTestConfig = toml::from_str(
            r#"
[settings]
vus = 1
duration = "1s"

[[scenario]]
name = "a"
weight = 1.0
path = "/"

[thresholds]
http_req_duration = ["p(95)<<2000"]
"#,
        )
        .unwrap();
        let err = LoadTestEngine::from_config(&config, "http://localhost:1").err().unwrap();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_complete_run() {
        let registry = MetricRegistry::new();
        let thresholds = ThresholdSet::parse(&table("checks", &["rate==1"]), &registry).unwrap();
        let summary = engine(
            vec![
                Stage::new(Duration::from_secs(5), 4),
                Stage::new(Duration::from_secs(5), 0),
            ],
            100,
            200,
        )
        .with_think_time(ThinkTime::new(Duration::from_millis(400), Duration::from_millis(400)))
        .with_thresholds(thresholds)
        .run()
        .await;

        assert_eq!(summary.stop_reason, StopReason::ScheduleComplete);
        assert!(summary.graceful);
        assert!(summary.peak_vus <= 4 && summary.peak_vus >= 3);
        assert!(counter(&summary, "iterations") > 0);
        assert!(summary.passed());
        assert_eq!(summary.thresholds.results[0].outcome, Outcome::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_limit_stops_run() {
        let summary = engine(vec![Stage::new(Duration::from_secs(3600), 5)], 50, 200)
            .with_iterations(20)
            .run()
            .await;

        assert_eq!(summary.stop_reason, StopReason::IterationLimit);
        assert_eq!(counter(&summary, "iterations"), 20);
        assert!(summary.elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_token_interrupts_run() {
        let engine = engine(vec![Stage::new(Duration::from_secs(3600), 2)], 50, 200);
        let stop = engine.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stop.cancel();
        });

        let summary = engine.run().await;
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert!(summary.elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_expiry_interrupts_iterations() {
        let summary = engine(vec![Stage::new(Duration::from_secs(2), 3)], 60_000, 200)
            .with_graceful_stop(Duration::from_secs(1))
            .run()
            .await;

        assert!(!summary.graceful);
        assert_eq!(counter(&summary, "http_reqs"), 0);
        assert_eq!(counter(&summary, "iterations"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_thresholds_fail_summary() {
        let registry = MetricRegistry::new();
        let thresholds =
            ThresholdSet::parse(&table("http_req_failed", &["rate<0.05"]), &registry).unwrap();
        let summary = engine(vec![Stage::new(Duration::from_secs(3), 2)], 10, 500)
            .with_think_time(ThinkTime::new(Duration::from_millis(200), Duration::from_millis(200)))
            .with_thresholds(thresholds)
            .run()
            .await;

        assert!(!summary.passed());
        assert_eq!(summary.thresholds.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_percentile_outside_defaults_is_evaluated() {
        let registry = MetricRegistry::new();
        let thresholds = ThresholdSet::parse(
            &table("http_req_duration", &["p(50)<100", "p(99.9)<1000"]),
            &registry,
        )
        .unwrap();
        let summary = engine(vec![Stage::new(Duration::from_secs(5), 2)], 500, 200)
            .with_thresholds(thresholds)
            .run()
            .await;

        let results = &summary.thresholds.results;
        assert_eq!(results[0].expression, "p(50)<100");
        assert_eq!(results[0].outcome, Outcome::Fail);
        assert!((results[0].actual.unwrap() - 500.0).abs() < 1.0);
        assert_eq!(results[1].outcome, Outcome::Pass);
        assert!(!summary.passed());

        let MetricValues::Trend(duration) = &summary.metrics["http_req_duration"] else {
            panic!("http_req_duration is not a trend");
        };
        // Defaults are kept alongside the threshold percentiles
        assert!(duration.percentile(95.0).is_some());
        assert!(duration.percentile(50.0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_serializes() {
        let summary = engine(vec![Stage::new(Duration::from_secs(1), 1)], 10, 200)
            .run()
            .await;
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stop_reason"], "schedule_complete");
        assert_eq!(json["metrics"]["http_reqs"]["type"], "counter");
        assert!(json["elapsed"].as_f64().unwrap() >= 1.0);
    }
}
