//! TOML-based load test configuration.
//!
//! A config file describes the load profile (`[[stage]]` blocks or flat
//! `vus` + `duration`), the weighted scenario mix, and the pass/fail
//! thresholds evaluated after the run.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! think_time = ["1s", "3s"]
//! timeout = "10s"
//!
//! [[stage]]
//! duration = "2m"
//! target = 10
//!
//! [[stage]]
//! duration = "5m"
//! target = 10
//!
//! [[scenario]]
//! name = "health"
//! weight = 0.3
//! path = "/health"
//! error_metric = "errors"
//! trend_metric = "health_check_latency"
//! checks = [
//!   { name = "status is 200", type = "status", expect = 200 },
//!   { name = "is healthy", type = "json_equals", pointer = "/status", value = "healthy" },
//! ]
//!
//! [thresholds]
//! http_req_duration = ["p(95)<2000"]
//! http_req_failed = ["rate<0.05"]
//! ```
//!
//! The target URL is NOT part of the config file. It is provided with the
//! `--url` flag or the `TARGET_URL` environment variable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricRegistry, DEFAULT_PERCENTILES};
use crate::loadtest::scenario::WEIGHT_TOLERANCE;
use crate::loadtest::schedule::{Schedule, Stage};
use crate::loadtest::threshold::ThresholdSet;

/// A duration written the way load test tools write them: `"2m"`, `"30s"`,
/// `"500ms"`, `"1m30s"`, `"1.5s"`. A bare number is read as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a human duration string such as `"1m30s"` or `"250ms"`.
///
/// Anything `humantime` accepts is accepted. On top of that a plain number is
/// read as seconds, and a single fractional component such as `"1.5s"` is
/// allowed.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let err = match humantime::parse_duration(s) {
        Ok(d) => return Ok(d),
        Err(e) => e,
    };

    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let factor = match unit {
        "" | "s" => 1.0,
        "ms" => 0.001,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(format!("invalid duration '{input}': {err}")),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{input}': {err}"))?;
    Duration::try_from_secs_f64(value * factor)
        .map_err(|_| format!("invalid duration '{input}': must be a non-negative finite value"))
}

/// A load-shaping stage: move to `target` virtual users over `duration`.
///
/// `target` is read as a signed integer so that a negative value surfaces as
/// a validation error naming the stage rather than a type error.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StageConfig {
    pub duration: HumanDuration,
    pub target: i64,
}

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoadTestConfig {
    #[serde(default)]
    pub settings: Settings,
    /// Load-shaping stages. The field name is `stage` because TOML
    /// `[[stage]]` array-of-tables syntax creates a key called `stage`.
    #[serde(default)]
    pub stage: Vec<StageConfig>,
    pub scenario: Vec<ScenarioConfig>,
    /// Metric name to the list of threshold expressions on it.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

/// General settings controlling execution.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Flat mode concurrency, used when no `[[stage]]` is given.
    pub vus: Option<u32>,
    /// Flat mode duration, used when no `[[stage]]` is given.
    pub duration: Option<HumanDuration>,
    /// Concurrency at `t = 0`, before the first stage starts ramping.
    pub start_vus: u32,
    /// `[min, max]` idle time between iterations of one virtual user.
    pub think_time: [HumanDuration; 2],
    /// How often the pool is reconciled against the schedule.
    pub reconcile_interval: HumanDuration,
    /// Time granted to in-flight iterations after the run is told to stop.
    pub graceful_stop: HumanDuration,
    /// Per-request timeout of the HTTP work unit.
    pub timeout: HumanDuration,
    /// Stop after this many iterations across all virtual users.
    pub iterations: Option<u64>,
    /// Percentiles computed for every trend in the summary.
    pub percentiles: Vec<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vus: None,
            duration: None,
            start_vus: 0,
            think_time: [
                HumanDuration(Duration::from_secs(1)),
                HumanDuration(Duration::from_secs(3)),
            ],
            reconcile_interval: HumanDuration(Duration::from_secs(1)),
            graceful_stop: HumanDuration(Duration::from_secs(30)),
            timeout: HumanDuration(Duration::from_secs(30)),
            iterations: None,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }
}

impl Settings {
    pub fn think_time_range(&self) -> (Duration, Duration) {
        (self.think_time[0].0, self.think_time[1].0)
    }
}

/// One weighted HTTP scenario.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub name: String,
    /// Selection probability; all weights must sum to 1.0.
    pub weight: f64,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path joined to the target URL.
    pub path: String,
    /// JSON bodies; one is picked at random per iteration.
    #[serde(default)]
    pub payloads: Vec<serde_json::Value>,
    /// Top-level string field of the payload suffixed with the send time.
    #[serde(default)]
    pub stamp_field: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    /// Rate metric receiving `true` whenever any check of this scenario fails.
    #[serde(default)]
    pub error_metric: Option<String>,
    /// Trend metric receiving the wall-clock duration of this scenario.
    #[serde(default)]
    pub trend_metric: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A named declarative check over a response.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
}

/// Supported check predicates. The `type` key selects the variant.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// Response status equals `expect`.
    Status { expect: u16 },
    /// Response time is strictly below `limit` milliseconds.
    MaxDurationMs { limit: u64 },
    /// The JSON value at `pointer` (RFC 6901) equals `value`.
    JsonEquals {
        pointer: String,
        value: serde_json::Value,
    },
    /// The JSON value at `pointer` is an array.
    JsonIsArray { pointer: String },
    /// The body contains `text`.
    BodyContains { text: String },
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a [`LoadTestConfig`] from a file path.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or
    /// [`LoadTestError::ConfigValidation`] if validation fails.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn has_stages(&self) -> bool {
        !self.stage.is_empty()
    }

    /// Builds the concurrency schedule.
    ///
    /// With `[[stage]]` blocks the stages are used as written. Without them,
    /// flat mode steps straight to `settings.vus` and holds for
    /// `settings.duration`.
    pub fn schedule(&self) -> Result<Schedule, LoadTestError> {
        if self.has_stages() {
            let stages = self
                .stage
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let target = u32::try_from(s.target).map_err(|_| {
                        LoadTestError::validation(format!(
                            "Stage {} has target={}; targets must be between 0 and {}",
                            i + 1,
                            s.target,
                            u32::MAX
                        ))
                    })?;
                    Ok(Stage::new(s.duration.0, target))
                })
                .collect::<Result<Vec<_>, LoadTestError>>()?;
            return Schedule::with_start_target(stages, self.settings.start_vus);
        }

        match (self.settings.vus, self.settings.duration) {
            (Some(vus), Some(duration)) => Schedule::new(vec![
                Stage::new(Duration::ZERO, vus),
                Stage::new(duration.0, vus),
            ]),
            _ => Err(LoadTestError::validation(
                "Config must contain [[stage]] blocks or both settings.vus and settings.duration",
            )),
        }
    }

    /// Builds a fresh registry holding the built-in metrics plus every
    /// custom metric the scenarios declare.
    pub fn metric_registry(&self) -> Result<MetricRegistry, LoadTestError> {
        let mut registry = MetricRegistry::new();
        for scenario in &self.scenario {
            if let Some(name) = &scenario.error_metric {
                registry.register_rate(name)?;
            }
            if let Some(name) = &scenario.trend_metric {
                registry.register_trend(name)?;
            }
        }
        Ok(registry)
    }

    /// Parses and binds the `[thresholds]` table against `registry`.
    pub fn threshold_set(&self, registry: &MetricRegistry) -> Result<ThresholdSet, LoadTestError> {
        ThresholdSet::parse(&self.thresholds, registry)
    }

    /// Percentiles computed for trends: the configured ones plus any a
    /// threshold refers to.
    pub fn summary_percentiles(&self, thresholds: &ThresholdSet) -> Vec<f64> {
        thresholds.merge_percentiles(&self.settings.percentiles)
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - At least one scenario; weights are finite, non-negative and sum to 1.0
    /// - A schedule can be built (stages, or flat `vus` + `duration`)
    /// - Think time range is ordered, reconcile interval is positive
    /// - Percentiles lie in `[0, 100]`
    /// - Custom metrics do not clash with other metric kinds
    /// - Every threshold parses and refers to a known metric of a compatible kind
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.scenario.is_empty() {
            return Err(LoadTestError::validation(
                "Config must contain at least one [[scenario]]",
            ));
        }

        for scenario in &self.scenario {
            if !scenario.weight.is_finite() || scenario.weight < 0.0 {
                return Err(LoadTestError::validation(format!(
                    "Scenario '{}' has weight {}; weights must be non-negative",
                    scenario.name, scenario.weight
                )));
            }
            reqwest::Method::from_bytes(scenario.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| {
                    LoadTestError::validation(format!(
                        "Scenario '{}' has invalid HTTP method '{}'",
                        scenario.name, scenario.method
                    ))
                })?;
        }

        let total_weight: f64 = self.scenario.iter().map(|s| s.weight).sum();
        if (total_weight - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(LoadTestError::validation(format!(
                "Scenario weights must sum to 1.0 (got {total_weight})"
            )));
        }

        if self.has_stages() && self.settings.vus.is_some() {
            tracing::warn!(
                vus = self.settings.vus,
                "settings.vus is ignored when [[stage]] blocks are present"
            );
        }
        self.schedule()?;

        let (min_think, max_think) = self.settings.think_time_range();
        if min_think > max_think {
            return Err(LoadTestError::validation(format!(
                "settings.think_time minimum ({}) exceeds maximum ({})",
                self.settings.think_time[0], self.settings.think_time[1]
            )));
        }
        if self.settings.reconcile_interval.0.is_zero() {
            return Err(LoadTestError::validation(
                "settings.reconcile_interval must be greater than zero",
            ));
        }
        if self.settings.iterations == Some(0) {
            return Err(LoadTestError::validation(
                "settings.iterations must be greater than zero",
            ));
        }
        if let Some(p) = self
            .settings
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(LoadTestError::validation(format!(
                "Percentile {p} is outside 0..=100"
            )));
        }

        let registry = self.metric_registry()?;
        self.threshold_set(&registry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MIXED: &str = r#"
[settings]
think_time = ["1s", "3s"]

[[stage]]
duration = "2m"
target = 10

[[stage]]
duration = "5m"
target = 10

[[stage]]
duration = "2m"
target = 0

[[scenario]]
name = "health"
weight = 0.3
path = "/health"
error_metric = "errors"
trend_metric = "health_check_latency"
checks = [
  { name = "health check status is 200", type = "status", expect = 200 },
  { name = "health check response time < 500ms", type = "max_duration_ms", limit = 500 },
  { name = "health check has correct status", type = "json_equals", pointer = "/status", value = "healthy" },
]

[[scenario]]
name = "get data"
weight = 0.3
path = "/data"
error_metric = "errors"
checks = [
  { name = "get data returns array", type = "json_is_array", pointer = "/data" },
]

[[scenario]]
name = "post data"
weight = 0.4
method = "POST"
path = "/data"
stamp_field = "message"
payloads = [
  { name = "Alice Johnson", message = "Load testing" },
  { name = "Bob Smith", message = "Testing database performance" },
]
error_metric = "errors"
trend_metric = "db_insert_latency"

[thresholds]
http_req_duration = ["p(95)<2000"]
http_req_failed = ["rate<0.05"]
errors = ["rate<0.1"]
"#;

    fn minimal(extra: &str) -> String {
        format!(
            r#"
[settings]
vus = 5
duration = "30s"
{extra}

[[scenario]]
name = "ping"
weight = 1.0
path = "/"
"#
        )
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_human_duration_display() {
        assert_eq!(HumanDuration(Duration::from_secs(90)).to_string(), "1m 30s");
        assert_eq!(HumanDuration(Duration::from_millis(250)).to_string(), "250ms");
        assert_eq!(HumanDuration(Duration::ZERO).to_string(), "0s");
    }

    #[test]
    fn test_human_duration_long_forms_and_round_trip() {
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));

        let settings = Settings {
            duration: Some(HumanDuration(Duration::from_millis(90_500))),
            ..Settings::default()
        };
        let text = toml::to_string(&settings).unwrap();
        assert!(text.contains(r#"duration = "1m 30s 500ms""#), "{text}");
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_parse_mixed_config() {
        let config = LoadTestConfig::from_toml(MIXED).unwrap();
        assert_eq!(config.stage.len(), 3);
        assert_eq!(config.stage[0].duration.0, Duration::from_secs(120));
        assert_eq!(config.scenario.len(), 3);
        assert_eq!(config.scenario[0].method, "GET");
        assert_eq!(config.scenario[2].method, "POST");
        assert_eq!(config.scenario[2].payloads.len(), 2);
        assert_eq!(config.scenario[2].stamp_field.as_deref(), Some("message"));
        assert_eq!(
            config.scenario[0].checks[2].kind,
            CheckKind::JsonEquals {
                pointer: "/status".to_string(),
                value: serde_json::json!("healthy"),
            }
        );
        assert_eq!(config.thresholds["errors"], vec!["rate<0.1".to_string()]);
        assert_eq!(config.settings.graceful_stop.0, Duration::from_secs(30));

        let schedule = config.schedule().unwrap();
        assert_eq!(schedule.total_duration(), Duration::from_secs(540));
        assert_eq!(schedule.max_target(), 10);
    }

    #[test]
    fn test_flat_mode_schedule_steps_then_holds() {
        let config = LoadTestConfig::from_toml(&minimal("")).unwrap();
        let schedule = config.schedule().unwrap();
        assert_eq!(schedule.target_at(Duration::ZERO), 5);
        assert_eq!(schedule.target_at(Duration::from_secs(29)), 5);
        assert_eq!(schedule.total_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_profile_fails() {
        let toml_str = r#"
[[scenario]]
name = "ping"
weight = 1.0
path = "/"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("settings.vus"));
    }

    #[test]
    fn test_negative_stage_target_fails() {
        let toml_str = r#"
[[stage]]
duration = "10s"
target = -1

[[scenario]]
name = "ping"
weight = 1.0
path = "/"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
        assert!(err.to_string().contains("Stage 1"));
    }

    #[test]
    fn test_negative_stage_duration_fails_to_parse() {
        let toml_str = r#"
[[stage]]
duration = "-10s"
target = 1

[[scenario]]
name = "ping"
weight = 1.0
path = "/"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let toml_str = r#"
[settings]
vus = 1
duration = "1s"

[[scenario]]
name = "a"
weight = 0.5
path = "/a"

[[scenario]]
name = "b"
weight = 0.4
path = "/b"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_weights_within_tolerance_pass() {
        let toml_str = r#"
[settings]
vus = 1
duration = "1s"

[[scenario]]
name = "a"
weight = 0.333
path = "/a"

[[scenario]]
name = "b"
weight = 0.333
path = "/b"

[[scenario]]
name = "c"
weight = 0.3335
path = "/c"
"#;
        assert!(LoadTestConfig::from_toml(toml_str).is_ok());
    }

    #[test]
    fn test_empty_scenarios_fail() {
        let toml_str = r#"
scenario = []

[settings]
vus = 1
duration = "1s"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
    }

    #[test]
    fn test_inverted_think_time_fails() {
        let err = LoadTestConfig::from_toml(&minimal(r#"think_time = ["3s", "1s"]"#)).unwrap_err();
        assert!(err.to_string().contains("think_time"));
    }

    #[test]
    fn test_bad_threshold_syntax_fails() {
        let toml = format!("{}\n[thresholds]\nhttp_req_duration = [\"p95 < 2000\"]\n", minimal(""));
        let err = LoadTestConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
    }

    #[test]
    fn test_threshold_on_unknown_metric_fails() {
        let toml = format!("{}\n[thresholds]\nerrors = [\"rate<0.1\"]\n", minimal(""));
        let err = LoadTestConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("errors"));
    }

    #[test]
    fn test_custom_metric_kind_conflict_fails() {
        let toml_str = r#"
[settings]
vus = 1
duration = "1s"

[[scenario]]
name = "a"
weight = 1.0
path = "/a"
error_metric = "http_req_duration"
"#;
        let err = LoadTestConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_summary_percentiles_include_threshold_percentiles() {
        let toml = format!(
            "{}\n[thresholds]\nhttp_req_duration = [\"p(99.9)<3000\", \"p(95)<2000\"]\n",
            minimal("")
        );
        let config = LoadTestConfig::from_toml(&toml).unwrap();
        let registry = config.metric_registry().unwrap();
        let thresholds = config.threshold_set(&registry).unwrap();
        assert_eq!(
            config.summary_percentiles(&thresholds),
            vec![90.0, 95.0, 99.0, 99.9]
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        tmpfile.write_all(MIXED.as_bytes()).unwrap();
        tmpfile.flush().unwrap();

        let config = LoadTestConfig::load(tmpfile.path()).unwrap();
        assert_eq!(config.scenario.len(), 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LoadTestConfig::load(Path::new("/nonexistent/path.toml"));
        assert!(matches!(
            result.unwrap_err(),
            LoadTestError::ConfigIo { .. }
        ));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = LoadTestConfig::from_toml("[settings\nvus = ").unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
    }
}
