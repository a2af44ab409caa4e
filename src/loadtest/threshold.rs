//! Pass/fail thresholds evaluated against the final metric values.
//!
//! A threshold expression has the form `<aggregation> <operator> <number>`,
//! e.g. `p(95)<2000`, `rate < 0.05` or `count>=100`. Thresholds are parsed
//! and bound to the run's metrics before the first virtual user starts, so a
//! typo never surfaces after a long run.
//!
//! | aggregation            | counter | rate | trend |
//! |------------------------|---------|------|-------|
//! | `count`                | yes     |      | yes   |
//! | `rate`                 | yes     | yes  |       |
//! | `avg` `min` `max` `med`|         |      | yes   |
//! | `p(N)`                 |         |      | yes   |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricKind, MetricRegistry, MetricValues};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(avg|min|max|med|count|rate|p\(\s*(\d+(?:\.\d+)?)\s*\))\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)\s*$",
    )
    .expect("threshold expression regex is valid")
});

/// Aggregated value a threshold reads from a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Percentile(f64),
}

impl Aggregation {
    fn supports(self, kind: MetricKind) -> bool {
        match self {
            Self::Count => matches!(kind, MetricKind::Counter | MetricKind::Trend),
            Self::Rate => matches!(kind, MetricKind::Counter | MetricKind::Rate),
            Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_) => {
                kind == MetricKind::Trend
            }
        }
    }

    /// Reads this aggregation from a final metric value.
    ///
    /// Returns `None` when the value is undetermined: a trend without
    /// observations, or an aggregation the metric kind does not carry.
    fn read(self, values: &MetricValues) -> Option<f64> {
        match (self, values) {
            (Self::Count, MetricValues::Counter { count, .. }) => Some(*count as f64),
            (Self::Rate, MetricValues::Counter { rate, .. }) => Some(*rate),
            (Self::Rate, MetricValues::Rate { rate, .. }) => Some(*rate),
            (_, MetricValues::Trend(t)) if t.count == 0 => None,
            (Self::Count, MetricValues::Trend(t)) => Some(t.count as f64),
            (Self::Avg, MetricValues::Trend(t)) => Some(t.avg),
            (Self::Min, MetricValues::Trend(t)) => Some(t.min),
            (Self::Max, MetricValues::Trend(t)) => Some(t.max),
            (Self::Med, MetricValues::Trend(t)) => Some(t.med),
            (Self::Percentile(p), MetricValues::Trend(t)) => t.percentile(p),
            _ => None,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

/// Comparison operator of a threshold expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
        }
    }
}

/// One parsed threshold bound to a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    /// The expression as written in the config.
    pub expression: String,
    pub aggregation: Aggregation,
    pub operator: Operator,
    pub value: f64,
}

impl Threshold {
    /// Parses `expression` for `metric` without checking the metric exists.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, LoadTestError> {
        let caps = EXPRESSION.captures(expression).ok_or_else(|| {
            LoadTestError::validation(format!(
                "Invalid threshold '{expression}' on '{metric}': expected '<aggregation> <operator> <number>', e.g. 'p(95)<2000'"
            ))
        })?;

        let aggregation = match &caps[1] {
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            _ => {
                let p: f64 = caps[2].parse().map_err(|_| {
                    LoadTestError::validation(format!("Invalid percentile in '{expression}'"))
                })?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(LoadTestError::validation(format!(
                        "Percentile {p} in '{expression}' is outside 0..=100"
                    )));
                }
                Aggregation::Percentile(p)
            }
        };

        let operator = Operator::parse(&caps[3]).ok_or_else(|| {
            LoadTestError::validation(format!("Invalid operator in '{expression}'"))
        })?;
        let value: f64 = caps[4].parse().map_err(|_| {
            LoadTestError::validation(format!("Invalid number in '{expression}'"))
        })?;

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            aggregation,
            operator,
            value,
        })
    }

    fn evaluate(&self, metrics: &BTreeMap<String, MetricValues>) -> ThresholdResult {
        let actual = metrics
            .get(&self.metric)
            .and_then(|values| self.aggregation.read(values));
        let outcome = match actual {
            None => Outcome::Undetermined,
            Some(v) if self.operator.holds(v, self.value) => Outcome::Pass,
            Some(_) => Outcome::Fail,
        };
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            outcome,
            actual,
        }
    }
}

/// Every threshold of a run, validated against its metric registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Parses a `metric -> [expression, ...]` table and checks each metric
    /// exists in `registry` with a kind that carries the aggregation.
    pub fn parse(
        table: &BTreeMap<String, Vec<String>>,
        registry: &MetricRegistry,
    ) -> Result<Self, LoadTestError> {
        let mut thresholds = Vec::new();
        for (metric, expressions) in table {
            let kind = registry.kind(metric).ok_or_else(|| {
                LoadTestError::validation(format!(
                    "Threshold refers to unknown metric '{metric}'"
                ))
            })?;
            for expression in expressions {
                let threshold = Threshold::parse(metric, expression)?;
                if !threshold.aggregation.supports(kind) {
                    return Err(LoadTestError::validation(format!(
                        "Threshold '{expression}' uses '{}', which a {kind} metric ('{metric}') does not provide",
                        threshold.aggregation
                    )));
                }
                thresholds.push(threshold);
            }
        }
        Ok(Self { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    /// Percentiles referenced by `p(N)` thresholds.
    pub fn required_percentiles(&self) -> impl Iterator<Item = f64> + '_ {
        self.thresholds.iter().filter_map(|t| match t.aggregation {
            Aggregation::Percentile(p) => Some(p),
            _ => None,
        })
    }

    /// `base` plus every percentile a threshold needs, sorted and deduplicated.
    pub fn merge_percentiles(&self, base: &[f64]) -> Vec<f64> {
        let mut percentiles = base.to_vec();
        for p in self.required_percentiles() {
            if !percentiles.iter().any(|q| (q - p).abs() < f64::EPSILON) {
                percentiles.push(p);
            }
        }
        percentiles.sort_by(f64::total_cmp);
        percentiles.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
        percentiles
    }

    /// Evaluates every threshold against the final metric values.
    ///
    /// The overall verdict passes when no determined threshold fails;
    /// undetermined thresholds are reported but do not count.
    pub fn evaluate(&self, metrics: &BTreeMap<String, MetricValues>) -> ThresholdReport {
        let results: Vec<ThresholdResult> =
            self.thresholds.iter().map(|t| t.evaluate(metrics)).collect();
        let overall_pass = results.iter().all(|r| r.outcome != Outcome::Fail);
        ThresholdReport {
            overall_pass,
            results,
        }
    }
}

/// Verdict of a single threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    /// The metric had no observations to judge.
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub outcome: Outcome,
    /// Value the expression was evaluated against, if any.
    pub actual: Option<f64>,
}

/// Outcome of threshold evaluation for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub overall_pass: bool,
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    /// Number of thresholds that failed.
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Fail)
            .count()
    }
}
