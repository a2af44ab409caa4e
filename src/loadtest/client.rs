//! HTTP work unit and declarative checks.
//!
//! [`HttpWorkUnit`] sends one request per iteration with a shared
//! [`reqwest::Client`]. Every virtual user shares the same client (and its
//! connection pool); the unit itself is immutable, so each iteration builds its
//! own request body from the payload templates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rand::RngExt;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::time::Instant;

use crate::loadtest::config::{CheckConfig, CheckKind, LoadTestConfig, ScenarioConfig};
use crate::loadtest::error::{LoadTestError, ScenarioError};
use crate::loadtest::metrics::MetricRegistry;
use crate::loadtest::scenario::{Check, Response, Scenario, WorkUnit};

/// Builds the HTTP client shared by every virtual user.
pub fn build_client(timeout: Duration) -> Result<Client, LoadTestError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("loadstage/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LoadTestError::validation(format!("Failed to build HTTP client: {e}")))
}

/// Joins `path` onto `base_url`, keeping any path prefix of the base.
pub fn join_url(base_url: &str, path: &str) -> Result<url::Url, LoadTestError> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url::Url::parse(&joined)
        .map_err(|e| LoadTestError::validation(format!("Invalid target URL '{joined}': {e}")))
}

/// One HTTP request per iteration.
#[derive(Debug, Clone)]
pub struct HttpWorkUnit {
    client: Client,
    method: Method,
    url: url::Url,
    payloads: Vec<Value>,
    stamp_field: Option<String>,
}

impl HttpWorkUnit {
    pub fn new(client: Client, base_url: &str, config: &ScenarioConfig) -> Result<Self, LoadTestError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            LoadTestError::validation(format!(
                "Scenario '{}' has invalid HTTP method '{}'",
                config.name, config.method
            ))
        })?;
        Ok(Self {
            client,
            method,
            url: join_url(base_url, &config.path)?,
            payloads: config.payloads.clone(),
            stamp_field: config.stamp_field.clone(),
        })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Builds this iteration's body: a random template, cloned, with the
    /// stamp field suffixed by the current time.
    ///
    /// A missing stamp field is inserted; a non-string one is left alone.
    /// The templates themselves are never modified.
    pub fn build_payload(&self) -> Option<Value> {
        if self.payloads.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.payloads.len());
        let mut payload = self.payloads[index].clone();
        if let (Some(field), Some(object)) = (&self.stamp_field, payload.as_object_mut()) {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            match object.get_mut(field) {
                Some(Value::String(s)) => {
                    s.push_str(" - ");
                    s.push_str(&now);
                }
                Some(_) => {}
                None => {
                    object.insert(field.clone(), Value::String(now));
                }
            }
        }
        Some(payload)
    }
}

#[async_trait]
impl WorkUnit for HttpWorkUnit {
    async fn execute(&self) -> Result<Response, ScenarioError> {
        let mut request = self.client.request(self.method.clone(), self.url.clone());
        if let Some(payload) = self.build_payload() {
            request = request.json(&payload);
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| ScenarioError::classify_reqwest(&e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ScenarioError::classify_reqwest(&e))?;

        Ok(Response {
            status,
            body: body.to_vec(),
            elapsed: start.elapsed(),
        })
    }
}

/// Turns a declarative check into a [`Check`].
pub fn build_check(config: &CheckConfig) -> Check {
    match config.kind.clone() {
        CheckKind::Status { expect } => Check::new(&config.name, move |r| r.status == expect),
        CheckKind::MaxDurationMs { limit } => Check::new(&config.name, move |r| {
            r.elapsed < Duration::from_millis(limit)
        }),
        CheckKind::JsonEquals { pointer, value } => Check::new(&config.name, move |r| {
            r.json()
                .is_some_and(|body| body.pointer(&pointer) == Some(&value))
        }),
        CheckKind::JsonIsArray { pointer } => Check::new(&config.name, move |r| {
            r.json()
                .is_some_and(|body| body.pointer(&pointer).is_some_and(Value::is_array))
        }),
        CheckKind::BodyContains { text } => Check::new(&config.name, move |r| {
            String::from_utf8_lossy(&r.body).contains(&text)
        }),
    }
}

/// Builds the HTTP scenario mix for `config` against `base_url`, wiring
/// custom metrics from `registry`.
pub fn build_scenarios(
    config: &LoadTestConfig,
    base_url: &str,
    registry: &mut MetricRegistry,
) -> Result<Vec<Scenario>, LoadTestError> {
    let client = build_client(config.settings.timeout.0)?;
    config
        .scenario
        .iter()
        .map(|sc| {
            let unit = HttpWorkUnit::new(client.clone(), base_url, sc)?;
            let mut scenario = Scenario::new(&sc.name, sc.weight, Arc::new(unit));
            for check in &sc.checks {
                scenario = scenario.with_check(build_check(check));
            }
            if let Some(name) = &sc.error_metric {
                scenario = scenario.with_error_metric(registry.register_rate(name)?);
            }
            if let Some(name) = &sc.trend_metric {
                scenario = scenario.with_trend(registry.register_trend(name)?);
            }
            Ok(scenario)
        })
        .collect()
}
