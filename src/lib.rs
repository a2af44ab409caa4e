//! # loadstage
//!
//! Staged virtual-user load generator for HTTP services.
//!
//! A run ramps concurrent virtual users up and down following a list of
//! stages, drives each of them through a weighted scenario loop, records
//! request outcomes and latencies in lock-light collectors, and finally
//! judges the collected metrics against pass/fail thresholds.
//!
//! The [`loadtest`] module holds the whole engine; the `loadstage` binary is
//! a thin CLI over it.
//!
//! ```rust,no_run
//! use loadstage::loadtest::config::LoadTestConfig;
//! use loadstage::loadtest::engine::LoadTestEngine;
//!
//! # async fn demo() -> Result<(), loadstage::loadtest::error::LoadTestError> {
//! let config = LoadTestConfig::load(".loadstage/loadtest.toml".as_ref())?;
//! let summary = LoadTestEngine::from_config(&config, "http://localhost:3000")?
//!     .run()
//!     .await;
//! println!("passed: {}", summary.passed());
//! # Ok(())
//! # }
//! ```

pub mod loadtest;
