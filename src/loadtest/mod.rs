//! Load testing engine for HTTP services.
//!
//! Provides typed TOML configuration, a piecewise-linear stage scheduler, a
//! virtual-user pool, weighted scenario execution over a reqwest-based work
//! unit, Counter/Rate/Trend metric collectors, threshold evaluation, breaking
//! point detection and terminal/JSON reporters.

pub mod breaking;
pub mod client;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod report;
pub mod scenario;
pub mod schedule;
pub mod summary;
pub mod threshold;
pub mod vu;
