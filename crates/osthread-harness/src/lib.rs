//! Conformance and stress harness for osthread.
//!
//! This crate provides:
//! - Scenarios: multi-threaded checks of TLS isolation, mutual exclusion,
//!   monitor wakeups and thread lifecycle, run against the compiled backend
//! - Structured logs: one JSONL line per scenario iteration
//! - Reports: a JSON suite summary plus an artifact index with SHA-256 digests

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use report::{RunOutputs, ScenarioResult, SuiteReport, new_run_id, run_suite};
pub use scenarios::Scenario;
