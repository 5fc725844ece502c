//! Suite runner and JSON report.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::scenarios::Scenario;
use crate::structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};

/// One scenario iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub iteration: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub run_id: String,
    pub backend: String,
    pub iterations: u32,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Where a run writes its artifacts. `None` fields are skipped.
#[derive(Debug, Clone, Default)]
pub struct RunOutputs {
    pub log: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub artifact_index: Option<PathBuf>,
}

/// `run-<unix millis>`.
#[must_use]
pub fn new_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("run-{millis}")
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Run each scenario `iterations` times, logging one `scenario_result` line
/// per iteration.
///
/// A failing scenario is recorded and the suite continues.
///
/// # Errors
///
/// I/O or serialization failures while writing the log, report, or index.
pub fn run_suite(
    scenarios: &[Scenario],
    iterations: u32,
    run_id: &str,
    outputs: &RunOutputs,
) -> Result<SuiteReport, HarnessError> {
    let mut emitter = match &outputs.log {
        Some(path) => LogEmitter::to_file(path, run_id)?,
        None => LogEmitter::to_buffer(run_id),
    };
    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "suite_start").with_details(serde_json::json!({
            "scenarios": scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "iterations": iterations,
        })),
    )?;

    let suite_started = Instant::now();
    let mut results = Vec::new();
    for &scenario in scenarios {
        for iteration in 0..iterations {
            let started = Instant::now();
            let outcome = scenario.run();
            let duration_ms = elapsed_ms(started);
            let entry = LogEntry::new("", LogLevel::Info, "scenario_result")
                .with_scenario(scenario.name())
                .with_iteration(iteration)
                .with_duration_ms(duration_ms);
            let (entry, result) = match outcome {
                Ok(counts) => (
                    entry.with_outcome(Outcome::Pass).with_op_counts(&counts),
                    ScenarioResult {
                        scenario: scenario.name().to_string(),
                        iteration,
                        outcome: Outcome::Pass,
                        duration_ms,
                        message: None,
                    },
                ),
                Err(err) => {
                    let outcome = match err {
                        HarnessError::ScenarioFailed { .. } => Outcome::Fail,
                        _ => Outcome::Error,
                    };
                    let message = err.to_string();
                    eprintln!("{scenario} #{iteration}: {message}");
                    (
                        LogEntry {
                            level: LogLevel::Error,
                            ..entry
                        }
                        .with_outcome(outcome)
                        .with_details(serde_json::json!({ "message": message })),
                        ScenarioResult {
                            scenario: scenario.name().to_string(),
                            iteration,
                            outcome,
                            duration_ms,
                            message: Some(message),
                        },
                    )
                }
            };
            emitter.emit_entry(entry)?;
            results.push(result);
        }
    }

    let passed = results
        .iter()
        .filter(|r| r.outcome == Outcome::Pass)
        .count();
    let report = SuiteReport {
        run_id: run_id.to_string(),
        backend: osthread::backend_name().to_string(),
        iterations,
        total: results.len(),
        passed,
        failed: results.len() - passed,
        results,
    };

    let mut artifacts = Vec::new();
    if let Some(path) = &outputs.report {
        artifacts.push(path.display().to_string());
    }
    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "suite_end")
            .with_duration_ms(elapsed_ms(suite_started))
            .with_artifacts(artifacts)
            .with_details(serde_json::json!({
                "total": report.total,
                "passed": report.passed,
                "failed": report.failed,
            })),
    )?;
    emitter.flush()?;

    if let Some(path) = &outputs.report {
        write_with_parents(path, &report.to_json()?)?;
    }
    if let Some(index_path) = &outputs.artifact_index {
        let mut index = ArtifactIndex::new(run_id);
        if let Some(log) = &outputs.log {
            index.add_file(log, "log")?;
        }
        if let Some(report_path) = &outputs.report {
            index.add_file(report_path, "report")?;
        }
        write_with_parents(index_path, &index.to_json()?)?;
    }

    Ok(report)
}

fn write_with_parents(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}
