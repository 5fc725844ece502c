//! CLI entrypoint for the osthread conformance harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use osthread_harness::structured_log::validate_log_file;
use osthread_harness::{HarnessError, RunOutputs, Scenario, new_run_id, run_suite};

/// Conformance and stress tooling for osthread.
#[derive(Debug, Parser)]
#[command(name = "osthread-harness")]
#[command(about = "Conformance and stress harness for osthread")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run scenarios against the compiled backend.
    Run {
        /// Scenario to run; repeat for several. Defaults to all.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Iterations per scenario.
        #[arg(long, default_value_t = 1)]
        iterations: u32,
        /// Structured JSONL log path.
        #[arg(long, default_value = "target/conformance/harness.log.jsonl")]
        log: PathBuf,
        /// JSON report path (if omitted, prints to stdout).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Artifact index JSON path.
        #[arg(long)]
        artifact_index: Option<PathBuf>,
        /// Fixed run id for reproducible trace ids.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// List scenarios.
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenarios,
            iterations,
            log,
            report,
            artifact_index,
            run_id,
        } => {
            let selected = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
                    .iter()
                    .map(|name| name.parse::<Scenario>())
                    .collect::<Result<Vec<_>, _>>()?
            };
            let run_id = run_id.unwrap_or_else(new_run_id);
            eprintln!(
                "Running {} scenario(s) x {iterations} on the {} backend ({run_id})",
                selected.len(),
                osthread::backend_name()
            );
            let outputs = RunOutputs {
                log: Some(log.clone()),
                report: report.clone(),
                artifact_index,
            };
            let suite = run_suite(&selected, iterations, &run_id, &outputs)?;
            if report.is_none() {
                println!("{}", suite.to_json()?);
            }
            eprintln!(
                "{}/{} passed; log at {}",
                suite.passed,
                suite.total,
                log.display()
            );
            if !suite.all_passed() {
                return Err(format!("{} scenario iteration(s) failed", suite.failed).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog {
                    path: log.display().to_string(),
                    errors: errors.len(),
                }
                .into());
            }
            eprintln!("{}: {lines} valid line(s)", log.display());
        }
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{:<22} {}", scenario.name(), scenario.description());
            }
        }
    }

    Ok(())
}
