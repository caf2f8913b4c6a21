use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use docpilot::cli::{Cli, Command};
use docpilot::config::DocpilotConfig;
use docpilot::logging;
use docpilot::orchestrator::{JobOrchestrator, Services};
use docpilot::reports::RunReport;
use docpilot::router::Router;
use docpilot::state_machine::{JobSpec, RunContext};
use docpilot::ui::{self, JobProgress};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = DocpilotConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { job_file, json } => {
            let job = JobSpec::load(&job_file)
                .with_context(|| format!("failed to load job {}", job_file.display()))?;
            let orchestrator =
                JobOrchestrator::from_config(&config).context("failed to start orchestrator")?;
            let progress = if json {
                JobProgress::hidden()
            } else {
                JobProgress::start(&job)
            };

            let run_id = RunContext::new_run_id();
            match orchestrator.execute_run(&job, &run_id).await {
                Ok(result) => {
                    write_report(&config, &RunReport::success(&result));
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        progress.succeeded(&result);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    let report = RunReport::failure(&job.job_id, &run_id, &e);
                    write_report(&config, &report);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        progress.failed(&e);
                    }
                    Ok(exit_code(e.exit_code()))
                }
            }
        }
        Command::Route { job_file } => {
            let job = JobSpec::load(&job_file)
                .with_context(|| format!("failed to load job {}", job_file.display()))?;
            match Router::from_config(&config.router).route(&job) {
                Ok(decision) => {
                    ui::print_route(&job, &decision);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(exit_code(e.exit_code()))
                }
            }
        }
        Command::Status => {
            let services = Services::from_config(&config).context("failed to open state")?;
            ui::print_status(&services.status().await?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn write_report(config: &DocpilotConfig, report: &RunReport) {
    match report.write(&config.reports.dir) {
        Ok(path) => info!(path = %path.display(), "run report written"),
        Err(e) => warn!(error = %e, "failed to write run report"),
    }
}
