//! Terminal output: spinner while a job runs, coloured summaries after.
//!
//! Uses `indicatif` for the spinner and `console` for styling.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::OrchestratorError;
use crate::orchestrator::ServiceStatus;
use crate::router::RouteDecision;
use crate::state_machine::{ExecutionResult, ExecutionStatus, JobSpec};

/// Spinner and coloured result lines for one job run.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    pub fn start(job: &JobSpec) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("running {} ({})", job.job_id, job.job_type));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// A spinner that draws nothing, for `--json` runs.
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
            green: Style::new(),
            red: Style::new(),
            yellow: Style::new(),
            dim: Style::new(),
        }
    }

    pub fn succeeded(&self, result: &ExecutionResult) {
        self.pb.finish_and_clear();
        let meta = &result.metadata;
        let label = match result.status {
            ExecutionStatus::Passed => self.green.apply_to("✓ passed"),
            ExecutionStatus::PassedAfterAutoFix => self.yellow.apply_to("✓ passed after auto-fix"),
        };
        println!("  {label}  {}", result.output_ref);
        println!(
            "  {} backend={} score={:.1}/{:.0} ({}) threshold={:.0} cost={:.2}",
            self.dim.apply_to("│"),
            meta.backend,
            meta.qa.score,
            meta.qa.max_score,
            meta.qa.rating,
            meta.threshold,
            meta.cost,
        );
        if meta.auto_fix_applied {
            println!(
                "  {} attempts: {:?}",
                self.dim.apply_to("│"),
                meta.attempt_scores
            );
        }
        if let Some(report) = &meta.authoritative_qa {
            println!(
                "  {} authoritative score {:.1}",
                self.dim.apply_to("│"),
                report.score
            );
        }
        for step in &meta.workflow_trace {
            println!(
                "  {} step {} {} ({}ms)",
                self.dim.apply_to("│"),
                step.step,
                step.provider,
                step.duration_ms
            );
        }
        if let Some(experiment) = &meta.experiment {
            println!(
                "  {} experiment winner: {}",
                self.dim.apply_to("│"),
                experiment.winner
            );
        }
    }

    pub fn failed(&self, error: &OrchestratorError) {
        self.pb.finish_and_clear();
        let kind = error
            .kind()
            .map_or_else(|| "Error".to_string(), |k| k.to_string());
        eprintln!("  {} {kind}: {error}", self.red.apply_to("✗"));
    }
}

pub fn print_route(job: &JobSpec, decision: &RouteDecision) {
    let bold = Style::new().bold();
    println!(
        "{} → {} ({})",
        job.job_id,
        bold.apply_to(decision.backend),
        decision.reason
    );
}

pub fn print_status(status: &ServiceStatus) {
    let bold = Style::new().bold();
    let budget = &status.budget;
    println!("{}", bold.apply_to("Budget"));
    println!(
        "  daily    {:>8.2} / {:.2}",
        budget.daily_spend, budget.daily_cap
    );
    println!(
        "  monthly  {:>8.2} / {:.2}",
        budget.monthly_spend, budget.monthly_cap
    );
    println!("{}", bold.apply_to("Fallback queue"));
    println!(
        "  {} pending task(s) in {}",
        status.fallback_pending, status.fallback_path
    );
    if !status.circuits.is_empty() {
        println!("{}", bold.apply_to("Circuits"));
        for circuit in &status.circuits {
            println!(
                "  {:<20} {:?} ({}/{} failures)",
                circuit.service,
                circuit.state,
                circuit.consecutive_failures,
                circuit.failure_threshold
            );
        }
    }
}
