mod job;
mod state;

pub use job::{
    ExecutionResult, ExecutionStatus, ExperimentSpec, ExperimentSummary, JobSpec, ModeFlags,
    OutputQuality, OutputSpec, QaConfig, ResultMetadata, RunContext, VariantOutcome, VariantSpec,
    WorkflowSpec,
};
pub use state::{JobLifecycle, JobState, LifecycleEvent, Transition};
