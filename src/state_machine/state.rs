use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a single job execution.
///
/// ```text
/// Routed → Admitted → Executing → ValidatedPass
///                               → ValidatedFailRetriedPass
///                               → ValidatedFailTerminal
///                               → Failed
/// Routed | Executing → RejectedBudget | RejectedCircuit
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Routed,
    Admitted,
    RejectedBudget,
    RejectedCircuit,
    Executing,
    ValidatedPass,
    ValidatedFailRetriedPass,
    ValidatedFailTerminal,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::RejectedBudget
                | JobState::RejectedCircuit
                | JobState::ValidatedPass
                | JobState::ValidatedFailRetriedPass
                | JobState::ValidatedFailTerminal
                | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Routed => write!(f, "ROUTED"),
            JobState::Admitted => write!(f, "ADMITTED"),
            JobState::RejectedBudget => write!(f, "REJECTED_BUDGET"),
            JobState::RejectedCircuit => write!(f, "REJECTED_CIRCUIT"),
            JobState::Executing => write!(f, "EXECUTING"),
            JobState::ValidatedPass => write!(f, "VALIDATED_PASS"),
            JobState::ValidatedFailRetriedPass => write!(f, "VALIDATED_FAIL_RETRIED_PASS"),
            JobState::ValidatedFailTerminal => write!(f, "VALIDATED_FAIL_TERMINAL"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Inputs that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Admit,
    Start,
    RejectBudget,
    RejectCircuit,
    Pass { retried: bool },
    FailValidation,
    Fail,
}

/// The result of evaluating a lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the given state.
    Next(JobState),
    /// The event is a no-op in the current state.
    Stay(JobState),
    /// The event is not allowed in the current state.
    Invalid { from: JobState, event: LifecycleEvent },
}

/// Tracks the state of one execution and its history.
#[derive(Debug, Clone)]
pub struct JobLifecycle {
    state: JobState,
    history: Vec<JobState>,
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self {
            state: JobState::Routed,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state visited so far, the current one included.
    pub fn history(&self) -> Vec<JobState> {
        let mut states = self.history.clone();
        states.push(self.state);
        states
    }

    /// Pure transition table.
    ///
    /// Re-admission while executing (the corrective attempt) stays put, as
    /// does a repeated `Start`.
    pub fn next(state: JobState, event: LifecycleEvent) -> Transition {
        use JobState as S;
        use LifecycleEvent as E;

        match (state, event) {
            (S::Routed, E::Admit) => Transition::Next(S::Admitted),
            (S::Routed | S::Admitted | S::Executing, E::RejectBudget) => {
                Transition::Next(S::RejectedBudget)
            }
            (S::Routed | S::Admitted | S::Executing, E::RejectCircuit) => {
                Transition::Next(S::RejectedCircuit)
            }
            (S::Admitted, E::Start) => Transition::Next(S::Executing),
            (S::Executing, E::Admit | E::Start) => Transition::Stay(S::Executing),
            (S::Executing, E::Pass { retried: false }) => Transition::Next(S::ValidatedPass),
            (S::Executing, E::Pass { retried: true }) => {
                Transition::Next(S::ValidatedFailRetriedPass)
            }
            (S::Executing, E::FailValidation) => Transition::Next(S::ValidatedFailTerminal),
            // A world-class re-check can still reject an already validated job.
            (S::ValidatedPass | S::ValidatedFailRetriedPass, E::FailValidation) => {
                Transition::Next(S::ValidatedFailTerminal)
            }
            (s, E::Fail) if !s.is_terminal() => Transition::Next(S::Failed),
            (from, event) => Transition::Invalid { from, event },
        }
    }

    /// Applies an event, recording history on every real transition.
    pub fn apply(&mut self, event: LifecycleEvent) -> Transition {
        let transition = Self::next(self.state, event);
        if let Transition::Next(next) = transition {
            self.history.push(self.state);
            self.state = next;
        }
        transition
    }
}
