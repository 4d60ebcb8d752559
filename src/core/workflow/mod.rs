mod engine;
mod progress;
pub mod prompt;
mod runner;
pub mod types;

pub use engine::{EngineSettings, RunError, WorkflowEngine};
pub use progress::{ProgressEvent, ProgressSink};
pub use runner::{RunOptions, Runner};
pub use types::{
    CellValue, Classification, Dialect, ExecutedQuery, QueryResult, RunMetrics, RunReport,
    RunStatus, WorkflowRun,
};

/// Where one run's loop currently is. Only `Thinking` and `Executing` are
/// live; the rest end the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Thinking,
    Executing,
    Complete,
    Truncated,
    Error,
    Cancelled,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Thinking => "thinking",
            LoopState::Executing => "executing",
            LoopState::Complete => "complete",
            LoopState::Truncated => "truncated",
            LoopState::Error => "error",
            LoopState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, LoopState::Thinking | LoopState::Executing)
    }

    /// Status persisted for a terminal state. Truncation is a completion.
    pub fn run_status(self) -> RunStatus {
        match self {
            LoopState::Thinking | LoopState::Executing => RunStatus::Running,
            LoopState::Complete | LoopState::Truncated => RunStatus::Completed,
            LoopState::Error => RunStatus::Failed,
            LoopState::Cancelled => RunStatus::Cancelled,
        }
    }
}

pub fn can_transition(from: LoopState, to: LoopState) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        LoopState::Thinking => matches!(
            to,
            LoopState::Executing
                | LoopState::Complete
                | LoopState::Truncated
                | LoopState::Error
                | LoopState::Cancelled
        ),
        LoopState::Executing => matches!(
            to,
            LoopState::Thinking | LoopState::Truncated | LoopState::Error | LoopState::Cancelled
        ),
        LoopState::Complete | LoopState::Truncated | LoopState::Error | LoopState::Cancelled => {
            false
        }
    }
}

#[cfg(test)]
mod tests;
