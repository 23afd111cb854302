//! Lifecycle states of workers and of the run as a whole.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a worker, or of the overall run.
///
/// Workers move through `Preparing → AwaitingBarrier → Running → Completed`. `Failed` is
/// absorbing and reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Generating payloads.
    Preparing,
    /// Ready and waiting for the barrier to be released.
    AwaitingBarrier,
    /// Uploading payloads.
    Running,
    /// All assigned uploads were issued.
    Completed,
    /// Preparation failed, or the worker was lost or aborted.
    Failed,
}

impl RunState {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns whether a worker in this state may move to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RunState::*;

        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Preparing, AwaitingBarrier) => true,
            (AwaitingBarrier, Running) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }

    /// Derives the coarse state of a run from the states of its workers.
    ///
    /// A single failed worker fails the run. Otherwise the run is in the least advanced state of
    /// any of its workers, and completed once every worker completed.
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut preparing = false;
        let mut awaiting = false;
        let mut running = false;

        for state in states {
            match state {
                Self::Failed => return Self::Failed,
                Self::Preparing => preparing = true,
                Self::AwaitingBarrier => awaiting = true,
                Self::Running => running = true,
                Self::Completed => (),
            }
        }

        if preparing {
            Self::Preparing
        } else if awaiting && !running {
            Self::AwaitingBarrier
        } else if running || awaiting {
            Self::Running
        } else {
            Self::Completed
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::AwaitingBarrier => "awaiting barrier",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
