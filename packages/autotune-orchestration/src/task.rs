use crate::builder::BuildResult;
use crate::error::{timeout_message, BuilderError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Task state enum
///
/// `Succeeded`, `Failed` and `TimedOut` are terminal. There is no retry edge;
/// a caller that wants a retry submits a new input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
        artifact_path: PathBuf,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
    },
    TimedOut {
        started_at: DateTime<Utc>,
        killed_at: DateTime<Utc>,
        timeout_ms: u64,
    },
}

impl TaskState {
    pub fn state_name(&self) -> &'static str {
        match self {
            TaskState::Queued { .. } => "queued",
            TaskState::Running { .. } => "running",
            TaskState::Succeeded { .. } => "succeeded",
            TaskState::Failed { .. } => "failed",
            TaskState::TimedOut { .. } => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded { .. } | TaskState::Failed { .. } | TaskState::TimedOut { .. }
        )
    }

    /// Result reported to the caller; `None` until the task is terminal
    pub fn to_result(&self) -> Option<BuildResult> {
        match self {
            TaskState::Succeeded { artifact_path, .. } => {
                Some(BuildResult::success(artifact_path.clone()))
            }
            TaskState::Failed { error, .. } => Some(BuildResult::failure(error.clone())),
            TaskState::TimedOut { timeout_ms, .. } => Some(BuildResult::failure(timeout_message(
                Duration::from_millis(*timeout_ms),
            ))),
            _ => None,
        }
    }
}

/// Task state machine for transitions
pub struct TaskStateMachine {
    index: usize,
    state: TaskState,
}

impl TaskStateMachine {
    /// New task at position `index` of its batch, in `Queued`
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: TaskState::Queued {
                queued_at: Utc::now(),
            },
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    fn invalid(&self, to: &str) -> BuilderError {
        BuilderError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: QUEUED → RUNNING
    pub fn start(&mut self, worker_id: impl Into<String>) -> Result<()> {
        match &self.state {
            TaskState::Queued { .. } => {
                self.state = TaskState::Running {
                    started_at: Utc::now(),
                    worker_id: worker_id.into(),
                };
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Transition: RUNNING → SUCCEEDED
    pub fn succeed(&mut self, artifact_path: PathBuf) -> Result<()> {
        match &self.state {
            TaskState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.state = TaskState::Succeeded {
                    started_at: *started_at,
                    finished_at: now,
                    duration_ms,
                    artifact_path,
                };
                Ok(())
            }
            _ => Err(self.invalid("succeeded")),
        }
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        match &self.state {
            TaskState::Running { started_at, .. } => {
                self.state = TaskState::Failed {
                    started_at: *started_at,
                    failed_at: Utc::now(),
                    error: error.into(),
                };
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Transition: RUNNING → TIMED_OUT
    pub fn time_out(&mut self, timeout: Duration) -> Result<()> {
        match &self.state {
            TaskState::Running { started_at, .. } => {
                self.state = TaskState::TimedOut {
                    started_at: *started_at,
                    killed_at: Utc::now(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                Ok(())
            }
            _ => Err(self.invalid("timed_out")),
        }
    }

    /// Consume a terminal task into its result
    pub fn into_result(self) -> Result<BuildResult> {
        match self.state.to_result() {
            Some(result) => Ok(result),
            None => Err(BuilderError::InvalidStateTransition {
                from: self.state.state_name().to_string(),
                to: "result".to_string(),
            }),
        }
    }
}
