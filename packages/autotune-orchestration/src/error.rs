use crate::builder::BuildResult;
use crate::callbacks::CallbackKind;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuilderError>;

/// Prefix of every timed-out task's error message
pub const TIMEOUT_PREFIX: &str = "LocalBuilder: Timeout";

/// Prefix of every failed (raised / crashed) task's error message
pub const EXCEPTION_PREFIX: &str = "LocalBuilder: An exception occurred";

/// Builder-level errors
///
/// Only configuration and startup problems surface here. Per-task failures
/// never do; they are reported through `BuildResult::error_msg`.
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unresolved {kind} function: '{name}'")]
    UnresolvedCallback { kind: CallbackKind, name: String },

    #[error("Worker initialization failed: {0}")]
    WorkerInit(String),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Ir(#[from] autotune_ir::IrError),
}

impl BuilderError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn spawn<E: std::fmt::Display>(e: E) -> Self {
        Self::Spawn(e.to_string())
    }

    pub fn protocol<E: std::fmt::Display>(e: E) -> Self {
        Self::Protocol(e.to_string())
    }

    /// Raised synchronously at construction, before any task is dispatched
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BuilderError::Config(_) | BuilderError::UnresolvedCallback { .. }
        )
    }
}

/// Error message for a task killed after exceeding its time budget
pub fn timeout_message(timeout: Duration) -> String {
    format!(
        "{}, killed after {} seconds",
        TIMEOUT_PREFIX,
        timeout.as_secs_f64()
    )
}

/// Error message for a task whose build or export raised
pub fn exception_message(detail: impl std::fmt::Display) -> String {
    format!("{}\n{}", EXCEPTION_PREFIX, detail)
}

/// Failure class of a build result, recovered from its message prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// build or export raised, or the worker died mid-task
    Exception,
    /// the task exceeded its time budget and its worker was recycled
    Timeout,
    /// message produced by something other than the local builder
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Exception => "exception",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }

    pub fn classify(error_msg: &str) -> Self {
        if error_msg.starts_with(TIMEOUT_PREFIX) {
            FailureKind::Timeout
        } else if error_msg.starts_with(EXCEPTION_PREFIX) {
            FailureKind::Exception
        } else {
            FailureKind::Other
        }
    }

    /// `None` for successful results
    pub fn of(result: &BuildResult) -> Option<Self> {
        result.error_msg().map(Self::classify)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
