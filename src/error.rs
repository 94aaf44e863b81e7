use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskStatus;

/// Failures raised while acquiring content for a single attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AcquireError {
    #[error("no browser session available: {0}")]
    ResourceExhausted(String),
    #[error("page not ready within {timeout:?} (waiting for {waiting_for})")]
    NavigationTimeout { timeout: Duration, waiting_for: String },
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("expected content missing: {0}")]
    ExtractionMismatch(String),
    #[error("browser session died: {0}")]
    SessionDied(String),
    #[error("invalid target {0}")]
    InvalidTarget(String),
    #[error("task exceeded overall timeout of {0:?}")]
    TaskTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceExhausted,
    NavigationTimeout,
    NavigationFailed,
    ExtractionMismatch,
    SessionDied,
    InvalidTarget,
    TaskTimeout,
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquireError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AcquireError::NavigationTimeout { .. } => ErrorKind::NavigationTimeout,
            AcquireError::NavigationFailed(_) => ErrorKind::NavigationFailed,
            AcquireError::ExtractionMismatch(_) => ErrorKind::ExtractionMismatch,
            AcquireError::SessionDied(_) => ErrorKind::SessionDied,
            AcquireError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            AcquireError::TaskTimeout(_) => ErrorKind::TaskTimeout,
        }
    }
}

impl ErrorKind {
    /// Transport-level failures that another attempt may fix.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NavigationTimeout | ErrorKind::NavigationFailed | ErrorKind::SessionDied
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::NavigationFailed => "navigation_failed",
            ErrorKind::ExtractionMismatch => "extraction_mismatch",
            ErrorKind::SessionDied => "session_died",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::TaskTimeout => "task_timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a task, as reported to the front end.
#[derive(Debug, Clone, Error)]
#[error("task {task_id} for {locator} failed after {attempts} attempt(s) in state {last_state}: {error}")]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub locator: String,
    pub error: AcquireError,
    pub attempts: u32,
    pub last_state: TaskStatus,
    /// Set when a retryable error used up the whole attempt budget.
    pub retries_exhausted: bool,
}

impl TaskFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// The page loaded but did not have the expected shape.
    pub fn is_content_error(&self) -> bool {
        self.kind() == ErrorKind::ExtractionMismatch
    }

    /// Infrastructure trouble: browser, network or capacity.
    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
            || matches!(self.kind(), ErrorKind::ResourceExhausted | ErrorKind::TaskTimeout)
    }
}
