use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::error::{AcquireError, TaskFailure};
use crate::extract::rules::{ExtractionRules, ReadyCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(2u32.pow(exp))
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// What the coordinator does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Retry { delay: Duration },
    Fail,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} a task that is {from}")]
    Illegal { from: TaskStatus, action: &'static str },
    #[error("attempt budget of {0} already spent")]
    BudgetSpent(u32),
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub locator: String,
    pub status: TaskStatus,
    pub attempts: u32,
}

/// One acquisition request and its progress.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub locator: String,
    pub rules: ExtractionRules,
    pub ready: ReadyCondition,
    policy: RetryPolicy,
    status: TaskStatus,
    attempts: u32,
    retry_pending: bool,
    last_error: Option<AcquireError>,
}

impl Task {
    pub fn new(
        locator: impl Into<String>,
        rules: ExtractionRules,
        ready: ReadyCondition,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            locator: locator.into(),
            rules,
            ready,
            policy,
            status: TaskStatus::Pending,
            attempts: 0,
            retry_pending: false,
            last_error: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&AcquireError> {
        self.last_error.as_ref()
    }

    /// Only absolute http(s) URLs are acceptable targets.
    pub fn target(&self) -> Result<Url, AcquireError> {
        let url = Url::parse(&self.locator)
            .map_err(|e| AcquireError::InvalidTarget(format!("{}: {}", self.locator, e)))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(AcquireError::InvalidTarget(format!(
                "{}: only http(s) pages can be acquired",
                self.locator
            ))),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            locator: self.locator.clone(),
            status: self.status,
            attempts: self.attempts,
        }
    }

    // ── Transitions ──

    /// pending → running, or running → running after a retry decision.
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        match self.status {
            TaskStatus::Pending => {}
            TaskStatus::Running if self.retry_pending => {}
            from => return Err(TransitionError::Illegal { from, action: "start" }),
        }
        if self.attempts >= self.policy.max_attempts {
            return Err(TransitionError::BudgetSpent(self.policy.max_attempts));
        }
        self.attempts += 1;
        self.retry_pending = false;
        self.status = TaskStatus::Running;
        Ok(self.attempts)
    }

    pub fn record_failure(&mut self, error: AcquireError) -> Result<Next, TransitionError> {
        self.ensure_attempt_in_progress("fail")?;
        let retry = error.kind().is_retryable() && self.attempts < self.policy.max_attempts;
        self.last_error = Some(error);
        if retry {
            self.retry_pending = true;
            Ok(Next::Retry {
                delay: self.policy.backoff(self.attempts),
            })
        } else {
            self.status = TaskStatus::Failed;
            Ok(Next::Fail)
        }
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.ensure_attempt_in_progress("complete")?;
        self.status = TaskStatus::Succeeded;
        Ok(())
    }

    /// Fail without consuming an attempt (acquisition failure, overall timeout).
    pub fn abort(&mut self, error: AcquireError) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Illegal {
                from: self.status,
                action: "abort",
            });
        }
        self.retry_pending = false;
        self.last_error = Some(error);
        self.status = TaskStatus::Failed;
        Ok(())
    }

    /// Report for a failed task; `None` unless the task is in the failed state.
    pub fn failure(&self) -> Option<TaskFailure> {
        if self.status != TaskStatus::Failed {
            return None;
        }
        let error = self.last_error.clone()?;
        Some(TaskFailure {
            task_id: self.id,
            locator: self.locator.clone(),
            retries_exhausted: error.kind().is_retryable()
                && self.attempts >= self.policy.max_attempts,
            error,
            attempts: self.attempts,
            last_state: self.status,
        })
    }

    fn ensure_attempt_in_progress(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.status == TaskStatus::Running && !self.retry_pending {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                from: self.status,
                action,
            })
        }
    }
}
