//! Error taxonomy for the judging core.
//!
//! `ResourceConflict` and `NotFound` are business-level conditions the caller
//! is expected to handle; everything else is infrastructure failure carried
//! through `anyhow` with context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JudgeError {
    /// A sandbox box id is already initialized, likely stale state from a
    /// crashed worker. The caller must release the box and retry.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// Unknown submission, problem, or testcase index. The target record is
    /// left untouched.
    #[error("not found: {0}")]
    NotFound(String),

    /// Infrastructure failure (broker, storage, filesystem). Aborts the
    /// current task without mutating submission state; recovery is broker
    /// redelivery.
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl JudgeError {
    /// Whether the failed operation may succeed if its message is delivered
    /// again. `NotFound` marks a permanently unprocessable message; pushing
    /// it back onto the queue would loop forever.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, JudgeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;

impl From<redis::RedisError> for JudgeError {
    fn from(err: redis::RedisError) -> Self {
        JudgeError::Infra(err.into())
    }
}

impl From<serde_json::Error> for JudgeError {
    fn from(err: serde_json::Error) -> Self {
        JudgeError::Infra(err.into())
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(err: std::io::Error) -> Self {
        JudgeError::Infra(err.into())
    }
}
