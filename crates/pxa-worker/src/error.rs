use std::time::Duration;

use pxa_infra::types::TaskHandle;

/// Why a workflow stopped. Every variant ends with the server in `error`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("control plane login failed: {0}")]
    Auth(String),

    #[error("{command} rejected: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },

    #[error("task {task} failed with exit status {exit_status:?}")]
    TaskFailed {
        task: TaskHandle,
        exit_status: String,
    },

    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    #[error("invalid server record: {0}")]
    InvalidRecord(String),

    #[error("control plane error: {0}")]
    ControlPlane(#[from] pxa_infra::Error),

    #[error("remote shell error: {0}")]
    Shell(#[from] pxa_infra::ShellError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl JobError {
    /// Login problems of any kind are credential errors.
    pub fn from_connect(e: pxa_infra::Error) -> Self {
        match e {
            pxa_infra::Error::Auth(msg) => Self::Auth(msg),
            other => Self::Auth(other.to_string()),
        }
    }
}
