use std::time::Duration;

use pxa_infra::ControlPlane;
use pxa_infra::types::{TaskHandle, TaskState};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::JobError;

/// What a non-OK exit status of a finished task means to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrors {
    Fail,
    /// Treat any stopped task as done. Later steps verify the outcome.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub on_task_error: TaskErrors,
}

/// Poll a remote task until it stops.
///
/// A failing status query ends the wait at once. A timeout is reported as
/// [`JobError::Timeout`], never as a task failure.
pub async fn wait_for_task(
    control_plane: &dyn ControlPlane,
    node: &str,
    task: &TaskHandle,
    policy: &PollPolicy,
) -> Result<(), JobError> {
    let started = Instant::now();

    loop {
        match control_plane.task_status(node, task).await? {
            TaskState::Stopped { exit_status } if exit_status == TaskState::EXIT_OK => {
                debug!(%task, "task finished");
                return Ok(());
            }
            TaskState::Stopped { exit_status } => {
                if policy.on_task_error == TaskErrors::Ignore {
                    warn!(%task, exit_status = %exit_status, "task failed, ignoring");
                    return Ok(());
                }
                return Err(JobError::TaskFailed {
                    task: task.clone(),
                    exit_status,
                });
            }
            TaskState::Running => {}
        }

        if let Some(timeout) = policy.timeout
            && started.elapsed() >= timeout
        {
            return Err(JobError::Timeout {
                waiting_for: format!("task {task}"),
                after: timeout,
            });
        }

        tokio::time::sleep(policy.interval).await;
    }
}
