pub mod create;
pub mod delete;
pub mod post_boot;
pub mod poller;
pub mod reboot;
pub mod rename;

use std::fmt;
use std::sync::Arc;

use pxa_db::models::Server;
use pxa_infra::types::{CommandResult, TaskHandle, VmRef};
use pxa_infra::{Connector, ControlPlane, Credentials, RemoteShell};
use tracing::{Instrument, error, info, info_span};

use crate::config::JobSettings;
use crate::error::JobError;
use crate::store::LifecycleStore;
use poller::{PollPolicy, TaskErrors};

/// The four lifecycle operations, interpreted by [`Job::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workflow {
    Create,
    Delete,
    Reboot,
    Rename { name: String },
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Reboot => "reboot",
            Self::Rename { .. } => "rename",
        })
    }
}

/// Collaborators shared by every job of one worker process.
pub struct JobContext {
    pub connector: Arc<dyn Connector>,
    pub shell: Arc<dyn RemoteShell>,
    pub store: Arc<dyn LifecycleStore>,
    pub settings: JobSettings,
}

/// One workflow run against one server.
pub struct Job {
    pub server: Server,
    pub vm: VmRef,
    pub credentials: Credentials,
    /// `username@realm` of the owning account.
    pub owner: String,
    pub public_key: Option<String>,
    /// A remote task the request handler already started for this job.
    pub task: Option<TaskHandle>,
    pub workflow: Workflow,
}

impl Job {
    /// Drive the workflow to completion.
    ///
    /// Every failure ends here: it is logged and the server is marked
    /// `error` before the error is handed back to the queue.
    pub async fn run(mut self, ctx: &JobContext) -> Result<(), JobError> {
        let span = info_span!(
            "job",
            workflow = %self.workflow,
            server_id = %self.server.id,
            vmid = self.vm.vmid,
        );

        async move {
            info!(status = %self.server.status, "workflow started");
            match self.execute(ctx).await {
                Ok(()) => {
                    info!(status = %self.server.status, "workflow finished");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "workflow failed");
                    ctx.store.mark_error(&mut self.server).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        let control_plane = ctx
            .connector
            .connect(&self.credentials)
            .await
            .map_err(JobError::from_connect)?;
        let session = Session { control_plane, ctx };

        match self.workflow.clone() {
            Workflow::Create => create::run(self, &session).await,
            Workflow::Delete => delete::run(self, &session).await,
            Workflow::Reboot => reboot::run(self, &session).await,
            Workflow::Rename { name } => rename::run(self, &session, &name).await,
        }
    }
}

/// An authenticated control-plane session, owned by a single job.
pub struct Session<'a> {
    pub control_plane: Arc<dyn ControlPlane>,
    pub ctx: &'a JobContext,
}

impl Session<'_> {
    /// Settle the outcome of a command: reject, accept immediate data, or
    /// poll the task it started.
    pub async fn complete(
        &self,
        node: &str,
        command: &'static str,
        result: CommandResult,
        on_task_error: TaskErrors,
    ) -> Result<(), JobError> {
        match result {
            CommandResult::Rejected(message) => Err(JobError::Rejected { command, message }),
            CommandResult::Data(_) => Ok(()),
            CommandResult::Task(task) => {
                info!(%task, command, "waiting for task");
                self.wait(node, &task, on_task_error).await
            }
        }
    }

    pub async fn wait(
        &self,
        node: &str,
        task: &TaskHandle,
        on_task_error: TaskErrors,
    ) -> Result<(), JobError> {
        let settings = &self.ctx.settings;
        let policy = PollPolicy {
            interval: settings.task_poll_interval,
            timeout: settings.task_timeout,
            on_task_error,
        };
        poller::wait_for_task(&*self.control_plane, node, task, &policy).await
    }
}
