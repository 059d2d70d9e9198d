use pxa_db::models::ServerStatus;
use pxa_infra::types::PowerAction;
use tracing::{info, warn};

use super::poller::TaskErrors;
use super::{Job, Session, post_boot};
use crate::error::JobError;

/// Restart the VM and run post-boot again.
///
/// A healthy VM gets a graceful shutdown and a start. A VM in `error` is
/// reset outright, since a shutdown would most likely hang on whatever broke
/// it.
pub async fn run(job: &mut Job, session: &Session<'_>) -> Result<(), JobError> {
    let store = &session.ctx.store;
    let vm = job.vm.clone();
    let was_error = job.server.status == ServerStatus::Error;
    let handed_over = job.task.take();

    if job.server.status != ServerStatus::Rebooting {
        store
            .set_status(&mut job.server, ServerStatus::Rebooting)
            .await?;
    }

    if was_error {
        if let Some(task) = handed_over {
            warn!(%task, "ignoring shutdown task of a vm in error");
        }
        info!("hard reset");
        let result = session.control_plane.power(&vm, PowerAction::Reset).await?;
        session
            .complete(&vm.node, "reset", result, TaskErrors::Ignore)
            .await?;
    } else {
        match handed_over {
            Some(task) => session.wait(&vm.node, &task, TaskErrors::Fail).await?,
            None => {
                let result = session
                    .control_plane
                    .power(&vm, PowerAction::Shutdown)
                    .await?;
                session
                    .complete(&vm.node, "shutdown", result, TaskErrors::Fail)
                    .await?
            }
        }

        let result = session.control_plane.power(&vm, PowerAction::Start).await?;
        session
            .complete(&vm.node, "start", result, TaskErrors::Ignore)
            .await?;
    }

    post_boot::configure(job, session).await
}
