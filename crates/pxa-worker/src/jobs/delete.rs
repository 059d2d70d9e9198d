use pxa_db::models::ServerStatus;
use pxa_infra::types::{PowerAction, VmSettings};
use tracing::info;

use super::poller::TaskErrors;
use super::{Job, Session};
use crate::error::JobError;

/// Stop, unprotect and destroy the VM, then drop its record.
pub async fn run(job: &mut Job, session: &Session<'_>) -> Result<(), JobError> {
    let store = &session.ctx.store;
    let vm = job.vm.clone();

    if job.server.status != ServerStatus::Destroying {
        store
            .set_status(&mut job.server, ServerStatus::Destroying)
            .await?;
    }

    // The VM may already be stopped, so the stop outcome does not matter.
    match job.task.take() {
        Some(task) => session.wait(&vm.node, &task, TaskErrors::Ignore).await?,
        None => {
            let result = session.control_plane.power(&vm, PowerAction::Stop).await?;
            session
                .complete(&vm.node, "stop", result, TaskErrors::Ignore)
                .await?
        }
    }

    let unprotect = VmSettings {
        protection: Some(false),
        ..Default::default()
    };
    let result = session.control_plane.update_config(&vm, &unprotect).await?;
    session
        .complete(&vm.node, "config update", result, TaskErrors::Fail)
        .await?;

    let result = session.control_plane.delete_vm(&vm).await?;
    session
        .complete(&vm.node, "delete", result, TaskErrors::Fail)
        .await?;
    info!(%vm, "vm destroyed");

    store.remove(&job.server).await?;
    Ok(())
}
