use pxa_db::models::ServerStatus;
use pxa_infra::types::{PowerAction, VmSettings};
use tracing::info;

use super::poller::TaskErrors;
use super::{Job, Session, post_boot};
use crate::error::JobError;

fn description(job: &Job) -> String {
    format!(
        "Created by Proxmox Adapter\n\nSize: {}\nOwner: {}",
        job.server.size_code, job.owner
    )
}

fn sizing(job: &Job) -> Result<(u32, u32), JobError> {
    let cores = u32::try_from(job.server.cores)
        .map_err(|_| JobError::InvalidRecord(format!("cores {}", job.server.cores)))?;
    let memory_mb = u32::try_from(job.server.memory_mb)
        .map_err(|_| JobError::InvalidRecord(format!("memory {} MB", job.server.memory_mb)))?;
    Ok((cores, memory_mb))
}

/// Finish a VM whose clone was started by the request handler: configure,
/// start, then post-boot.
pub async fn run(job: &mut Job, session: &Session<'_>) -> Result<(), JobError> {
    let store = &session.ctx.store;
    let vm = job.vm.clone();
    let (cores, memory_mb) = sizing(job)?;

    if let Some(task) = job.task.take() {
        session.wait(&vm.node, &task, TaskErrors::Fail).await?;
        info!(%task, "clone finished");
    }
    store.set_status(&mut job.server, ServerStatus::Creating).await?;

    let settings = VmSettings {
        name: Some(job.server.name.clone()),
        description: Some(description(job)),
        cores: Some(cores),
        memory_mb: Some(memory_mb),
        start_on_boot: Some(true),
        allow_reboot: Some(true),
        protection: Some(true),
    };
    let result = session.control_plane.update_config(&vm, &settings).await?;
    session
        .complete(&vm.node, "config update", result, TaskErrors::Fail)
        .await?;

    let result = session.control_plane.power(&vm, PowerAction::Start).await?;
    session
        .complete(&vm.node, "start", result, TaskErrors::Ignore)
        .await?;

    post_boot::configure(job, session).await
}
