use std::sync::Arc;
use std::time::Duration;

use pxa_db::models::{JobKind, ServerJob};
use pxa_infra::types::{TaskHandle, VmRef};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::jobs::{Job, JobContext, Workflow};
use crate::queue::JobQueue;

/// Recorded on jobs a previous run of this worker left behind.
pub const INTERRUPTED: &str = "interrupted: worker stopped before the job finished";

/// Settle jobs a previous run of this worker never finished.
///
/// Each one is finished with [`INTERRUPTED`] and its server is marked
/// `error`; nothing is retried. Must run before the dispatcher claims.
pub async fn recover_interrupted(queue: &dyn JobQueue, ctx: &JobContext) -> sqlx::Result<usize> {
    let interrupted = queue.interrupt_running(INTERRUPTED).await?;

    for job in &interrupted {
        tracing::warn!(
            job_id = %job.id,
            kind = %job.kind,
            server_id = %job.server_id,
            "job interrupted by a restart"
        );
        match queue.load_server(job.server_id).await {
            Ok(Some(mut server)) => ctx.store.mark_error(&mut server).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(server_id = %job.server_id, error = %e, "failed to load interrupted server");
            }
        }
    }

    Ok(interrupted.len())
}

/// Spawn the queue dispatcher.
///
/// Every tick claims as many queued jobs as there are free worker slots and
/// runs each on its own task. Once `shutdown` flips, no more jobs are claimed
/// and the returned handle resolves after the running ones finish.
pub fn spawn_dispatcher(
    queue: Arc<dyn JobQueue>,
    ctx: Arc<JobContext>,
    concurrency: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut running = JoinSet::new();
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            while running.try_join_next().is_some() {}

            if let Err(e) = dispatch_ready(&queue, &ctx, &slots, &mut running).await {
                tracing::error!(error = %e, "claiming queued jobs failed");
            }
        }

        tracing::info!(in_flight = running.len(), "dispatcher stopping");
        while running.join_next().await.is_some() {}
    })
}

async fn dispatch_ready(
    queue: &Arc<dyn JobQueue>,
    ctx: &Arc<JobContext>,
    slots: &Arc<Semaphore>,
    running: &mut JoinSet<()>,
) -> Result<(), sqlx::Error> {
    let free = slots.available_permits();
    if free == 0 {
        return Ok(());
    }

    for queued in queue.claim(free).await? {
        // Only this loop takes permits, so one is free for every claimed job.
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        tracing::info!(
            job_id = %queued.id,
            kind = %queued.kind,
            server_id = %queued.server_id,
            "job claimed"
        );

        let queue = queue.clone();
        let ctx = ctx.clone();
        running.spawn(async move {
            let _permit = permit;
            let outcome = execute(&*queue, &ctx, &queued).await;
            if let Err(e) = queue.finish(queued.id, outcome.err().as_deref()).await {
                tracing::error!(job_id = %queued.id, error = %e, "failed to record job outcome");
            }
        });
    }
    Ok(())
}

fn workflow(queued: &ServerJob) -> Result<Workflow, String> {
    Ok(match queued.kind {
        JobKind::Create => Workflow::Create,
        JobKind::Delete => Workflow::Delete,
        JobKind::Reboot => Workflow::Reboot,
        JobKind::Rename => match &queued.new_name {
            Some(name) => Workflow::Rename { name: name.clone() },
            None => return Err("rename job has no new name".into()),
        },
    })
}

/// Run one claimed job. The error string is recorded on the queue row.
async fn execute(queue: &dyn JobQueue, ctx: &JobContext, queued: &ServerJob) -> Result<(), String> {
    let workflow = workflow(queued)?;

    let mut server = match queue.load_server(queued.server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return Err(format!("server {} not found", queued.server_id)),
        Err(e) => return Err(format!("loading server: {e}")),
    };

    let owner = match queue.load_owner(&mut server).await {
        Ok(owner) => owner,
        Err(e) => {
            tracing::error!(server_id = %server.id, error = %e, "failed to load server owner");
            ctx.store.mark_error(&mut server).await;
            return Err(format!("loading owner: {e}"));
        }
    };

    let Ok(vmid) = u32::try_from(server.vmid) else {
        ctx.store.mark_error(&mut server).await;
        return Err(format!("invalid vmid {}", server.vmid));
    };

    let job = Job {
        vm: VmRef {
            node: server.node.clone(),
            vmid,
        },
        server,
        credentials: owner.credentials,
        owner: owner.display,
        public_key: owner.public_key,
        task: queued.task.clone().map(TaskHandle),
        workflow,
    };

    job.run(ctx).await.map_err(|e| e.to_string())
}
