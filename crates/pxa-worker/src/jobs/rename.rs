use pxa_infra::types::VmSettings;
use tracing::info;

use super::poller::TaskErrors;
use super::{Job, Session};
use crate::error::JobError;

pub async fn run(job: &mut Job, session: &Session<'_>, name: &str) -> Result<(), JobError> {
    let vm = job.vm.clone();

    match job.task.take() {
        Some(task) => session.wait(&vm.node, &task, TaskErrors::Fail).await?,
        None => {
            let settings = VmSettings {
                name: Some(name.to_string()),
                ..Default::default()
            };
            let result = session.control_plane.update_config(&vm, &settings).await?;
            session
                .complete(&vm.node, "config update", result, TaskErrors::Fail)
                .await?
        }
    }

    session.ctx.store.set_name(&mut job.server, name).await?;
    info!(name, "vm renamed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pxa_db::models::ServerStatus;
    use pxa_infra::types::TaskHandle;

    use crate::jobs::Workflow;
    use crate::testing::Fixture;

    use super::*;

    fn rename(name: &str) -> Workflow {
        Workflow::Rename { name: name.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn persists_the_new_name_without_status_change() {
        let fx = Fixture::new();
        let config = fx.control_plane.next_task("config", 2, "OK");

        let job = fx.job_in(ServerStatus::Active, rename("db-primary"), None);
        let id = job.server.id;
        job.run(&fx.ctx).await.unwrap();

        let server = fx.store.record(id).unwrap();
        assert_eq!(server.name, "db-primary");
        assert_eq!(server.status, ServerStatus::Active);
        assert!(fx.journal.statuses().is_empty());
        assert_eq!(fx.control_plane.configs()[0].name.as_deref(), Some("db-primary"));
        assert_eq!(
            fx.journal.remote_calls(),
            [
                "config 101".to_string(),
                format!("status {config}"),
                format!("status {config}"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_a_handed_over_update() {
        let fx = Fixture::new();
        let task = TaskHandle("UPID:pve1:00007000:00008000:65F00030:qmconfig:101:ops@pve:".into());
        fx.control_plane.script_task(&task, 1, "OK");

        let job = fx.job_in(ServerStatus::Active, rename("db-primary"), Some(task.clone()));
        let id = job.server.id;
        job.run(&fx.ctx).await.unwrap();

        assert_eq!(fx.store.record(id).unwrap().name, "db-primary");
        assert_eq!(fx.journal.remote_calls(), [format!("status {task}")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_keeps_the_old_name() {
        let fx = Fixture::new();
        fx.control_plane.next_task("config", 1, "unable to parse value of 'name'");

        let job = fx.job_in(ServerStatus::Active, rename("db primary"), None);
        let id = job.server.id;
        job.run(&fx.ctx).await.unwrap_err();

        let server = fx.store.record(id).unwrap();
        assert_eq!(server.name, "web-1");
        assert_eq!(server.status, ServerStatus::Error);
    }
}
