use async_trait::async_trait;
use pxa_db::SecretBox;
use pxa_db::models::{HypervisorAccount, Server, ServerJob, SshKey};
use pxa_infra::{Credentials, DEFAULT_PORT};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored secret unreadable: {0}")]
    Secret(#[from] pxa_db::SecretError),
}

/// What a job needs to know about the server's owner.
#[derive(Debug, Clone)]
pub struct Owner {
    pub credentials: Credentials,
    /// `username@realm`.
    pub display: String,
    pub public_key: Option<String>,
}

/// The job queue and the records a claimed job is built from.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Move up to `limit` queued jobs to `running` under this worker, oldest first.
    async fn claim(&self, limit: usize) -> sqlx::Result<Vec<ServerJob>>;

    async fn finish(&self, id: Uuid, error: Option<&str>) -> sqlx::Result<()>;

    /// Finish every job this worker left running with `error`, returning them.
    async fn interrupt_running(&self, error: &str) -> sqlx::Result<Vec<ServerJob>>;

    /// `None` when the server is gone or soft-deleted.
    async fn load_server(&self, id: Uuid) -> sqlx::Result<Option<Server>>;

    /// Load the owner's credentials and key, and open the server's sealed
    /// one-time password in place.
    async fn load_owner(&self, server: &mut Server) -> Result<Owner, LoadError>;
}

pub struct PgQueue {
    pool: PgPool,
    worker_id: String,
    secrets: SecretBox,
}

impl PgQueue {
    pub fn new(pool: PgPool, worker_id: impl Into<String>, secrets: SecretBox) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
            secrets,
        }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn claim(&self, limit: usize) -> sqlx::Result<Vec<ServerJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        ServerJob::claim_batch(&self.pool, &self.worker_id, limit).await
    }

    async fn finish(&self, id: Uuid, error: Option<&str>) -> sqlx::Result<()> {
        ServerJob::finish(&self.pool, id, error).await
    }

    async fn interrupt_running(&self, error: &str) -> sqlx::Result<Vec<ServerJob>> {
        ServerJob::interrupt_running(&self.pool, &self.worker_id, error).await
    }

    async fn load_server(&self, id: Uuid) -> sqlx::Result<Option<Server>> {
        Server::find_by_id(&self.pool, id).await
    }

    async fn load_owner(&self, server: &mut Server) -> Result<Owner, LoadError> {
        let account = HypervisorAccount::get_by_id(&self.pool, server.account_id).await?;
        let public_key = match server.key_id {
            Some(id) => SshKey::find_active(&self.pool, id)
                .await?
                .map(|k| k.public_key),
            None => None,
        };

        let password = self.secrets.open(&account.password)?;
        if let Some(sealed) = server.password.take() {
            server.password = Some(self.secrets.open(&sealed)?);
        }

        Ok(Owner {
            display: account.owner(),
            credentials: Credentials {
                port: u16::try_from(account.port).unwrap_or(DEFAULT_PORT),
                hostname: account.hostname,
                username: account.username,
                realm: account.realm,
                password,
                verify_tls: account.verify_tls,
            },
            public_key,
        })
    }
}
