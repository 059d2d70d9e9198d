use async_trait::async_trait;
use pxa_db::models::{Server, ServerStatus};
use sqlx::PgPool;
use tracing::{error, info};

/// The only way a job changes a server record.
///
/// Each call persists first and then updates the caller's copy, so the copy
/// never runs ahead of the database.
#[async_trait]
pub trait LifecycleStore: Send + Sync + 'static {
    async fn set_status(&self, server: &mut Server, status: ServerStatus) -> sqlx::Result<()>;

    /// Unconditionally move to `error`. Never fails; a write problem is logged.
    async fn mark_error(&self, server: &mut Server);

    async fn set_name(&self, server: &mut Server, name: &str) -> sqlx::Result<()>;

    async fn set_addresses(
        &self,
        server: &mut Server,
        external_ip: &str,
        internal_ip: &str,
    ) -> sqlx::Result<()>;

    async fn clear_password(&self, server: &mut Server) -> sqlx::Result<()>;

    /// Hard delete.
    async fn remove(&self, server: &Server) -> sqlx::Result<()>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LifecycleStore for PgStore {
    async fn set_status(&self, server: &mut Server, status: ServerStatus) -> sqlx::Result<()> {
        Server::set_status(&self.pool, server.id, status).await?;
        info!(server_id = %server.id, from = %server.status, to = %status, "server status changed");
        server.status = status;
        Ok(())
    }

    async fn mark_error(&self, server: &mut Server) {
        if let Err(e) = Server::set_status(&self.pool, server.id, ServerStatus::Error).await {
            error!(server_id = %server.id, error = %e, "failed to persist error status");
        } else {
            info!(server_id = %server.id, from = %server.status, "server marked as error");
        }
        server.status = ServerStatus::Error;
    }

    async fn set_name(&self, server: &mut Server, name: &str) -> sqlx::Result<()> {
        Server::set_name(&self.pool, server.id, name).await?;
        server.name = name.to_string();
        Ok(())
    }

    async fn set_addresses(
        &self,
        server: &mut Server,
        external_ip: &str,
        internal_ip: &str,
    ) -> sqlx::Result<()> {
        Server::set_addresses(&self.pool, server.id, external_ip, internal_ip).await?;
        server.external_ip = Some(external_ip.to_string());
        server.internal_ip = Some(internal_ip.to_string());
        Ok(())
    }

    async fn clear_password(&self, server: &mut Server) -> sqlx::Result<()> {
        Server::clear_password(&self.pool, server.id).await?;
        server.password = None;
        Ok(())
    }

    async fn remove(&self, server: &Server) -> sqlx::Result<()> {
        Server::delete(&self.pool, server.id).await?;
        info!(server_id = %server.id, "server record removed");
        Ok(())
    }
}
