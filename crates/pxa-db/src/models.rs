use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::crypto::{SecretBox, SecretError};

/// Failure of an insert that seals a secret first.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

// ── HypervisorAccount ───────────────────────────────────────────────

/// Control-plane credentials of one owner. Every job logs in with these.
///
/// `password` is sealed; see [`SecretBox::open`].
#[derive(Clone, FromRow, Serialize, Deserialize)]
pub struct HypervisorAccount {
    pub id: Uuid,
    pub hostname: String,
    pub port: i32,
    pub username: String,
    pub realm: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub verify_tls: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for HypervisorAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorAccount")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

pub struct NewHypervisorAccount<'a> {
    pub hostname: &'a str,
    pub port: i32,
    pub username: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
    pub verify_tls: bool,
}

impl HypervisorAccount {
    pub async fn insert(
        pool: &PgPool,
        secrets: &SecretBox,
        account: &NewHypervisorAccount<'_>,
    ) -> Result<Self, InsertError> {
        let password = secrets.seal(account.password)?;
        let account: Self = sqlx::query_as(
            r#"INSERT INTO hypervisor_accounts (hostname, port, username, realm, password, verify_tls)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING *"#,
        )
        .bind(account.hostname)
        .bind(account.port)
        .bind(account.username)
        .bind(account.realm)
        .bind(&password)
        .bind(account.verify_tls)
        .fetch_one(pool)
        .await?;
        Ok(account)
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM hypervisor_accounts WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// `username@realm`, as shown in VM descriptions.
    pub fn owner(&self) -> String {
        format!("{}@{}", self.username, self.realm)
    }
}

// ── SshKey ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SshKey {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SshKey {
    pub async fn insert(
        pool: &PgPool,
        account_id: Uuid,
        name: &str,
        public_key: &str,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            "INSERT INTO ssh_keys (account_id, name, public_key) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(account_id)
        .bind(name)
        .bind(public_key)
        .fetch_one(pool)
        .await
    }

    /// A soft-deleted key counts as no key.
    pub async fn find_active(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM ssh_keys WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "server_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Creating,
    Active,
    Rebooting,
    Destroying,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Rebooting => "rebooting",
            Self::Destroying => "destroying",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VM ordered through the adapter.
#[derive(Clone, FromRow, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub unique_id: String,
    pub account_id: Uuid,
    pub name: String,
    pub node: String,
    pub storage: String,
    pub vmid: i32,
    pub size_code: String,
    pub cores: i32,
    pub memory_mb: i32,
    pub key_id: Option<Uuid>,
    /// Sealed one-time password for the default guest account. Cleared once a key is installed.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub status: ServerStatus,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("unique_id", &self.unique_id)
            .field("name", &self.name)
            .field("node", &self.node)
            .field("vmid", &self.vmid)
            .field("status", &self.status)
            .field("external_ip", &self.external_ip)
            .field("internal_ip", &self.internal_ip)
            .finish_non_exhaustive()
    }
}

pub struct NewServer<'a> {
    pub unique_id: &'a str,
    pub account_id: Uuid,
    pub name: &'a str,
    pub node: &'a str,
    pub storage: &'a str,
    pub vmid: i32,
    pub size_code: &'a str,
    pub cores: i32,
    pub memory_mb: i32,
    pub key_id: Option<Uuid>,
}

impl Server {
    const PASSWORD_LEN: usize = 25;

    pub fn generate_password() -> String {
        use rand::Rng;
        rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(Self::PASSWORD_LEN)
            .map(char::from)
            .collect()
    }

    /// Record an accepted order in `pending`, with a fresh sealed one-time password.
    pub async fn insert(
        pool: &PgPool,
        secrets: &SecretBox,
        server: &NewServer<'_>,
    ) -> Result<Self, InsertError> {
        let password = secrets.seal(&Self::generate_password())?;
        let server: Self = sqlx::query_as(
            r#"INSERT INTO servers (unique_id, account_id, name, node, storage, vmid, size_code, cores, memory_mb, key_id, password)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING *"#,
        )
        .bind(server.unique_id)
        .bind(server.account_id)
        .bind(server.name)
        .bind(server.node)
        .bind(server.storage)
        .bind(server.vmid)
        .bind(server.size_code)
        .bind(server.cores)
        .bind(server.memory_mb)
        .bind(server.key_id)
        .bind(&password)
        .fetch_one(pool)
        .await?;
        Ok(server)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM servers WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn get_by_unique_id(pool: &PgPool, unique_id: &str) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM servers WHERE unique_id = $1 AND deleted_at IS NULL")
            .bind(unique_id)
            .fetch_one(pool)
            .await
    }

    pub async fn set_status(pool: &PgPool, id: Uuid, status: ServerStatus) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_name(pool: &PgPool, id: Uuid, name: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_addresses(
        pool: &PgPool,
        id: Uuid,
        external_ip: &str,
        internal_ip: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET external_ip = $1, internal_ip = $2 WHERE id = $3")
            .bind(external_ip)
            .bind(internal_ip)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn clear_password(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET password = NULL WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Mark deleted but keep the row.
    pub async fn soft_delete(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE servers SET deleted_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove the row. Only once the remote VM is confirmed gone.
    pub async fn delete(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ── ServerJob ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Create,
    Delete,
    Reboot,
    Rename,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Reboot => "reboot",
            Self::Rename => "rename",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

/// A queued lifecycle workflow for one server.
///
/// `task` is the handle of a remote task the request handler already started,
/// if any. It is dropped when the job finishes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ServerJob {
    pub id: Uuid,
    pub server_id: Uuid,
    pub kind: JobKind,
    pub task: Option<String>,
    pub new_name: Option<String>,
    pub state: JobState,
    /// Worker that moved the job to `running`.
    pub claimed_by: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ServerJob {
    pub async fn enqueue(
        pool: &PgPool,
        server_id: Uuid,
        kind: JobKind,
        task: Option<&str>,
        new_name: Option<&str>,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO server_jobs (server_id, kind, task, new_name)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(server_id)
        .bind(kind)
        .bind(task)
        .bind(new_name)
        .fetch_one(pool)
        .await
    }

    /// Atomically move up to `limit` queued jobs to `running`, oldest first,
    /// recording `worker_id` as their owner.
    ///
    /// Safe with several workers on one database.
    pub async fn claim_batch(pool: &PgPool, worker_id: &str, limit: i64) -> sqlx::Result<Vec<Self>> {
        let mut jobs: Vec<Self> = sqlx::query_as(
            r#"UPDATE server_jobs
               SET state = 'running', started_at = now(), claimed_by = $2
               WHERE id IN (
                   SELECT id FROM server_jobs
                   WHERE state = 'queued'
                   ORDER BY created_at
                   LIMIT $1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(limit)
        .bind(worker_id)
        .fetch_all(pool)
        .await?;

        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Errors with `RowNotFound` when no job has this id.
    pub async fn finish(pool: &PgPool, id: Uuid, error: Option<&str>) -> sqlx::Result<()> {
        let result = sqlx::query(
            r#"UPDATE server_jobs
               SET state = 'finished', finished_at = now(), error = $1, task = NULL
               WHERE id = $2"#,
        )
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    /// Finish every job `worker_id` left in `running` with `error`.
    ///
    /// Run at startup, before claiming: a job still running under this id
    /// belonged to a previous process that never finished it.
    pub async fn interrupt_running(
        pool: &PgPool,
        worker_id: &str,
        error: &str,
    ) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            r#"UPDATE server_jobs
               SET state = 'finished', finished_at = now(), error = $1, task = NULL
               WHERE state = 'running' AND claimed_by = $2
               RETURNING *"#,
        )
        .bind(error)
        .bind(worker_id)
        .fetch_all(pool)
        .await
    }
}
