pub mod pve;
pub mod ssh;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use types::{
    CommandResult, NetworkInterface, PowerAction, ShellTarget, TaskHandle, TaskState, VmRef,
    VmSettings,
};

pub use pve_api::{Credentials, DEFAULT_PORT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pve api error: {0}")]
    Pve(#[from] pve_api::Error),

    #[error("control plane login failed: {0}")]
    Auth(String),

    #[error("{endpoint} rejected: {message}")]
    Rejected {
        endpoint: &'static str,
        message: String,
    },

    #[error("unexpected {endpoint} payload: {message}")]
    Payload {
        endpoint: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a remote shell session.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("unable to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("authentication as {username} on {host} was rejected")]
    AuthRejected { host: String, username: String },

    /// Commands may carry secrets, so only their position is reported.
    #[error("command #{index} exited with status {exit_status}: {stderr}")]
    CommandFailed {
        index: usize,
        exit_status: u32,
        stderr: String,
    },

    #[error("ssh protocol error: {0}")]
    Protocol(String),
}

impl ShellError {
    /// Could not get a session at all: the host refused the connection or
    /// the credentials. Both look the same to a caller that only knows the
    /// credentials it tried.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::AuthRejected { .. })
    }
}

/// The hypervisor control plane, as seen by an orchestration job.
///
/// Commands return a [`CommandResult`]; `Err` means the call itself failed
/// (transport, or an unexpected payload).
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Current state of a remote task. A rejected status query is an `Err`.
    async fn task_status(&self, node: &str, task: &TaskHandle) -> Result<TaskState>;

    async fn update_config(&self, vm: &VmRef, settings: &VmSettings) -> Result<CommandResult>;

    async fn power(&self, vm: &VmRef, action: PowerAction) -> Result<CommandResult>;

    async fn delete_vm(&self, vm: &VmRef) -> Result<CommandResult>;

    /// Ask the guest agent for the VM's interfaces. Errors while the guest is still booting.
    async fn network_interfaces(&self, vm: &VmRef) -> Result<Vec<NetworkInterface>>;
}

/// Builds an authenticated [`ControlPlane`] for one owner's credentials.
///
/// Called once per job; sessions are never shared between jobs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ControlPlane>>;
}

/// Runs commands on a VM over a remote shell.
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// Run `commands` in order over one session, stopping at the first failure.
    async fn run(
        &self,
        target: &ShellTarget,
        commands: &[String],
    ) -> std::result::Result<(), ShellError>;
}
