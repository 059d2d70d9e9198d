use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque control-plane identifier for an in-flight remote operation (a PVE UPID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a VM lives on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub node: String,
    pub vmid: u32,
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

/// Result of issuing a command. Never carries both data and an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The command started a remote task that has to be polled.
    Task(TaskHandle),
    /// The command completed synchronously.
    Data(serde_json::Value),
    /// The control plane refused the command.
    Rejected(String),
}

/// Remote task state as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Stopped { exit_status: String },
}

impl TaskState {
    pub const EXIT_OK: &'static str = "OK";
}

/// VM settings changed through a config update. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmSettings {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub start_on_boot: Option<bool>,
    pub allow_reboot: Option<bool>,
    pub protection: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Shutdown,
    Stop,
    Reset,
}

/// One guest network interface as reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Where and as whom to open a remote shell.
#[derive(Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl fmt::Debug for ShellTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
