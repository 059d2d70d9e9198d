use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

// ── Credentials ──────────────────────────────────────────────────────

/// Per-owner login details for a Proxmox VE cluster.
#[derive(Clone)]
pub struct Credentials {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub realm: String,
    pub password: String,
    pub verify_tls: bool,
}

impl Credentials {
    /// The `user@realm` form the ticket endpoint expects.
    pub fn user_id(&self) -> String {
        format!("{}@{}", self.username, self.realm)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("verify_tls", &self.verify_tls)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Ticket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_prevention_token: String,
}

// ── Tasks ────────────────────────────────────────────────────────────

/// Body of `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    pub status: String,
    /// Only present once the task has stopped. `OK` on success.
    #[serde(default)]
    pub exitstatus: Option<String>,
}

// ── VM config ────────────────────────────────────────────────────────

/// Options accepted by `POST /nodes/{node}/qemu/{vmid}/config`.
///
/// Only the fields that are set are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "bool_as_int"
    )]
    pub onboot: Option<bool>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "bool_as_int"
    )]
    pub reboot: Option<bool>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "bool_as_int"
    )]
    pub protection: Option<bool>,
}

// PVE booleans are 0/1 on the wire.
fn bool_as_int<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(b) => serializer.serialize_u8(u8::from(*b)),
        None => serializer.serialize_none(),
    }
}

/// VM power actions under `/nodes/{node}/qemu/{vmid}/status/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Shutdown,
    Stop,
    Reset,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Shutdown => "shutdown",
            Self::Stop => "stop",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Guest agent ──────────────────────────────────────────────────────

/// Body of `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentNetworkInterfaces {
    #[serde(default)]
    pub result: Vec<AgentInterface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    /// `ipv4` or `ipv6`.
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
}
