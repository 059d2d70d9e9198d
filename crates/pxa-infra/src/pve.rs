use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use pve_api::{AgentIpAddress, AgentNetworkInterfaces, PveClient, Reply, TaskStatus, VmConfig};
use serde_json::Value;
use tracing::{debug, info};

use crate::types::{
    CommandResult, NetworkInterface, PowerAction, TaskHandle, TaskState, VmRef, VmSettings,
};
use crate::{Connector, ControlPlane, Credentials, Error, Result};

/// Proxmox VE control plane over `pve_api::PveClient`.
///
/// Always built through [`PveConnector`], so the client is logged in.
pub struct PveControlPlane {
    client: PveClient,
}

impl PveControlPlane {
    fn command_result(reply: Reply) -> CommandResult {
        match reply {
            Reply::Errors(message) => CommandResult::Rejected(message),
            Reply::Data(Value::String(upid)) if upid.starts_with("UPID:") => {
                CommandResult::Task(TaskHandle(upid))
            }
            Reply::Data(data) => CommandResult::Data(data),
        }
    }

    fn task_state(status: TaskStatus) -> TaskState {
        if status.status == "stopped" {
            TaskState::Stopped {
                exit_status: status.exitstatus.unwrap_or_default(),
            }
        } else {
            TaskState::Running
        }
    }

    fn vm_config(settings: &VmSettings) -> VmConfig {
        VmConfig {
            name: settings.name.clone(),
            description: settings.description.clone(),
            cores: settings.cores,
            memory: settings.memory_mb,
            onboot: settings.start_on_boot,
            reboot: settings.allow_reboot,
            protection: settings.protection,
        }
    }

    fn power_action(action: PowerAction) -> pve_api::PowerAction {
        match action {
            PowerAction::Start => pve_api::PowerAction::Start,
            PowerAction::Shutdown => pve_api::PowerAction::Shutdown,
            PowerAction::Stop => pve_api::PowerAction::Stop,
            PowerAction::Reset => pve_api::PowerAction::Reset,
        }
    }

    /// The agent's address type decides the family. Addresses of an unknown
    /// type, or that do not parse as their declared family, are dropped.
    fn address(addr: &AgentIpAddress) -> Option<IpAddr> {
        match addr.ip_address_type.as_str() {
            "ipv4" => addr.ip_address.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
            "ipv6" => addr.ip_address.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
            _ => None,
        }
    }

    fn interfaces(payload: AgentNetworkInterfaces) -> Vec<NetworkInterface> {
        payload
            .result
            .into_iter()
            .map(|iface| NetworkInterface {
                name: iface.name,
                addresses: iface.ip_addresses.iter().filter_map(Self::address).collect(),
            })
            .collect()
    }
}

#[async_trait]
impl ControlPlane for PveControlPlane {
    async fn task_status(&self, node: &str, task: &TaskHandle) -> Result<TaskState> {
        match self.client.task_status(node, &task.0).await? {
            Reply::Data(data) => {
                let status: TaskStatus =
                    serde_json::from_value(data).map_err(|e| Error::Payload {
                        endpoint: "task status",
                        message: e.to_string(),
                    })?;
                Ok(Self::task_state(status))
            }
            Reply::Errors(message) => Err(Error::Rejected {
                endpoint: "task status",
                message,
            }),
        }
    }

    async fn update_config(&self, vm: &VmRef, settings: &VmSettings) -> Result<CommandResult> {
        let reply = self
            .client
            .update_vm_config(&vm.node, vm.vmid, &Self::vm_config(settings))
            .await?;
        debug!(vm = %vm, "pve: config update submitted");
        Ok(Self::command_result(reply))
    }

    async fn power(&self, vm: &VmRef, action: PowerAction) -> Result<CommandResult> {
        let action = Self::power_action(action);
        let reply = self.client.vm_power(&vm.node, vm.vmid, action).await?;
        debug!(vm = %vm, %action, "pve: power action submitted");
        Ok(Self::command_result(reply))
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<CommandResult> {
        let reply = self.client.delete_vm(&vm.node, vm.vmid).await?;
        debug!(vm = %vm, "pve: delete submitted");
        Ok(Self::command_result(reply))
    }

    async fn network_interfaces(&self, vm: &VmRef) -> Result<Vec<NetworkInterface>> {
        match self
            .client
            .agent_network_interfaces(&vm.node, vm.vmid)
            .await?
        {
            Reply::Data(data) => {
                let payload: AgentNetworkInterfaces =
                    serde_json::from_value(data).map_err(|e| Error::Payload {
                        endpoint: "guest agent",
                        message: e.to_string(),
                    })?;
                Ok(Self::interfaces(payload))
            }
            Reply::Errors(message) => Err(Error::Rejected {
                endpoint: "guest agent",
                message,
            }),
        }
    }
}

/// Logs in with the owner's credentials and hands back a fresh control plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PveConnector;

#[async_trait]
impl Connector for PveConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ControlPlane>> {
        let mut client =
            PveClient::new(credentials.clone()).map_err(|e| Error::Auth(e.to_string()))?;

        client
            .login()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;

        info!(
            host = %credentials.hostname,
            user = %credentials.user_id(),
            "pve: logged in"
        );

        Ok(Arc::new(PveControlPlane { client }))
    }
}
