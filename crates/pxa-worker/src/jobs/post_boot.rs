//! Post-boot configuration: address discovery, then one-time credential
//! bootstrapping over SSH.
//!
//! Running it again on an already configured VM is harmless. The guest no
//! longer accepts the credentials tried, and that is taken as success.

use std::net::{IpAddr, Ipv4Addr};

use pxa_db::models::ServerStatus;
use pxa_infra::ShellError;
use pxa_infra::types::{NetworkInterface, ShellTarget, VmRef};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Job, JobContext, Session};
use crate::config::JobSettings;
use crate::error::JobError;

const LOOPBACK: &str = "lo";

/// Interfaces named explicitly for each address role. An unset or absent
/// name falls back to interface order.
#[derive(Debug, Clone, Default)]
pub struct InterfaceRoles {
    pub external: Option<String>,
    pub internal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addresses {
    pub external: Ipv4Addr,
    pub internal: Ipv4Addr,
}

/// Pick the external and internal IPv4 addresses from a guest agent report.
///
/// Without explicit roles the first non-loopback interface is external and
/// the last is internal. `None` means the guest is not ready yet.
pub fn select_addresses(
    interfaces: &[NetworkInterface],
    roles: &InterfaceRoles,
) -> Option<Addresses> {
    let candidates: Vec<&NetworkInterface> =
        interfaces.iter().filter(|i| i.name != LOOPBACK).collect();

    let named = |role: &Option<String>| {
        role.as_deref()
            .and_then(|name| candidates.iter().copied().find(|i| i.name == name))
    };

    let external = named(&roles.external).or_else(|| candidates.first().copied())?;
    let internal = named(&roles.internal).or_else(|| candidates.last().copied())?;

    Some(Addresses {
        external: ipv4(external)?,
        internal: ipv4(internal)?,
    })
}

fn ipv4(interface: &NetworkInterface) -> Option<Ipv4Addr> {
    interface.addresses.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(*v4),
        _ => None,
    })
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn reset_password_command(current: &str, new: &str) -> String {
    format!("passwd <<'EOF'\n{current}\n{new}\n{new}\nEOF")
}

/// Merge `key` into `dir/authorized_keys`, sorted and de-duplicated, replacing
/// the file in one rename.
fn merge_key_script(dir: &str, key: &str) -> String {
    let file = format!("{dir}/authorized_keys");
    format!(
        "mkdir -p {dir} && chmod 700 {dir} && touch {file} && \
         {{ cat {file}; echo {key}; }} | sort -u > {file}.tmp && \
         chmod 600 {file}.tmp && mv {file}.tmp {file}",
        key = shell_quote(key.trim()),
    )
}

fn install_key_commands(key: &str, sudo_password: &str) -> Vec<String> {
    vec![
        merge_key_script("~/.ssh", key),
        format!(
            "echo {} | sudo -kS -p '' sh -c {}",
            shell_quote(sudo_password),
            shell_quote(&merge_key_script("/root/.ssh", key)),
        ),
    ]
}

fn shell_target(settings: &JobSettings, host: Ipv4Addr, password: &str) -> ShellTarget {
    ShellTarget {
        host: host.to_string(),
        port: settings.ssh_port,
        username: settings.guest_username.clone(),
        password: password.to_string(),
        timeout: settings.ssh_timeout,
    }
}

/// An unreachable guest, or one that refuses the login, was configured by an
/// earlier run.
fn tolerate_unreachable(step: &str, result: Result<(), ShellError>) -> Result<(), JobError> {
    match result {
        Err(e) if e.is_connection_failure() => {
            warn!(step, error = %e, "guest unreachable, assuming already configured");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// One shell session, bounded as a whole by `ssh_session_timeout`. A
/// session that outlives it is a failure, not an unreachable guest.
async fn run_shell(
    ctx: &JobContext,
    step: &str,
    target: &ShellTarget,
    commands: &[String],
) -> Result<(), JobError> {
    let limit = ctx.settings.ssh_session_timeout;
    match tokio::time::timeout(limit, ctx.shell.run(target, commands)).await {
        Ok(result) => tolerate_unreachable(step, result),
        Err(_) => Err(JobError::Timeout {
            waiting_for: format!("ssh {step} on {}", target.host),
            after: limit,
        }),
    }
}

/// Poll the guest agent until it reports usable addresses.
async fn discover_addresses(session: &Session<'_>, vm: &VmRef) -> Result<Addresses, JobError> {
    let settings = &session.ctx.settings;
    let started = Instant::now();

    loop {
        match session.control_plane.network_interfaces(vm).await {
            Ok(interfaces) => match select_addresses(&interfaces, &settings.interface_roles) {
                Some(addresses) => return Ok(addresses),
                None => debug!(count = interfaces.len(), "guest has no usable address yet"),
            },
            Err(e) => debug!(error = %e, "guest agent not ready"),
        }

        if started.elapsed() >= settings.agent_timeout {
            return Err(JobError::Timeout {
                waiting_for: "guest agent network interfaces".into(),
                after: settings.agent_timeout,
            });
        }

        tokio::time::sleep(settings.agent_poll_interval).await;
    }
}

/// Finish a boot: record addresses, rotate the password, install the key and
/// mark the server `active`.
pub async fn configure(job: &mut Job, session: &Session<'_>) -> Result<(), JobError> {
    let ctx = session.ctx;
    let settings = &ctx.settings;

    let addresses = discover_addresses(session, &job.vm).await?;
    info!(external = %addresses.external, internal = %addresses.internal, "guest network discovered");
    ctx.store
        .set_addresses(
            &mut job.server,
            &addresses.external.to_string(),
            &addresses.internal.to_string(),
        )
        .await?;

    if let Some(password) = job.server.password.clone() {
        let target = shell_target(settings, addresses.external, &settings.guest_default_password);
        let command = reset_password_command(&settings.guest_default_password, &password);
        run_shell(ctx, "password reset", &target, &[command]).await?;
    }

    if let Some(key) = job.public_key.as_deref() {
        let login = job
            .server
            .password
            .clone()
            .unwrap_or_else(|| settings.guest_default_password.clone());
        let target = shell_target(settings, addresses.external, &login);
        let commands = install_key_commands(key, &login);
        run_shell(ctx, "key install", &target, &commands).await?;
        ctx.store.clear_password(&mut job.server).await?;
    }

    ctx.store.set_status(&mut job.server, ServerStatus::Active).await?;
    Ok(())
}
