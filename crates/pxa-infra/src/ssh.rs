use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client};
use russh_keys::key;
use tracing::{debug, warn};

use crate::types::ShellTarget;
use crate::{RemoteShell, ShellError};

/// Freshly cloned VMs present host keys nobody has seen yet.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Password-authenticated SSH sessions via `russh`.
///
/// `ShellTarget::timeout` bounds the connect, the authentication, and any
/// silence from the peer once the session is up.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshShell;

impl SshShell {
    pub fn new() -> Self {
        Self
    }

    fn config(timeout: Duration) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        })
    }

    async fn open(target: &ShellTarget) -> Result<client::Handle<AcceptAnyHostKey>, ShellError> {
        let connect = client::connect(
            Self::config(target.timeout),
            (target.host.as_str(), target.port),
            AcceptAnyHostKey,
        );

        let mut session = match tokio::time::timeout(target.timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(ShellError::Connect {
                    host: target.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ShellError::Connect {
                    host: target.host.clone(),
                    reason: format!("timed out after {:?}", target.timeout),
                });
            }
        };

        let authenticate =
            session.authenticate_password(target.username.as_str(), target.password.as_str());
        let accepted = match tokio::time::timeout(target.timeout, authenticate).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                return Err(ShellError::Connect {
                    host: target.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ShellError::Connect {
                    host: target.host.clone(),
                    reason: format!("authentication timed out after {:?}", target.timeout),
                });
            }
        };

        if !accepted {
            return Err(ShellError::AuthRejected {
                host: target.host.clone(),
                username: target.username.clone(),
            });
        }

        Ok(session)
    }

    async fn exec(
        session: &client::Handle<AcceptAnyHostKey>,
        index: usize,
        command: &str,
    ) -> Result<(), ShellError> {
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ShellError::Protocol(e.to_string()))?;

        channel
            .exec(true, command.as_bytes())
            .await
            .map_err(|e| ShellError::Protocol(e.to_string()))?;

        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(ShellError::CommandFailed {
                index,
                exit_status: code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            }),
            None => Err(ShellError::Protocol(format!(
                "command #{index} closed without an exit status"
            ))),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, target: &ShellTarget, commands: &[String]) -> Result<(), ShellError> {
        let session = Self::open(target).await?;
        debug!(host = %target.host, user = %target.username, "ssh: session open");

        let mut outcome = Ok(());
        for (index, command) in commands.iter().enumerate() {
            if let Err(e) = Self::exec(&session, index, command).await {
                outcome = Err(e);
                break;
            }
        }

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(host = %target.host, error = %e, "ssh: disconnect failed");
        }

        outcome
    }
}
