//! Typed Rust client for the Proxmox VE REST API.
//!
//! Covers the subset needed for driving VM lifecycle jobs: ticket login,
//! raw `get` / `create` / `delete` calls, and helpers for task status,
//! VM config, power actions, deletion and the guest agent.
//!
//! Every call returns a [`Reply`]: either the `data` member of the response
//! or the `errors` the cluster reported. Only transport problems surface as
//! [`Error`].

mod types;

pub use types::*;

use serde::Serialize;
use serde_json::Value;

const API_PREFIX: &str = "/api2/json";

pub const DEFAULT_PORT: u16 = 8006;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pve api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("pve login as {user} returned {status}: {body}")]
    Login {
        user: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("pve api called before login")]
    NotLoggedIn,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single API call that reached the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data(Value),
    Errors(String),
}

impl Reply {
    /// Classify a raw response.
    ///
    /// An `errors` member always wins. A non-2xx status without one is still
    /// an error; PVE puts the reason in the status line and leaves `data` null,
    /// so `reason` is the reason phrase as sent when it differs from the
    /// canonical one.
    pub fn from_body(status: reqwest::StatusCode, reason: Option<&str>, body: &str) -> Self {
        let envelope: Value = serde_json::from_str(body).unwrap_or(Value::Null);

        if let Some(errors) = envelope.get("errors").filter(|e| !e.is_null()) {
            return Self::Errors(error_message(errors));
        }

        if !status.is_success() {
            let status_line = match reason.map(str::trim).filter(|r| !r.is_empty()) {
                Some(reason) => format!("{} {reason}", status.as_u16()),
                None => status.to_string(),
            };
            let body = body.trim();
            return Self::Errors(if body.is_empty() || envelope.get("data").is_some() {
                status_line
            } else {
                format!("{status_line}: {body}")
            });
        }

        Self::Data(envelope.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Flatten an `errors` payload (`{"param": "message"}`) into one line.
fn error_message(errors: &Value) -> String {
    match errors {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(s) => format!("{k}: {}", s.trim()),
                None => format!("{k}: {v}"),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join("; "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The status line's reason phrase, when the server sent a non-canonical one.
fn reason_phrase(resp: &reqwest::Response) -> Option<String> {
    resp.extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .map(str::to_string)
}

#[derive(Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

/// Client for one Proxmox VE cluster, bound to one set of credentials.
///
/// The login ticket lives on the instance; nothing is shared between
/// clients built from different credentials.
#[derive(Clone)]
pub struct PveClient {
    base: String,
    credentials: Credentials,
    http: reqwest::Client,
    session: Option<Session>,
}

impl PveClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        if credentials.hostname.trim().is_empty() {
            return Err(Error::MalformedCredentials("hostname is empty".into()));
        }
        if credentials.username.trim().is_empty() || credentials.realm.trim().is_empty() {
            return Err(Error::MalformedCredentials(
                "username and realm are required".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!credentials.verify_tls)
            .build()?;

        Ok(Self {
            base: format!(
                "https://{}:{}{API_PREFIX}",
                credentials.hostname, credentials.port
            ),
            credentials,
            http,
            session: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(Error::NotLoggedIn)
    }

    fn cookie(session: &Session) -> String {
        format!("PVEAuthCookie={}", session.ticket)
    }

    async fn reply(resp: reqwest::Response) -> Result<Reply> {
        let status = resp.status();
        let reason = reason_phrase(&resp);
        let body = resp.text().await?;
        Ok(Reply::from_body(status, reason.as_deref(), &body))
    }

    // ── Access ───────────────────────────────────────────────────────

    /// Exchange username/password for a ticket. Must succeed before any other call.
    pub async fn login(&mut self) -> Result<()> {
        let user = self.credentials.user_id();
        let resp = self
            .http
            .post(self.url("/access/ticket"))
            .form(&[
                ("username", user.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let reason = reason_phrase(&resp);
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Login { user, status, body });
        }

        let ticket: Ticket = match Reply::from_body(status, reason.as_deref(), &body) {
            Reply::Data(data) => serde_json::from_value(data).map_err(|e| Error::Login {
                user: user.clone(),
                status,
                body: format!("unexpected ticket payload: {e}"),
            })?,
            Reply::Errors(msg) => {
                return Err(Error::Login {
                    user,
                    status,
                    body: msg,
                });
            }
        };

        self.session = Some(Session {
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_prevention_token,
        });
        Ok(())
    }

    // ── Raw calls ────────────────────────────────────────────────────

    pub async fn get(&self, path: &str) -> Result<Reply> {
        let session = self.session()?;
        let resp = self
            .http
            .get(self.url(path))
            .header("Cookie", Self::cookie(session))
            .send()
            .await?;

        Self::reply(resp).await
    }

    /// POST with form-encoded parameters.
    pub async fn create<P: Serialize + ?Sized>(&self, path: &str, params: &P) -> Result<Reply> {
        let session = self.session()?;
        let resp = self
            .http
            .post(self.url(path))
            .header("Cookie", Self::cookie(session))
            .header("CSRFPreventionToken", &session.csrf_token)
            .form(params)
            .send()
            .await?;

        Self::reply(resp).await
    }

    pub async fn delete(&self, path: &str) -> Result<Reply> {
        let session = self.session()?;
        let resp = self
            .http
            .delete(self.url(path))
            .header("Cookie", Self::cookie(session))
            .header("CSRFPreventionToken", &session.csrf_token)
            .send()
            .await?;

        Self::reply(resp).await
    }

    // ── Tasks ────────────────────────────────────────────────────────

    /// Data is a [`TaskStatus`].
    pub async fn task_status(&self, node: &str, upid: &str) -> Result<Reply> {
        self.get(&format!("/nodes/{node}/tasks/{upid}/status")).await
    }

    // ── QEMU VMs ─────────────────────────────────────────────────────

    /// Asynchronous config update. Data is a task UPID.
    pub async fn update_vm_config(&self, node: &str, vmid: u32, config: &VmConfig) -> Result<Reply> {
        self.create(&format!("/nodes/{node}/qemu/{vmid}/config"), config)
            .await
    }

    /// Data is a task UPID.
    pub async fn vm_power(&self, node: &str, vmid: u32, action: PowerAction) -> Result<Reply> {
        self.create(
            &format!("/nodes/{node}/qemu/{vmid}/status/{}", action.as_str()),
            &[] as &[(&str, &str)],
        )
        .await
    }

    /// Data is a task UPID.
    pub async fn delete_vm(&self, node: &str, vmid: u32) -> Result<Reply> {
        self.delete(&format!("/nodes/{node}/qemu/{vmid}")).await
    }

    /// Data is an [`AgentNetworkInterfaces`]. Errors while the guest agent is not up yet.
    pub async fn agent_network_interfaces(&self, node: &str, vmid: u32) -> Result<Reply> {
        self.get(&format!(
            "/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"
        ))
        .await
    }
}
