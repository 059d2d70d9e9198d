use std::env;
use std::fmt;
use std::time::Duration;

use crate::jobs::post_boot::InterfaceRoles;

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Base64 AES-256 key sealing stored passwords.
    pub secret_key: String,
    /// Recorded on claimed jobs. Must be stable across restarts of one worker
    /// and distinct between workers sharing a database.
    pub worker_id: String,
    /// Upper bound on workflows running at once. A polling workflow holds its
    /// slot for the whole remote operation, which can take minutes.
    pub concurrency: usize,
    pub queue_poll_interval: Duration,
    pub jobs: JobSettings,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker_id", &self.worker_id)
            .field("concurrency", &self.concurrency)
            .field("queue_poll_interval", &self.queue_poll_interval)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

/// Knobs shared by every orchestration job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub task_poll_interval: Duration,
    /// `None` waits for a remote task for as long as it takes.
    pub task_timeout: Option<Duration>,
    pub agent_poll_interval: Duration,
    pub agent_timeout: Duration,
    pub ssh_port: u16,
    /// Bounds connect, authentication and peer silence.
    pub ssh_timeout: Duration,
    /// Bounds one whole shell session.
    pub ssh_session_timeout: Duration,
    pub guest_username: String,
    pub guest_default_password: String,
    pub interface_roles: InterfaceRoles,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            task_poll_interval: Duration::from_millis(500),
            task_timeout: None,
            agent_poll_interval: Duration::from_millis(250),
            agent_timeout: Duration::from_secs(15 * 60),
            ssh_port: 22,
            ssh_timeout: Duration::from_secs(10),
            ssh_session_timeout: Duration::from_secs(120),
            guest_username: "gonano".into(),
            guest_default_password: "gonano".into(),
            interface_roles: InterfaceRoles::default(),
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &str, default: &str) -> T {
    env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .unwrap_or_else(|_| panic!("{name} must be a valid {}", std::any::type_name::<T>()))
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = JobSettings::default();
        let concurrency: usize = parsed("WORKER_CONCURRENCY", "8");

        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            database_max_connections: parsed(
                "DATABASE_MAX_CONNECTIONS",
                &(concurrency + 4).to_string(),
            ),
            secret_key: env::var("SECRET_KEY").expect("SECRET_KEY must be set"),
            worker_id: optional("WORKER_ID")
                .or_else(|| optional("HOSTNAME"))
                .unwrap_or_else(|| "worker".into()),
            concurrency,
            queue_poll_interval: Duration::from_millis(parsed("QUEUE_POLL_INTERVAL_MS", "1000")),
            jobs: JobSettings {
                task_poll_interval: Duration::from_millis(parsed("TASK_POLL_INTERVAL_MS", "500")),
                task_timeout: optional("TASK_TIMEOUT_SECS").map(|s| {
                    Duration::from_secs(s.parse().expect("TASK_TIMEOUT_SECS must be a valid u64"))
                }),
                agent_poll_interval: Duration::from_millis(parsed("AGENT_POLL_INTERVAL_MS", "250")),
                agent_timeout: Duration::from_secs(parsed("AGENT_TIMEOUT_SECS", "900")),
                ssh_port: parsed("SSH_PORT", "22"),
                ssh_timeout: Duration::from_secs(parsed("SSH_TIMEOUT_SECS", "10")),
                ssh_session_timeout: Duration::from_secs(parsed("SSH_SESSION_TIMEOUT_SECS", "120")),
                guest_username: optional("GUEST_USERNAME").unwrap_or(defaults.guest_username),
                guest_default_password: optional("GUEST_DEFAULT_PASSWORD")
                    .unwrap_or(defaults.guest_default_password),
                interface_roles: InterfaceRoles {
                    external: optional("EXTERNAL_INTERFACE"),
                    internal: optional("INTERNAL_INTERFACE"),
                },
            },
        }
    }
}
