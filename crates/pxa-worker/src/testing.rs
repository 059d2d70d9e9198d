//! In-memory collaborators for workflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use pxa_db::models::{JobKind, JobState, Server, ServerJob, ServerStatus};
use pxa_infra::types::{
    CommandResult, NetworkInterface, PowerAction, ShellTarget, TaskHandle, TaskState, VmRef,
    VmSettings,
};
use pxa_infra::{Connector, ControlPlane, Credentials, RemoteShell, ShellError};
use uuid::Uuid;

use crate::config::JobSettings;
use crate::jobs::{Job, JobContext, Session, Workflow};
use crate::queue::{JobQueue, LoadError, Owner};
use crate::store::LifecycleStore;

/// Ordered record of everything the fakes were asked to do.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Control-plane calls, in order.
    pub fn remote_calls(&self) -> Vec<String> {
        self.strip("cp: ")
    }

    /// Persisted status transitions, in order.
    pub fn statuses(&self) -> Vec<String> {
        self.strip("store: status ")
    }

    fn strip(&self, prefix: &str) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(String::from))
            .collect()
    }
}

pub fn iface(name: &str, addresses: &[&str]) -> NetworkInterface {
    NetworkInterface {
        name: name.into(),
        addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
    }
}

/// What a freshly booted guest with a public and a private NIC reports.
pub fn guest_interfaces() -> Vec<NetworkInterface> {
    vec![
        iface("lo", &["127.0.0.1", "::1"]),
        iface("eth0", &["fe80::be24:11ff:fe4c:1", "203.0.113.20"]),
        iface("eth1", &["10.10.0.20"]),
    ]
}

// ── Control plane ───────────────────────────────────────────────────

struct ScriptedTask {
    /// The query that first reports `stopped`.
    stop_after: usize,
    exit_status: String,
    queries: usize,
}

#[derive(Default)]
struct ControlPlaneState {
    replies: HashMap<&'static str, VecDeque<CommandResult>>,
    tasks: HashMap<TaskHandle, ScriptedTask>,
    agent: VecDeque<Result<Vec<NetworkInterface>, String>>,
    agent_queries: usize,
    configs: Vec<VmSettings>,
}

pub struct FakeControlPlane {
    journal: Journal,
    state: Mutex<ControlPlaneState>,
    next_upid: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            state: Mutex::default(),
            next_upid: AtomicUsize::new(1),
        }
    }

    /// Register a task that reports `stopped` with `exit_status` on query `stop_after`.
    pub fn script_task(&self, task: &TaskHandle, stop_after: usize, exit_status: &str) {
        self.state.lock().unwrap().tasks.insert(
            task.clone(),
            ScriptedTask {
                stop_after,
                exit_status: exit_status.into(),
                queries: 0,
            },
        );
    }

    /// Make the next `command` start a scripted task.
    pub fn next_task(&self, command: &'static str, stop_after: usize, exit_status: &str) -> TaskHandle {
        let n = self.next_upid.fetch_add(1, Ordering::Relaxed);
        let task = TaskHandle(format!(
            "UPID:pve1:{n:08X}:00000000:65F00000:{command}:101:ops@pve:"
        ));
        self.script_task(&task, stop_after, exit_status);
        self.reply(command, CommandResult::Task(task.clone()));
        task
    }

    /// Queue the reply to the next `command`. Unscripted commands complete
    /// immediately with no data.
    pub fn reply(&self, command: &'static str, result: CommandResult) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(command)
            .or_default()
            .push_back(result);
    }

    /// Queue a guest agent answer. Once drained the agent is "not running".
    pub fn agent_reply(&self, reply: Result<Vec<NetworkInterface>, String>) {
        self.state.lock().unwrap().agent.push_back(reply);
    }

    pub fn status_queries(&self, task: &TaskHandle) -> usize {
        let state = self.state.lock().unwrap();
        match state.tasks.get(task) {
            Some(t) => t.queries,
            None => self
                .journal
                .remote_calls()
                .iter()
                .filter(|c| **c == format!("status {task}"))
                .count(),
        }
    }

    pub fn agent_queries(&self) -> usize {
        self.state.lock().unwrap().agent_queries
    }

    pub fn configs(&self) -> Vec<VmSettings> {
        self.state.lock().unwrap().configs.clone()
    }

    fn command(&self, command: &'static str, vm: &VmRef) -> CommandResult {
        self.journal.push(format!("cp: {command} {}", vm.vmid));
        self.state
            .lock()
            .unwrap()
            .replies
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .unwrap_or(CommandResult::Data(serde_json::Value::Null))
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn task_status(&self, _node: &str, task: &TaskHandle) -> pxa_infra::Result<TaskState> {
        self.journal.push(format!("cp: status {task}"));
        let mut state = self.state.lock().unwrap();
        let Some(scripted) = state.tasks.get_mut(task) else {
            return Err(pxa_infra::Error::Rejected {
                endpoint: "task status",
                message: format!("no such task '{task}'"),
            });
        };

        scripted.queries += 1;
        if scripted.queries >= scripted.stop_after {
            Ok(TaskState::Stopped {
                exit_status: scripted.exit_status.clone(),
            })
        } else {
            Ok(TaskState::Running)
        }
    }

    async fn update_config(
        &self,
        vm: &VmRef,
        settings: &VmSettings,
    ) -> pxa_infra::Result<CommandResult> {
        self.state.lock().unwrap().configs.push(settings.clone());
        Ok(self.command("config", vm))
    }

    async fn power(&self, vm: &VmRef, action: PowerAction) -> pxa_infra::Result<CommandResult> {
        let command = match action {
            PowerAction::Start => "start",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Stop => "stop",
            PowerAction::Reset => "reset",
        };
        Ok(self.command(command, vm))
    }

    async fn delete_vm(&self, vm: &VmRef) -> pxa_infra::Result<CommandResult> {
        Ok(self.command("delete", vm))
    }

    async fn network_interfaces(&self, vm: &VmRef) -> pxa_infra::Result<Vec<NetworkInterface>> {
        self.journal.push(format!("cp: agent {}", vm.vmid));
        let mut state = self.state.lock().unwrap();
        state.agent_queries += 1;
        state
            .agent
            .pop_front()
            .unwrap_or_else(|| Err("QEMU guest agent is not running".into()))
            .map_err(|message| pxa_infra::Error::Rejected {
                endpoint: "guest agent",
                message,
            })
    }
}

pub struct FakeConnector {
    control_plane: Arc<FakeControlPlane>,
    reject: AtomicBool,
}

impl FakeConnector {
    pub fn reject_logins(&self) {
        self.reject.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _credentials: &Credentials) -> pxa_infra::Result<Arc<dyn ControlPlane>> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(pxa_infra::Error::Auth(
                "401 authentication failure".into(),
            ));
        }
        let control_plane: Arc<dyn ControlPlane> = self.control_plane.clone();
        Ok(control_plane)
    }
}

// ── Shell ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShellSession {
    pub host: String,
    pub password: String,
    pub commands: Vec<String>,
    pub accepted: bool,
}

/// A guest that accepts exactly one password for the default account and
/// honours `passwd` heredocs.
pub struct FakeShell {
    guest_password: Mutex<String>,
    sessions: Mutex<Vec<ShellSession>>,
    fail_next: Mutex<Option<ShellError>>,
    hang: AtomicBool,
}

impl FakeShell {
    pub fn new(guest_password: &str) -> Self {
        Self {
            guest_password: Mutex::new(guest_password.into()),
            sessions: Mutex::default(),
            fail_next: Mutex::default(),
            hang: AtomicBool::new(false),
        }
    }

    /// Every later session stalls after login and never returns.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::Relaxed);
    }

    pub fn fail_next(&self, error: ShellError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    pub fn sessions(&self) -> Vec<ShellSession> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(&self, target: &ShellTarget, commands: &[String]) -> Result<(), ShellError> {
        if self.hang.load(Ordering::Relaxed) {
            self.sessions.lock().unwrap().push(ShellSession {
                host: target.host.clone(),
                password: target.password.clone(),
                commands: commands.to_vec(),
                accepted: true,
            });
            std::future::pending::<()>().await;
        }

        let mut guest_password = self.guest_password.lock().unwrap();
        let accepted = target.password == *guest_password;
        self.sessions.lock().unwrap().push(ShellSession {
            host: target.host.clone(),
            password: target.password.clone(),
            commands: commands.to_vec(),
            accepted,
        });

        if let Some(e) = self.fail_next.lock().unwrap().take() {
            return Err(e);
        }
        if !accepted {
            return Err(ShellError::AuthRejected {
                host: target.host.clone(),
                username: target.username.clone(),
            });
        }

        for command in commands {
            if let Some(body) = command.strip_prefix("passwd <<'EOF'\n") {
                let lines: Vec<&str> = body.lines().collect();
                if lines[0] == *guest_password {
                    *guest_password = lines[1].to_string();
                }
            }
        }
        Ok(())
    }
}

// ── Store ───────────────────────────────────────────────────────────

pub struct MemoryStore {
    journal: Journal,
    records: Mutex<HashMap<Uuid, Server>>,
}

impl MemoryStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            records: Mutex::default(),
        }
    }

    pub fn insert(&self, server: &Server) {
        self.records
            .lock()
            .unwrap()
            .insert(server.id, server.clone());
    }

    pub fn record(&self, id: Uuid) -> Option<Server> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    fn update(&self, server: &Server) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&server.id) {
            *record = server.clone();
        }
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn set_status(&self, server: &mut Server, status: ServerStatus) -> sqlx::Result<()> {
        self.journal.push(format!("store: status {status}"));
        server.status = status;
        self.update(server);
        Ok(())
    }

    async fn mark_error(&self, server: &mut Server) {
        self.journal.push("store: status error".into());
        server.status = ServerStatus::Error;
        self.update(server);
    }

    async fn set_name(&self, server: &mut Server, name: &str) -> sqlx::Result<()> {
        self.journal.push(format!("store: name {name}"));
        server.name = name.into();
        self.update(server);
        Ok(())
    }

    async fn set_addresses(
        &self,
        server: &mut Server,
        external_ip: &str,
        internal_ip: &str,
    ) -> sqlx::Result<()> {
        self.journal
            .push(format!("store: addresses {external_ip} {internal_ip}"));
        server.external_ip = Some(external_ip.into());
        server.internal_ip = Some(internal_ip.into());
        self.update(server);
        Ok(())
    }

    async fn clear_password(&self, server: &mut Server) -> sqlx::Result<()> {
        self.journal.push("store: clear password".into());
        server.password = None;
        self.update(server);
        Ok(())
    }

    async fn remove(&self, server: &Server) -> sqlx::Result<()> {
        self.journal.push("store: remove".into());
        self.records.lock().unwrap().remove(&server.id);
        Ok(())
    }
}

// ── Queue ───────────────────────────────────────────────────────────

pub const WORKER_ID: &str = "worker-test";

pub fn queued_job(server_id: Uuid, kind: JobKind, new_name: Option<&str>) -> ServerJob {
    ServerJob {
        id: Uuid::new_v4(),
        server_id,
        kind,
        task: None,
        new_name: new_name.map(String::from),
        state: JobState::Queued,
        claimed_by: None,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    }
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<ServerJob>,
    running: Vec<ServerJob>,
    finished: Vec<ServerJob>,
    servers: HashMap<Uuid, Server>,
    max_in_flight: usize,
}

/// A job queue that remembers every row it ever held.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    fail_owner: AtomicBool,
}

impl MemoryQueue {
    pub fn add_server(&self, server: &Server) {
        self.state
            .lock()
            .unwrap()
            .servers
            .insert(server.id, server.clone());
    }

    pub fn push(&self, job: ServerJob) -> Uuid {
        let id = job.id;
        self.state.lock().unwrap().queued.push_back(job);
        id
    }

    /// A job some worker claimed and never finished.
    pub fn push_running(&self, mut job: ServerJob, claimed_by: &str) -> Uuid {
        let id = job.id;
        job.state = JobState::Running;
        job.claimed_by = Some(claimed_by.into());
        job.started_at = Some(Utc::now());
        self.state.lock().unwrap().running.push(job);
        id
    }

    pub fn fail_owner_loads(&self) {
        self.fail_owner.store(true, Ordering::Relaxed);
    }

    pub fn finished(&self) -> Vec<ServerJob> {
        self.state.lock().unwrap().finished.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    pub fn running_len(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Most jobs ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn finish_where(
        state: &mut QueueState,
        keep_running: impl Fn(&ServerJob) -> bool,
        error: Option<&str>,
    ) -> Vec<ServerJob> {
        let (kept, done): (Vec<_>, Vec<_>) = state.running.drain(..).partition(keep_running);
        state.running = kept;

        let done: Vec<ServerJob> = done
            .into_iter()
            .map(|mut job| {
                job.state = JobState::Finished;
                job.error = error.map(String::from);
                job.task = None;
                job.finished_at = Some(Utc::now());
                job
            })
            .collect();
        state.finished.extend(done.iter().cloned());
        done
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn claim(&self, limit: usize) -> sqlx::Result<Vec<ServerJob>> {
        let mut state = self.state.lock().unwrap();
        let take = limit.min(state.queued.len());
        let claimed: Vec<ServerJob> = state
            .queued
            .drain(..take)
            .map(|mut job| {
                job.state = JobState::Running;
                job.claimed_by = Some(WORKER_ID.into());
                job.started_at = Some(Utc::now());
                job
            })
            .collect();

        state.running.extend(claimed.iter().cloned());
        state.max_in_flight = state.max_in_flight.max(state.running.len());
        Ok(claimed)
    }

    async fn finish(&self, id: Uuid, error: Option<&str>) -> sqlx::Result<()> {
        let mut state = self.state.lock().unwrap();
        if Self::finish_where(&mut state, |j| j.id != id, error).is_empty() {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn interrupt_running(&self, error: &str) -> sqlx::Result<Vec<ServerJob>> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::finish_where(
            &mut state,
            |j| j.claimed_by.as_deref() != Some(WORKER_ID),
            Some(error),
        ))
    }

    async fn load_server(&self, id: Uuid) -> sqlx::Result<Option<Server>> {
        Ok(self.state.lock().unwrap().servers.get(&id).cloned())
    }

    async fn load_owner(&self, _server: &mut Server) -> Result<Owner, LoadError> {
        if self.fail_owner.load(Ordering::Relaxed) {
            return Err(LoadError::Secret(pxa_db::SecretError::Open));
        }
        Ok(Owner {
            credentials: credentials(),
            display: "ops@pve".into(),
            public_key: None,
        })
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

fn credentials() -> Credentials {
    Credentials {
        hostname: "pve.example.net".into(),
        port: pxa_infra::DEFAULT_PORT,
        username: "ops".into(),
        realm: "pve".into(),
        password: "correct horse".into(),
        verify_tls: false,
    }
}

pub fn server(status: ServerStatus) -> Server {
    let now = Utc::now();
    Server {
        id: Uuid::new_v4(),
        unique_id: "srv-9f2c".into(),
        account_id: Uuid::new_v4(),
        name: "web-1".into(),
        node: "pve1".into(),
        storage: "local-lvm".into(),
        vmid: 101,
        size_code: "s-2vcpu-2gb".into(),
        cores: 2,
        memory_mb: 2048,
        key_id: None,
        password: Some(Server::generate_password()),
        status,
        external_ip: None,
        internal_ip: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

pub struct Fixture {
    pub journal: Journal,
    pub control_plane: Arc<FakeControlPlane>,
    pub connector: Arc<FakeConnector>,
    pub shell: Arc<FakeShell>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub ctx: Arc<JobContext>,
}

impl Fixture {
    pub fn new() -> Self {
        let journal = Journal::default();
        let settings = JobSettings::default();
        let control_plane = Arc::new(FakeControlPlane::new(journal.clone()));
        let connector = Arc::new(FakeConnector {
            control_plane: control_plane.clone(),
            reject: AtomicBool::new(false),
        });
        let shell = Arc::new(FakeShell::new(&settings.guest_default_password));
        let store = Arc::new(MemoryStore::new(journal.clone()));

        let ctx = Arc::new(JobContext {
            connector: connector.clone(),
            shell: shell.clone(),
            store: store.clone(),
            settings,
        });

        Self {
            journal,
            control_plane,
            connector,
            shell,
            store,
            queue: Arc::default(),
            ctx,
        }
    }

    /// A server known to both the queue and the store.
    pub fn queued_server(&self, status: ServerStatus) -> Server {
        let server = server(status);
        self.store.insert(&server);
        self.queue.add_server(&server);
        server
    }

    pub fn session(&self) -> Session<'_> {
        Session {
            control_plane: self.control_plane.clone(),
            ctx: &self.ctx,
        }
    }

    pub fn job(&self, workflow: Workflow, task: Option<TaskHandle>) -> Job {
        self.job_in(ServerStatus::Pending, workflow, task)
    }

    /// A job for a freshly stored server in `status`.
    pub fn job_in(&self, status: ServerStatus, workflow: Workflow, task: Option<TaskHandle>) -> Job {
        let server = server(status);
        self.store.insert(&server);

        Job {
            vm: VmRef {
                node: server.node.clone(),
                vmid: 101,
            },
            server,
            credentials: credentials(),
            owner: "ops@pve".into(),
            public_key: None,
            task,
            workflow,
        }
    }
}
