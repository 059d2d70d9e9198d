mod config;
mod dispatcher;
mod error;
mod jobs;
mod queue;
mod store;
#[cfg(test)]
mod testing;

use std::fmt;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pxa_db::SecretBox;
use pxa_db::models::{
    HypervisorAccount, InsertError, JobKind, NewHypervisorAccount, NewServer, Server, ServerJob,
    SshKey,
};
use pxa_infra::pve::PveConnector;
use pxa_infra::ssh::SshShell;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;
use crate::dispatcher::{recover_interrupted, spawn_dispatcher};
use crate::jobs::JobContext;
use crate::queue::PgQueue;
use crate::store::PgStore;

#[derive(Parser)]
#[command(name = "pxa-worker")]
#[command(about = "Drives Proxmox VM lifecycle jobs to completion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job dispatcher (default)
    Run,
    /// Queue a lifecycle job for a server
    Enqueue(EnqueueArgs),
    /// Register an owner's control-plane account
    AddAccount(AccountArgs),
    /// Register an SSH public key for an account
    AddKey(KeyArgs),
    /// Record an ordered server in `pending`
    AddServer(ServerArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Create,
    Delete,
    Reboot,
    Rename,
}

impl From<Kind> for JobKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Create => JobKind::Create,
            Kind::Delete => JobKind::Delete,
            Kind::Reboot => JobKind::Reboot,
            Kind::Rename => JobKind::Rename,
        }
    }
}

#[derive(Args)]
struct EnqueueArgs {
    kind: Kind,

    /// The server's external unique id
    server: String,

    /// Handle (UPID) of a task already started for this job
    #[arg(long)]
    task: Option<String>,

    /// New name, required for rename
    #[arg(long, required_if_eq("kind", "rename"))]
    name: Option<String>,
}

#[derive(Args)]
struct AccountArgs {
    #[arg(long)]
    hostname: String,

    #[arg(long, default_value_t = pxa_infra::DEFAULT_PORT)]
    port: u16,

    #[arg(long)]
    username: String,

    #[arg(long, default_value = "pve")]
    realm: String,

    #[arg(long)]
    password: String,

    /// Check the cluster's TLS certificate
    #[arg(long)]
    verify_tls: bool,
}

#[derive(Args)]
struct KeyArgs {
    account: uuid::Uuid,

    name: String,

    /// OpenSSH public key line
    public_key: String,
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long)]
    account: uuid::Uuid,

    /// External unique id the request handler knows the server by
    #[arg(long)]
    unique_id: String,

    #[arg(long)]
    name: String,

    #[arg(long)]
    node: String,

    #[arg(long)]
    storage: String,

    #[arg(long, value_parser = clap::value_parser!(i32).range(1..))]
    vmid: i32,

    /// Size code, e.g. s-2vcpu-2gb
    #[arg(long)]
    size: String,

    #[arg(long, value_parser = clap::value_parser!(i32).range(1..))]
    cores: i32,

    #[arg(long, value_parser = clap::value_parser!(i32).range(16..))]
    memory_mb: i32,

    /// SSH key to install on first boot
    #[arg(long)]
    key: Option<uuid::Uuid>,
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    let db = pxa_db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("failed to connect to database");

    pxa_db::run_migrations(&db)
        .await
        .expect("failed to run migrations");

    let secrets =
        SecretBox::from_base64_key(&config.secret_key).expect("SECRET_KEY is not a valid key");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(db, config, secrets).await,
        Command::Enqueue(args) => exit_on_error("enqueue", enqueue(&db, args).await),
        Command::AddAccount(args) => {
            exit_on_error("add account", add_account(&db, &secrets, args).await)
        }
        Command::AddKey(args) => exit_on_error("add key", add_key(&db, args).await),
        Command::AddServer(args) => {
            exit_on_error("add server", add_server(&db, &secrets, args).await)
        }
    }
}

fn exit_on_error<E: fmt::Display>(command: &str, result: Result<(), E>) {
    if let Err(e) = result {
        tracing::error!(command, error = %e, "command failed");
        std::process::exit(1);
    }
}

async fn run(db: PgPool, config: WorkerConfig, secrets: SecretBox) {
    let queue = Arc::new(PgQueue::new(db.clone(), config.worker_id.clone(), secrets));
    let ctx = Arc::new(JobContext {
        connector: Arc::new(PveConnector),
        shell: Arc::new(SshShell::new()),
        store: Arc::new(PgStore::new(db.clone())),
        settings: config.jobs.clone(),
    });

    match recover_interrupted(&*queue, &ctx).await {
        Ok(0) => {}
        Ok(count) => tracing::warn!(count, "settled jobs interrupted by the last shutdown"),
        Err(e) => tracing::error!(error = %e, "failed to settle interrupted jobs"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = spawn_dispatcher(
        queue,
        ctx,
        config.concurrency,
        config.queue_poll_interval,
        shutdown_rx,
    );

    tracing::info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        poll_interval = ?config.queue_poll_interval,
        "worker started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutting down, waiting for running jobs");
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "dispatcher panicked");
    }
}

async fn enqueue(db: &PgPool, args: EnqueueArgs) -> sqlx::Result<()> {
    let server = Server::get_by_unique_id(db, &args.server).await?;
    let job = ServerJob::enqueue(
        db,
        server.id,
        args.kind.into(),
        args.task.as_deref(),
        args.name.as_deref(),
    )
    .await?;

    tracing::info!(job_id = %job.id, kind = %job.kind, server_id = %server.id, "job queued");
    Ok(())
}

async fn add_account(db: &PgPool, secrets: &SecretBox, args: AccountArgs) -> Result<(), InsertError> {
    let account = HypervisorAccount::insert(
        db,
        secrets,
        &NewHypervisorAccount {
            hostname: &args.hostname,
            port: i32::from(args.port),
            username: &args.username,
            realm: &args.realm,
            password: &args.password,
            verify_tls: args.verify_tls,
        },
    )
    .await?;

    tracing::info!(account_id = %account.id, owner = %account.owner(), "account added");
    Ok(())
}

async fn add_key(db: &PgPool, args: KeyArgs) -> sqlx::Result<()> {
    let key = SshKey::insert(db, args.account, &args.name, &args.public_key).await?;
    tracing::info!(key_id = %key.id, account_id = %key.account_id, "key added");
    Ok(())
}

async fn add_server(db: &PgPool, secrets: &SecretBox, args: ServerArgs) -> Result<(), InsertError> {
    let server = Server::insert(
        db,
        secrets,
        &NewServer {
            unique_id: &args.unique_id,
            account_id: args.account,
            name: &args.name,
            node: &args.node,
            storage: &args.storage,
            vmid: args.vmid,
            size_code: &args.size,
            cores: args.cores,
            memory_mb: args.memory_mb,
            key_id: args.key,
        },
    )
    .await?;

    tracing::info!(server_id = %server.id, unique_id = %server.unique_id, status = %server.status, "server added");
    Ok(())
}
