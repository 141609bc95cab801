pub mod cloud;
pub mod config;
pub mod deploy;
pub mod events;
pub mod ingest;
pub mod model;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cloud::{GraphNotebookClient, StaticToken};
use config::AppConfig;
use deploy::artifacts::{AgentArtifacts, AgentSettings};
use deploy::{DeployProgress, DeploymentStatus, Orchestrator};
use events::{EventBus, SyncEvent};
use ingest::{IngestState, StaticConfigProvider};
use queue::{PassOutcome, UploadQueueProcessor};
use storage::{PageStore, SharedStore};

pub use config::default_data_dir;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "inkbridge",
    version,
    about = "Move handwritten tablet pages into cloud notebooks"
)]
pub struct Cli {
    /// Path to the SQLite database (defaults to {data_dir}/inkbridge.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Override the data directory (database and received pages)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingestion server and the automatic sync loop
    Serve {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Sync interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// Receive pages only; never upload
        #[arg(long, default_value_t = false)]
        no_sync: bool,
    },
    /// Show what is installed on the device
    Status,
    /// Install the agent on the device
    Deploy {
        /// Directory holding the agent binaries
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Reinstall the agent, keeping its on-device configuration
    Update {
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Remove the agent from the device
    Uninstall,
    /// Upload pending pages once
    Push {
        /// Maximum pages in this pass
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Requeue every failed page
    Retry,
    /// Delete finished pages older than N days
    Cleanup {
        #[arg(long)]
        days: Option<u64>,
    },
    /// Page counts by status
    Stats {
        /// Emit JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Resolved paths for one invocation.
struct Paths {
    data_dir: PathBuf,
    db_path: PathBuf,
}

impl Paths {
    fn resolve(cli: &Cli) -> Self {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        let db_path = cli
            .db
            .clone()
            .unwrap_or_else(|| data_dir.join("inkbridge.db"));
        Self { data_dir, db_path }
    }

    fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    fn open_store(&self) -> Result<SharedStore> {
        let store = PageStore::open(&self.db_path)
            .with_context(|| format!("opening page store at {}", self.db_path.display()))?;
        Ok(storage::shared(store))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_with(|key| dotenvy::var(key).ok())?;
            config
        }
        None => AppConfig::load()?,
    };
    let paths = Paths::resolve(&cli);

    match cli.command {
        Commands::Serve {
            port,
            interval,
            no_sync,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(secs) = interval {
                config.sync.interval_secs = secs;
            }
            serve(&config, &paths, !no_sync).await
        }
        Commands::Status => {
            let status = with_orchestrator(&config, &paths, None, |orch| {
                orch.check_installation().map_err(Into::into)
            })
            .await?;
            print_status(&status);
            Ok(())
        }
        Commands::Deploy { artifacts } => {
            let status = with_progress(&config, &paths, artifacts, |orch, events| {
                orch.deploy(deploy::progress_publisher(events))
                    .map_err(Into::into)
            })
            .await?;
            print_status(&status);
            Ok(())
        }
        Commands::Update { artifacts } => {
            let status = with_progress(&config, &paths, artifacts, |orch, events| {
                orch.update(deploy::progress_publisher(events))
                    .map_err(Into::into)
            })
            .await?;
            print_status(&status);
            Ok(())
        }
        Commands::Uninstall => {
            let status = with_progress(&config, &paths, None, |orch, events| {
                orch.uninstall(deploy::progress_publisher(events))
                    .map_err(Into::into)
            })
            .await?;
            print_status(&status);
            Ok(())
        }
        Commands::Push { batch } => {
            let store = paths.open_store()?;
            let client = cloud_client(&config)?;
            let processor = UploadQueueProcessor::new(store, client, EventBus::new())
                .with_batch_size(batch.unwrap_or(config.sync.batch_size));
            match processor.run_pass(&CancellationToken::new()).await? {
                PassOutcome::Completed(report) => println!(
                    "Uploaded {} of {} page(s), {} failed, {} re-received during upload",
                    report.uploaded, report.attempted, report.failed, report.superseded
                ),
                PassOutcome::AlreadyRunning => println!("An upload pass is already running"),
            }
            Ok(())
        }
        Commands::Retry => {
            let store = paths.open_store()?;
            let reset = store.lock().reset_failed()?;
            println!("Requeued {reset} failed page(s)");
            Ok(())
        }
        Commands::Cleanup { days } => {
            let store = paths.open_store()?;
            let max_age = config.sync.retention(days);
            let days = days.unwrap_or(config.sync.retention_days);
            let report = store.lock().cleanup_older_than(max_age)?;
            println!(
                "Removed {} record(s) and {} file(s) older than {days} day(s)",
                report.records_removed, report.files_deleted
            );
            Ok(())
        }
        Commands::Stats { json } => {
            let store = paths.open_store()?;
            let counts = store.lock().status_counts()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                println!("pending      {}", counts.pending);
                println!("in_progress  {}", counts.in_progress);
                println!("uploaded     {}", counts.uploaded);
                println!("failed       {}", counts.failed);
                println!("skipped      {}", counts.skipped);
                println!("deleted      {}", counts.deleted);
                println!("total        {}", counts.total());
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "inkbridge", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn cloud_client(config: &AppConfig) -> Result<GraphNotebookClient> {
    let token = config
        .cloud
        .access_token
        .clone()
        .ok_or_else(|| anyhow!("no cloud access token; set INKBRIDGE_CLOUD_TOKEN"))?;
    Ok(GraphNotebookClient::new(
        config.cloud.base_url.clone(),
        Arc::new(StaticToken(token)),
    )?)
}

async fn serve(config: &AppConfig, paths: &Paths, sync_enabled: bool) -> Result<()> {
    let store = paths.open_store()?;
    store.lock().requeue_interrupted()?;
    let events = EventBus::new();
    let cancel = CancellationToken::new();

    let provider = Arc::new(StaticConfigProvider {
        server_url: config.server.public_url(),
        sync_interval_secs: config.sync.interval_secs,
    });
    let state = IngestState::new(store.clone(), paths.upload_dir(), events.clone(), provider)
        .with_api_key_prefix(&config.server.api_key_prefix);

    spawn_event_logger(&events, cancel.clone());

    let device_link = sync::DeviceLink::new(events.clone());
    let (device_tx, link_task) = sync::spawn_device_link(device_link, cancel.clone());
    match config.device.target() {
        Ok(target) => {
            if device_tx
                .send(sync::DeviceEvent::Connected(target))
                .await
                .is_err()
            {
                warn!("device link stopped before first connect");
            }
        }
        Err(e) => info!(reason = %e, "device link idle"),
    }

    let sync_task = if sync_enabled {
        match cloud_client(config) {
            Ok(client) => {
                let processor = Arc::new(
                    UploadQueueProcessor::new(store.clone(), client, events.clone())
                        .with_batch_size(config.sync.batch_size),
                );
                Some(tokio::spawn(sync::run_sync_loop(
                    processor,
                    config.sync.interval(),
                    cancel.clone(),
                )))
            }
            Err(e) => {
                warn!(reason = %e, "automatic sync disabled");
                None
            }
        }
    } else {
        None
    };

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("cannot listen for ctrl-c; stopping only on error");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            cancel.cancel();
        }
    };
    let served = ingest::run(config.server.port, state, shutdown).await;

    cancel.cancel();
    if let Some(task) = sync_task {
        match task.await {
            Ok(Ok(cycles)) => info!(cycles, "sync loop joined"),
            Ok(Err(e)) => warn!(error = %e, "sync loop ended with error"),
            Err(e) => warn!(error = %e, "sync loop task failed"),
        }
    }
    drop(device_tx);
    let _ = link_task.await;
    served
}

/// Log pipeline events as they happen.
fn spawn_event_logger(events: &EventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(SyncEvent::ConnectionChanged { host, connected }) => {
                        info!(host = %host, connected, "device connection changed");
                    }
                    Ok(SyncEvent::QueueProgress { processed, total, .. }) => {
                        tracing::debug!(processed, total, "upload progress");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event logger lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Connect to the device and run `op` against a fresh orchestrator on the
/// blocking pool.
async fn with_orchestrator<F>(
    config: &AppConfig,
    paths: &Paths,
    artifacts_dir: Option<PathBuf>,
    op: F,
) -> Result<DeploymentStatus>
where
    F: FnOnce(&mut Orchestrator<'_, remote::session::RemoteSession>) -> Result<DeploymentStatus>
        + Send
        + 'static,
{
    let target = config.device.target()?;
    let dir = artifacts_dir
        .or_else(|| config.deploy.artifacts_dir.clone())
        .unwrap_or_else(|| paths.data_dir.join("agent"));
    let version = config
        .deploy
        .version
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let artifacts = AgentArtifacts::from_dir(&dir, version);
    let settings = AgentSettings::new(
        config.server.public_url(),
        config.server.api_key.clone(),
        config.device.device_id.clone(),
    );

    let mut session = sync::connect_once(target).await?;
    tokio::task::spawn_blocking(move || {
        let mut orchestrator = Orchestrator::new(&mut session, artifacts, settings);
        let result = op(&mut orchestrator);
        session.disconnect();
        result
    })
    .await
    .context("deployment task panicked")?
}

/// [`with_orchestrator`] with deploy progress published on an [`EventBus`]
/// and printed as it arrives.
async fn with_progress<F>(
    config: &AppConfig,
    paths: &Paths,
    artifacts_dir: Option<PathBuf>,
    op: F,
) -> Result<DeploymentStatus>
where
    F: FnOnce(
            &mut Orchestrator<'_, remote::session::RemoteSession>,
            EventBus,
        ) -> Result<DeploymentStatus>
        + Send
        + 'static,
{
    let events = EventBus::new();
    let printer = spawn_progress_printer(&events);
    let publisher = events.clone();
    let result =
        with_orchestrator(config, paths, artifacts_dir, move |orch| op(orch, publisher)).await;
    // The printer drains what is buffered, then stops once every sender is gone.
    drop(events);
    if let Err(e) = printer.await {
        warn!(error = %e, "progress printer failed");
    }
    result
}

fn spawn_progress_printer(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::Deploy(progress)) => print_progress(&progress),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "progress printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_progress(progress: &DeployProgress) {
    println!(
        "[{:>3.0}%] {}: {}",
        progress.fraction * 100.0,
        progress.stage,
        progress.message
    );
}

fn print_status(status: &DeploymentStatus) {
    if !status.is_installed {
        println!("Agent not installed");
    } else {
        println!(
            "Agent {} installed",
            status.version.as_deref().unwrap_or(deploy::UNKNOWN_VERSION)
        );
        for (component, healthy) in &status.components {
            println!("  {component:<12} {}", if *healthy { "ok" } else { "down" });
        }
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
}
