use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobfeed_server::config::{AppConfig, CliConfig, FileConfig};
use jobfeed_server::dispatch::{Dispatcher, RunQueue, Scheduler, SqliteRunQueue};
use jobfeed_server::ingest::{IngestWorker, RunDescriptor};
use jobfeed_server::server::{self, hash_api_key, ServerConfig, ServerState};
use jobfeed_server::store::{
    FetchRun, RunStatus, RunType, SqliteTenantStore, Tenant, TenantStore,
};

// Exit codes for the CLI surface.
const EXIT_BAD_INPUT: u8 = 2;
const EXIT_UPSTREAM_FAILURE: u8 = 3;
const EXIT_STORAGE_FAILURE: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "jobfeed-server")]
#[command(about = "Multi-tenant job-board feed ingestion server")]
struct Cli {
    /// Directory holding the SQLite databases.
    #[clap(long)]
    db_dir: Option<PathBuf>,

    /// Path to an optional TOML config file; its values override CLI flags.
    #[clap(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API server, scheduler, and dispatcher.
    Serve {
        /// The port to listen on.
        #[clap(short, long, default_value_t = 4010)]
        port: u16,

        /// Token for the internal operator routes; unset disables them.
        #[clap(long)]
        admin_token: Option<String>,
    },

    /// Run one synchronous ingestion run for a tenant and print the summary.
    SyncNow {
        #[clap(long)]
        tenant: String,
    },

    /// Run one synchronous GC run for a tenant.
    GcNow {
        #[clap(long)]
        tenant: String,
    },

    /// Create a tenant and print its freshly generated API key.
    AddTenant {
        #[clap(long)]
        id: String,

        #[clap(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_BAD_INPUT)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let file_config = match &cli.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };

    match cli.command {
        Commands::Serve { port, admin_token } => {
            let cli_config = CliConfig {
                db_dir: cli.db_dir,
                port,
                admin_token,
            };
            let config = AppConfig::resolve(&cli_config, file_config)?;
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::SyncNow { tenant } => {
            let config = resolve_headless(cli.db_dir, file_config)?;
            one_shot_run(&config, &tenant, RunType::Manual).await
        }
        Commands::GcNow { tenant } => {
            let config = resolve_headless(cli.db_dir, file_config)?;
            one_shot_run(&config, &tenant, RunType::Gc).await
        }
        Commands::AddTenant { id, name } => {
            let config = resolve_headless(cli.db_dir, file_config)?;
            add_tenant(&config, &id, name.as_deref())
        }
    }
}

fn resolve_headless(db_dir: Option<PathBuf>, file_config: Option<FileConfig>) -> Result<AppConfig> {
    let cli_config = CliConfig {
        db_dir,
        port: 0,
        admin_token: None,
    };
    AppConfig::resolve(&cli_config, file_config)
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Opening store database at {:?}", config.store_db_path());
    let store: Arc<dyn TenantStore> = Arc::new(
        SqliteTenantStore::new(config.store_db_path()).context("Failed to open store")?,
    );
    let queue: Arc<dyn RunQueue> = Arc::new(
        SqliteRunQueue::new(config.queue_db_path()).context("Failed to open queue")?,
    );

    // Startup recovery: runs and leases left behind by a dead process.
    let now = chrono::Utc::now().timestamp();
    match store.mark_stale_runs_failed(now) {
        Ok(count) if count > 0 => info!("Marked {} stale runs as failed", count),
        Ok(_) => {}
        Err(e) => error!("Failed to mark stale runs: {}", e),
    }
    match queue.release_expired_leases(now, 0) {
        Ok(sweep) if sweep.released > 0 => {
            info!("Released {} stale queue leases", sweep.released)
        }
        Ok(_) => {}
        Err(e) => error!("Failed to sweep queue leases: {}", e),
    }

    let worker = Arc::new(IngestWorker::new(
        Arc::clone(&store),
        config.ingestion.clone(),
        config.gc.clone(),
    ));

    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        config.scheduler.clone(),
        config.dispatcher.clone(),
    );
    let scheduler_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&worker),
        config.dispatcher.clone(),
    );
    let dispatcher_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let state = ServerState {
        config: ServerConfig {
            admin_token: config.admin_token.clone(),
            run_max_attempts: config.dispatcher.max_attempts,
            worker_timeout: config.dispatcher.worker_timeout,
        },
        start_time: Instant::now(),
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        worker,
    };

    let server_handle = {
        let shutdown = shutdown.clone();
        let port = config.port;
        tokio::spawn(async move { server::run_server(state, port, shutdown).await })
    };

    info!("Ready; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let _ = scheduler_handle.await;
    let _ = dispatcher_handle.await;
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => error!("Server task panicked: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn one_shot_run(config: &AppConfig, tenant_id: &str, run_type: RunType) -> Result<ExitCode> {
    let store: Arc<dyn TenantStore> = match SqliteTenantStore::new(config.store_db_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store: {:#}", e);
            return Ok(ExitCode::from(EXIT_STORAGE_FAILURE));
        }
    };

    if store.get_tenant(tenant_id)?.is_none() {
        error!("Unknown tenant: {}", tenant_id);
        return Ok(ExitCode::from(EXIT_BAD_INPUT));
    }

    let now = chrono::Utc::now().timestamp();
    let run_id = uuid::Uuid::new_v4().to_string();
    let run = FetchRun::new_enqueued(run_id.clone(), run_type, now);
    if let Err(e) = store.insert_run(tenant_id, &run) {
        error!("Failed to create run: {:#}", e);
        return Ok(ExitCode::from(EXIT_STORAGE_FAILURE));
    }

    let worker = IngestWorker::new(
        Arc::clone(&store),
        config.ingestion.clone(),
        config.gc.clone(),
    );
    let descriptor = RunDescriptor {
        tenant_id: tenant_id.to_string(),
        run_type,
        run_id,
    };
    let report = worker.run(&descriptor, CancellationToken::new()).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.status {
        RunStatus::Done => ExitCode::SUCCESS,
        RunStatus::DoneWithErrors => ExitCode::from(EXIT_UPSTREAM_FAILURE),
        RunStatus::Failed if run_type == RunType::Gc => ExitCode::from(EXIT_STORAGE_FAILURE),
        _ => ExitCode::from(EXIT_UPSTREAM_FAILURE),
    })
}

fn add_tenant(config: &AppConfig, tenant_id: &str, name: Option<&str>) -> Result<ExitCode> {
    let store = match SqliteTenantStore::new(config.store_db_path()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open store: {:#}", e);
            return Ok(ExitCode::from(EXIT_STORAGE_FAILURE));
        }
    };

    if store.get_tenant(tenant_id)?.is_some() {
        error!("Tenant already exists: {}", tenant_id);
        return Ok(ExitCode::from(EXIT_BAD_INPUT));
    }

    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let api_key: String = key_bytes.iter().map(|b| format!("{:02x}", b)).collect();

    let tenant = Tenant {
        id: tenant_id.to_string(),
        display_name: name.unwrap_or(tenant_id).to_string(),
        api_key_hash: hash_api_key(&api_key),
        created_at: chrono::Utc::now().timestamp(),
    };
    store.create_tenant(&tenant)?;

    println!("tenant: {}", tenant.id);
    println!("api key: {}", api_key);
    Ok(ExitCode::SUCCESS)
}
