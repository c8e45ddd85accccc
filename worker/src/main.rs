//! ABOUTME: Worker process entry point
//! ABOUTME: Wires config, registry, watcher, scheduler, lock, executor, and log sink

use clap::Parser;
use crontab_logsink::{LogSink, MongoLogStore};
use crontab_obs::ObsState;
use crontab_registry::RegistryClient;
use crontab_scheduler::{JobLocker, SchedulerConfig};
use crontab_watcher::JobCatalogWatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "crontab-worker")]
struct Args {
    /// Path to the worker configuration file.
    #[arg(long = "config", default_value = "./worker.json")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match crontab_config::WorkerConfig::load(Some(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load worker config: {e}");
            std::process::exit(1);
        }
    };

    crontab_core::telemetry::init_tracing(&config.environment, "crontab-worker");
    tracing::info!(%config, "worker starting");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "worker exited with error");
        std::process::exit(1);
    }
}

async fn run(config: crontab_config::WorkerConfig) -> crontab_core::Result<()> {
    let registry = RegistryClient::connect(
        &config.etcd_endpoints,
        Duration::from_micros(config.etcd_dial_timeout),
    )
    .await?;

    let log_store = MongoLogStore::connect(
        &config.mongodb_uri,
        &config.mongodb_database,
        &config.mongodb_collection,
        Duration::from_millis(config.mongodb_connect_timeout),
    )
    .await?;

    let (log_sink, _log_sink_join) = LogSink::spawn(
        Arc::new(log_store),
        config.job_log_batch_size,
        Duration::from_millis(config.job_log_commit_timeout),
        config.log_channel_capacity,
    );

    let lock_manager = crontab_lock::DistributedLockManager::new(
        registry.clone(),
        config.lock_lease_seconds,
    );
    let locker: Arc<dyn JobLocker> = Arc::new(lock_manager);

    let scheduler_config = SchedulerConfig {
        job_event_channel_capacity: config.job_event_channel_capacity,
        job_result_channel_capacity: config.job_result_channel_capacity,
        kill_channel_capacity: config.job_event_channel_capacity,
    };
    let (scheduler, _scheduler_join) = crontab_scheduler::spawn(scheduler_config, locker, log_sink);

    let watch_cancel = CancellationToken::new();
    let watcher = JobCatalogWatcher::new(registry);
    let _catalog_watch_join =
        watcher.spawn_catalog_watch(scheduler.event_sender(), watch_cancel.clone());
    let _kill_watch_join =
        watcher.spawn_kill_watch(scheduler.kill_sender(), watch_cancel.clone());

    let obs_state = ObsState::new();
    let obs_addr = format!("0.0.0.0:{}", config.obs_port);
    let obs_join = tokio::spawn(async move {
        if let Err(e) = crontab_obs::start_server(&obs_addr, obs_state).await {
            tracing::error!(error = %e, "observability server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| crontab_core::Error::Io(e))?;
    tracing::info!("shutdown signal received");

    watch_cancel.cancel();
    obs_join.abort();

    Ok(())
}
