//! ABOUTME: Master process entry point
//! ABOUTME: Wires config, registry, the admin HTTP surface, and the observability surface

use clap::Parser;
use crontab_master::JobManager;
use crontab_obs::ObsState;
use crontab_registry::RegistryClient;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "crontab-master")]
struct Args {
    /// Path to the master configuration file.
    #[arg(long = "config", default_value = "./master.json")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match crontab_config::MasterConfig::load(Some(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load master config: {e}");
            std::process::exit(1);
        }
    };

    crontab_core::telemetry::init_tracing(&config.environment, "crontab-master");
    tracing::info!(api_port = config.api_port, "master starting");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "master exited with error");
        std::process::exit(1);
    }
}

async fn run(config: crontab_config::MasterConfig) -> crontab_core::Result<()> {
    let registry = RegistryClient::connect(
        &config.etcd_endpoints,
        Duration::from_micros(config.etcd_dial_timeout),
    )
    .await?;

    let job_manager = JobManager::new(registry, config.kill_signal_lease_seconds);

    let admin_addr = format!("0.0.0.0:{}", config.api_port);
    let admin_join = tokio::spawn(async move {
        if let Err(e) = crontab_master::start_server(&admin_addr, job_manager).await {
            tracing::error!(error = %e, "admin server exited");
        }
    });

    let obs_state = ObsState::new();
    let obs_addr = format!("0.0.0.0:{}", config.obs_port);
    let obs_join = tokio::spawn(async move {
        if let Err(e) = crontab_obs::start_server(&obs_addr, obs_state).await {
            tracing::error!(error = %e, "observability server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(crontab_core::Error::Io)?;
    tracing::info!("shutdown signal received");

    admin_join.abort();
    obs_join.abort();

    Ok(())
}
