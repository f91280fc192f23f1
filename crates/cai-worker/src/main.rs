//! cai-worker entry point.
//!
//! Thin by intention: load config, connect the store, build the components,
//! run the dispatcher until ctrl-c, then give the in-flight request the
//! graceful-shutdown window before aborting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use cai_audit::AuditLog;
use cai_config::WorkerConfig;
use cai_gpu::GpuArbiter;
use cai_inference::{ChatAgent, HttpBackend, ModelBudgets};
use cai_queue::QueueBroker;
use cai_store::Store;
use cai_worker::{spawn_retention_sweep, Dispatcher, SideEffectWriter};

/// Comma-separated YAML config layers, later overriding earlier.
const ENV_CONFIG_PATHS: &str = "CAI_WORKER_CONFIG";

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    let (cfg, config_hash) = load_config()?;
    init_tracing(&cfg);

    info!(
        config_hash = config_hash.as_deref().unwrap_or("defaults"),
        backend = %cfg.backend.base_url,
        chat_model = %cfg.backend.chat_model,
        "cai-worker starting"
    );

    let store = Store::connect_from_env().await?;
    store.migrate().await?;

    let audit = AuditLog::new(&cfg.audit_log_path, true)
        .with_context(|| format!("open audit log at {}", cfg.audit_log_path))?;

    let backend = HttpBackend::new(&cfg.backend).context("build inference backend")?;
    let budgets = ModelBudgets {
        request_timeout: Duration::from_secs(cfg.backend.timeout_secs),
        ..ModelBudgets::default()
    };
    let agent = ChatAgent::new(backend, cfg.backend.chat_model.clone(), budgets);

    let broker = Arc::new(QueueBroker::new(store.clone()));
    let arbiter = Arc::new(GpuArbiter::new());
    let writer = SideEffectWriter::new(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep = spawn_retention_sweep(
        Arc::clone(&broker),
        cfg.retention_days,
        RETENTION_SWEEP_INTERVAL,
    );

    let graceful = Duration::from_secs(cfg.graceful_shutdown_timeout_secs);
    let mut dispatcher = Dispatcher::new(
        Arc::clone(&broker),
        arbiter,
        agent,
        writer,
        audit,
        cfg,
        shutdown_rx,
    );
    let mut loop_handle = tokio::spawn(async move { dispatcher.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; beginning graceful shutdown");
            let _ = shutdown_tx.send(true);

            match tokio::time::timeout(graceful, loop_handle).await {
                Ok(Ok(Ok(()))) => info!("dispatcher drained cleanly"),
                Ok(Ok(Err(e))) => error!(error = %e, "dispatcher exited with error during shutdown"),
                Ok(Err(join_err)) => error!(error = %join_err, "dispatcher task panicked"),
                Err(_) => warn!(
                    timeout_secs = graceful.as_secs(),
                    "graceful shutdown window elapsed; abandoning in-flight request"
                ),
            }
        }
        joined = &mut loop_handle => {
            // The loop only returns on its own when the breaker trips.
            match joined {
                Ok(Ok(())) => info!("dispatcher loop finished"),
                Ok(Err(e)) => {
                    error!(error = %e, "dispatcher halted");
                    sweep.abort();
                    return Err(e);
                }
                Err(join_err) => {
                    sweep.abort();
                    return Err(anyhow::Error::new(join_err).context("dispatcher task panicked"));
                }
            }
        }
    }

    sweep.abort();
    info!("cai-worker shutdown complete");
    Ok(())
}

fn load_config() -> Result<(WorkerConfig, Option<String>)> {
    let raw = std::env::var(ENV_CONFIG_PATHS).unwrap_or_default();
    let paths: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if paths.is_empty() {
        return Ok((WorkerConfig::default(), None));
    }

    let (cfg, loaded) = WorkerConfig::load(&paths)
        .with_context(|| format!("load worker config from {raw}"))?;
    Ok((cfg, Some(loaded.config_hash)))
}

fn init_tracing(cfg: &WorkerConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.as_env_filter().into()),
        )
        .init();
}
