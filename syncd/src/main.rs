//! Daemon entry point: boots the control-plane connection, then the
//! scheduler (C7), job runtime (C8), and webhook processor (C9) as
//! cooperating background tasks on one Tokio runtime (§10.3).

use std::sync::Arc;

use sync_core::crypto::AesCbcSecretCipher;
use sync_core::gateway::ConfigStoreGateway;
use sync_core::pool::{spawn_idle_reclaimer, ConnectionPool};
use sync_core::runtime::JobRuntime;
use sync_core::{scheduler, webhook, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    sync_core::connector::init();

    let config = Config::from_env()?;
    log::info!("starting syncd worker {}", config.worker_id);

    let (control_client, control_connection) =
        tokio_postgres::connect(&config.database_url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = control_connection.await {
            log::error!("control-plane connection closed: {e}");
        }
    });

    let cipher = Arc::new(AesCbcSecretCipher::from_slice(&config.encryption_key)?);
    let gateway = Arc::new(ConfigStoreGateway::new(Arc::new(control_client), cipher));
    let pool = Arc::new(ConnectionPool::new());

    let host = hostname();

    let (execute_tx, mut execute_rx) = tokio::sync::mpsc::channel(64);
    let scheduler_handle = scheduler::spawn(gateway.clone(), execute_tx, config.tick_interval);

    let runtime = Arc::new(JobRuntime::new(gateway.clone(), pool.clone(), config.worker_id.clone(), host));
    let runtime_loop = tokio::spawn({
        let runtime = runtime.clone();
        async move {
            while let Some(event) = execute_rx.recv().await {
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    if let Err(e) = runtime.handle_execute_event(event).await {
                        log::error!("job {} failed: {e}", event.job_id);
                    }
                });
            }
        }
    });

    let runtime_cleanup = sync_core::runtime::spawn_cleanup(gateway.clone());
    let idle_reclaimer = spawn_idle_reclaimer(pool.clone());

    let (webhook_tx, webhook_rx) = tokio::sync::mpsc::channel(256);
    let webhook_loop = tokio::spawn(webhook::run_consumer_loop(gateway.clone(), webhook_rx, webhook::DEFAULT_MAX_CONCURRENCY));
    let webhook_intake = webhook::spawn_pending_poll(gateway.clone(), webhook_tx.clone(), std::time::Duration::from_secs(5));
    let webhook_retry = webhook::spawn_retry_sweep(gateway.clone(), webhook_tx);
    let webhook_cleanup = webhook::spawn_cleanup(gateway.clone());

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    scheduler_handle.abort();
    runtime_loop.abort();
    runtime_cleanup.abort();
    idle_reclaimer.abort();
    webhook_loop.abort();
    webhook_intake.abort();
    webhook_retry.abort();
    webhook_cleanup.abort();

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
