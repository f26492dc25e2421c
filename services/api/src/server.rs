use crate::cli::ServeArgs;
use crate::infra::{
    seed_catalog, AppState, ChannelPublisher, LogNotifier, ReceiptService, SandboxProvider,
};
use crate::routes::with_receipt_bonus_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use receipt_bonus::clock::SystemClock;
use receipt_bonus::config::AppConfig;
use receipt_bonus::error::AppError;
use receipt_bonus::store::{InMemoryLedger, InMemoryReceiptStore, InMemoryRecipientDirectory};
use receipt_bonus::telemetry;
use receipt_bonus::workflows::payouts::{
    spawn_acceptance_consumer, spawn_payout_worker, PayoutOrchestrator,
};
use receipt_bonus::workflows::receipts::{CatalogCache, ReceiptIntakeService, StaticCatalogSource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Accepted receipts buffered between intake and the payout consumer.
const ACCEPTANCE_CHANNEL_CAPACITY: usize = 1024;
const OUTBOX_REDISPATCH_INTERVAL: Duration = Duration::from_secs(2);
const OUTBOX_REDISPATCH_BATCH: usize = 128;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let clock = Arc::new(SystemClock);
    let catalog = Arc::new(CatalogCache::primed(Arc::new(StaticCatalogSource::new(
        seed_catalog(),
    )))?);
    let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPTANCE_CHANNEL_CAPACITY);

    let receipts = Arc::new(ReceiptIntakeService::new(
        Arc::new(InMemoryReceiptStore::new()),
        Arc::new(ChannelPublisher::new(accepted_tx)),
        catalog.clone(),
        config.matcher.clone(),
        config.eligibility.clone(),
        clock.clone(),
    ));

    let recipients = Arc::new(InMemoryRecipientDirectory::new());
    let sweep_interval = config.payout.sweep_interval;
    let payouts = Arc::new(PayoutOrchestrator::new(
        Arc::new(InMemoryLedger::new()),
        Arc::new(SandboxProvider::default()),
        Arc::new(LogNotifier),
        recipients.clone(),
        clock,
        config.payout.clone(),
    ));

    let consumer = spawn_acceptance_consumer(payouts.clone(), accepted_rx);
    let sweeper = spawn_payout_worker(payouts.clone(), sweep_interval);
    let (stop_tx, stop_rx) = watch::channel(false);
    let redispatch = spawn_outbox_redispatch(receipts.clone(), stop_rx.clone());
    let refresher = spawn_catalog_refresh(catalog, config.catalog.refresh_interval, stop_rx);

    let app = with_receipt_bonus_routes(receipts, payouts, recipients)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "receipt bonus service ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    readiness_flag.store(false, Ordering::Release);
    let _ = stop_tx.send(true);
    for task in [redispatch, refresher] {
        if let Err(err) = task.await {
            error!(error = %err, "maintenance task panicked");
        }
    }
    sweeper.shutdown().await;
    consumer.shutdown().await;

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Re-publishes outbox entries whose first dispatch failed.
fn spawn_outbox_redispatch(
    receipts: Arc<ReceiptService>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OUTBOX_REDISPATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match receipts.dispatch_outbox(OUTBOX_REDISPATCH_BATCH) {
                        Ok(0) => {}
                        Ok(published) => info!(published, "outbox entries re-dispatched"),
                        Err(err) => error!(error = %err, "outbox re-dispatch failed"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_catalog_refresh(
    catalog: Arc<CatalogCache>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    // The cache logs both outcomes and keeps the previous snapshot on failure.
                    let _ = catalog.refresh();
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
