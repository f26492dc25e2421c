use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::ledger::Ledger;
use super::notifier::PayoutNotifier;
use super::orchestrator::{OrchestratorError, PayoutOrchestrator};
use super::provider::PayoutProvider;
use crate::workflows::receipts::ReceiptAccepted;

/// Redeliveries of one acceptance before the consumer gives up on it.
const ACCEPTANCE_RETRIES: usize = 5;

/// Handle to a running background task.
pub struct WorkerHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Signal the task and wait for it to finish its current iteration.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.join.await {
            error!(error = %err, "payout worker task panicked");
        }
    }
}

/// Spawn the periodic sweep that retries due transactions and reconciles stale ones.
pub fn spawn_payout_worker<L, P, N>(
    orchestrator: Arc<PayoutOrchestrator<L, P, N>>,
    interval: Duration,
) -> WorkerHandle
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "payout worker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = orchestrator.retry_due().await {
                        error!(error = %err, "payout retry sweep failed");
                    }
                    if let Err(err) = orchestrator.reconcile_stale().await {
                        error!(error = %err, "payout reconciliation sweep failed");
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("payout worker stopped");
                        break;
                    }
                }
            }
        }
    });

    WorkerHandle {
        cancel: cancel_tx,
        join,
    }
}

/// Spawn the consumer feeding `ReceiptAccepted` events into the orchestrator. Stops when the
/// channel closes or the handle is stopped.
pub fn spawn_acceptance_consumer<L, P, N>(
    orchestrator: Arc<PayoutOrchestrator<L, P, N>>,
    mut events: mpsc::Receiver<ReceiptAccepted>,
) -> WorkerHandle
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => {
                    let Some(event) = received else {
                        info!("acceptance channel closed");
                        break;
                    };
                    let backoff = orchestrator
                        .config()
                        .backoff
                        .builder()
                        .with_max_times(ACCEPTANCE_RETRIES);
                    let handled = (|| orchestrator.handle_acceptance(&event))
                        .retry(backoff)
                        .when(OrchestratorError::is_transient)
                        .notify(|err: &OrchestratorError, delay: Duration| {
                            warn!(
                                receipt_id = %event.receipt_id.0,
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "payout start failed, retrying"
                            );
                        })
                        .await;
                    if let Err(err) = handled {
                        error!(
                            receipt_id = %event.receipt_id.0,
                            error = %err,
                            "failed to start payout for accepted receipt"
                        );
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("acceptance consumer stopped");
                        break;
                    }
                }
            }
        }
    });

    WorkerHandle {
        cancel: cancel_tx,
        join,
    }
}
