use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::clock::{Clock, FixedClock};
use crate::store::{InMemoryLedger, InMemoryRecipientDirectory};
use crate::workflows::payouts::{
    payout_router, BackoffPolicy, DirectoryError, IdempotencyKey, NotifyError, OperatorAlert,
    PayoutConfig, PayoutNotifier, PayoutOrchestrator, PayoutOutcome, PayoutProvider,
    PayoutRequest, ProviderAck, ProviderError, ProviderStatus, RecipientDirectory,
};
use crate::workflows::receipts::{ReceiptAccepted, ReceiptId, UserId};

pub(super) type TestOrchestrator =
    PayoutOrchestrator<InMemoryLedger, ScriptedProvider, RecordingNotifier>;

pub(super) const CALLBACK_TOKEN: &str = "provider-secret";

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

pub(super) fn payout_config() -> PayoutConfig {
    PayoutConfig {
        backoff: BackoffPolicy {
            jitter: false,
            ..BackoffPolicy::default()
        },
        callback_token: Some(CALLBACK_TOKEN.to_string()),
        worker_id: "test-worker".to_string(),
        ..PayoutConfig::default()
    }
}

pub(super) fn accepted(receipt_id: &str, user_id: &str) -> ReceiptAccepted {
    ReceiptAccepted {
        receipt_id: ReceiptId(receipt_id.to_string()),
        user_id: UserId(user_id.to_string()),
        accepted_at: now(),
    }
}

/// Provider double that answers from scripted queues. An empty submit queue completes the
/// payout; an empty status queue reports the request as still pending.
#[derive(Default)]
pub(super) struct ScriptedProvider {
    submit_script: Mutex<VecDeque<Result<ProviderAck, ProviderError>>>,
    status_script: Mutex<VecDeque<Result<ProviderStatus, ProviderError>>>,
    requests: Mutex<Vec<PayoutRequest>>,
    status_queries: Mutex<Vec<IdempotencyKey>>,
}

impl ScriptedProvider {
    pub(super) fn push_submit(&self, response: Result<ProviderAck, ProviderError>) {
        self.submit_script
            .lock()
            .expect("script mutex poisoned")
            .push_back(response);
    }

    pub(super) fn push_status(&self, response: Result<ProviderStatus, ProviderError>) {
        self.status_script
            .lock()
            .expect("script mutex poisoned")
            .push_back(response);
    }

    pub(super) fn requests(&self) -> Vec<PayoutRequest> {
        self.requests.lock().expect("requests mutex poisoned").clone()
    }

    pub(super) fn submit_count(&self) -> usize {
        self.requests().len()
    }

    pub(super) fn status_queries(&self) -> Vec<IdempotencyKey> {
        self.status_queries
            .lock()
            .expect("queries mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl PayoutProvider for ScriptedProvider {
    async fn submit(&self, request: &PayoutRequest) -> Result<ProviderAck, ProviderError> {
        let sequence = {
            let mut requests = self.requests.lock().expect("requests mutex poisoned");
            requests.push(request.clone());
            requests.len()
        };
        tokio::task::yield_now().await;

        let scripted = self
            .submit_script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ProviderAck::Completed {
                provider_reference: format!("pm-{sequence}"),
            })
        })
    }

    async fn status(&self, key: &IdempotencyKey) -> Result<ProviderStatus, ProviderError> {
        self.status_queries
            .lock()
            .expect("queries mutex poisoned")
            .push(key.clone());
        let scripted = self
            .status_script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        scripted.unwrap_or(Ok(ProviderStatus::Pending))
    }
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    outcomes: Mutex<Vec<PayoutOutcome>>,
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingNotifier {
    pub(super) fn outcomes(&self) -> Vec<PayoutOutcome> {
        self.outcomes.lock().expect("outcomes mutex poisoned").clone()
    }

    pub(super) fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().expect("alerts mutex poisoned").clone()
    }
}

impl PayoutNotifier for RecordingNotifier {
    fn publish_outcome(&self, outcome: &PayoutOutcome) -> Result<(), NotifyError> {
        self.outcomes
            .lock()
            .expect("outcomes mutex poisoned")
            .push(outcome.clone());
        Ok(())
    }

    fn raise_alert(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .expect("alerts mutex poisoned")
            .push(alert.clone());
        Ok(())
    }
}

pub(super) struct Harness {
    pub(super) orchestrator: Arc<TestOrchestrator>,
    pub(super) ledger: Arc<InMemoryLedger>,
    pub(super) provider: Arc<ScriptedProvider>,
    pub(super) notifier: Arc<RecordingNotifier>,
    pub(super) recipients: Arc<InMemoryRecipientDirectory>,
    pub(super) clock: Arc<FixedClock>,
}

impl Harness {
    pub(super) fn router(&self) -> axum::Router {
        payout_router(self.orchestrator.clone())
    }

    pub(super) fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Orchestrator over in-memory stores with `user-1` registered as a Kyivstar subscriber.
pub(super) fn harness() -> Harness {
    harness_with(payout_config())
}

pub(super) fn harness_with(config: PayoutConfig) -> Harness {
    let recipients = Arc::new(InMemoryRecipientDirectory::new());
    harness_over(config, recipients.clone(), recipients)
}

/// Like [`harness`], but the directory lookup fails `failures` times before answering.
pub(super) fn harness_with_flaky_directory(failures: usize) -> Harness {
    let recipients = Arc::new(InMemoryRecipientDirectory::new());
    let flaky = Arc::new(FlakyDirectory {
        inner: recipients.clone(),
        failures: AtomicUsize::new(failures),
    });
    harness_over(payout_config(), recipients, flaky)
}

fn harness_over(
    config: PayoutConfig,
    recipients: Arc<InMemoryRecipientDirectory>,
    directory: Arc<dyn RecipientDirectory>,
) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let provider = Arc::new(ScriptedProvider::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(FixedClock::new(now()));
    recipients
        .register(UserId("user-1".to_string()), "067 123 45 67")
        .expect("register recipient");

    let orchestrator = Arc::new(PayoutOrchestrator::new(
        ledger.clone(),
        provider.clone(),
        notifier.clone(),
        directory,
        clock.clone(),
        config,
    ));

    Harness {
        orchestrator,
        ledger,
        provider,
        notifier,
        recipients,
        clock,
    }
}

struct FlakyDirectory {
    inner: Arc<InMemoryRecipientDirectory>,
    failures: AtomicUsize,
}

impl RecipientDirectory for FlakyDirectory {
    fn msisdn_for(&self, user_id: &UserId) -> Result<Option<String>, DirectoryError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DirectoryError::Unavailable("connection reset".to_string()));
        }
        self.inner.msisdn_for(user_id)
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
