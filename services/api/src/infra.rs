use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use receipt_bonus::store::{InMemoryLedger, InMemoryReceiptStore};
use receipt_bonus::workflows::payouts::{
    IdempotencyKey, Msisdn, NotifyError, OperatorAlert, PayoutNotifier, PayoutOrchestrator,
    PayoutOutcome, PayoutProvider, PayoutRequest, ProviderAck, ProviderError, ProviderStatus,
};
use receipt_bonus::workflows::receipts::{
    CatalogEntry, EventPublisher, PublishError, ReceiptAccepted, ReceiptEvent,
    ReceiptIntakeService, SkuCode,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) type ReceiptService = ReceiptIntakeService<InMemoryReceiptStore, ChannelPublisher>;
pub(crate) type Orchestrator = PayoutOrchestrator<InMemoryLedger, SandboxProvider, LogNotifier>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Outbox publisher for a single process: decisions are logged for the messaging layer and
/// accepted receipts are handed to the payout consumer through a bounded channel.
#[derive(Clone)]
pub(crate) struct ChannelPublisher {
    accepted: mpsc::Sender<ReceiptAccepted>,
}

impl ChannelPublisher {
    pub(crate) fn new(accepted: mpsc::Sender<ReceiptAccepted>) -> Self {
        Self { accepted }
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: &ReceiptEvent) -> Result<(), PublishError> {
        match event {
            ReceiptEvent::DecisionMade(made) => {
                info!(
                    receipt_id = %made.receipt_id.0,
                    user_id = %made.user_id.0,
                    decision = ?made.decision,
                    reason_code = made.reason_code.map_or("none", |reason| reason.as_str()),
                    "decision published"
                );
                Ok(())
            }
            ReceiptEvent::ReceiptAccepted(accepted) => self
                .accepted
                .try_send(accepted.clone())
                .map_err(|err| PublishError::Transport(err.to_string())),
        }
    }
}

/// Provider stand-in that settles every request synchronously and honours idempotency keys.
#[derive(Default)]
pub(crate) struct SandboxProvider {
    settled: Mutex<HashMap<IdempotencyKey, String>>,
}

impl SandboxProvider {
    pub(crate) fn charges(&self) -> usize {
        self.settled.lock().map(|settled| settled.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PayoutProvider for SandboxProvider {
    async fn submit(&self, request: &PayoutRequest) -> Result<ProviderAck, ProviderError> {
        let recipient = Msisdn::parse(&request.msisdn).map_err(|_| {
            ProviderError::InvalidRecipient {
                code: "invalid_msisdn".to_string(),
            }
        })?;

        let mut settled = self
            .settled
            .lock()
            .map_err(|_| ProviderError::Unavailable { status: 500 })?;
        let reference = settled
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| format!("sbx-{}", Uuid::new_v4()))
            .clone();

        info!(
            idempotency_key = %request.idempotency_key.0,
            msisdn = %recipient.masked(),
            amount_minor = request.amount_minor_units,
            currency = %request.currency,
            provider_reference = %reference,
            "sandbox payout settled"
        );
        Ok(ProviderAck::Completed {
            provider_reference: reference,
        })
    }

    async fn status(&self, key: &IdempotencyKey) -> Result<ProviderStatus, ProviderError> {
        let settled = self
            .settled
            .lock()
            .map_err(|_| ProviderError::Unavailable { status: 500 })?;
        Ok(match settled.get(key) {
            Some(reference) => ProviderStatus::Succeeded {
                provider_reference: Some(reference.clone()),
            },
            None => ProviderStatus::Unknown,
        })
    }
}

/// Writes payout outcomes and operator alerts to the log stream.
#[derive(Default)]
pub(crate) struct LogNotifier;

impl PayoutNotifier for LogNotifier {
    fn publish_outcome(&self, outcome: &PayoutOutcome) -> Result<(), NotifyError> {
        info!(
            receipt_id = %outcome.receipt_id.0,
            user_id = %outcome.user_id.0,
            status = outcome.status.label(),
            user_facing_reason = outcome.user_facing_reason.map_or("none", |reason| reason.as_str()),
            "payout outcome"
        );
        Ok(())
    }

    fn raise_alert(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        warn!(
            kind = ?alert.kind,
            receipt_id = %alert.receipt_id.0,
            transaction_id = %alert.transaction_id.0,
            details = ?alert.details,
            "operator alert raised"
        );
        Ok(())
    }
}

/// Products participating in the promotion until an external catalog feed is wired in.
pub(crate) fn seed_catalog() -> Vec<CatalogEntry> {
    let entry = |sku: &str, aliases: &[&str]| CatalogEntry {
        sku: SkuCode(sku.to_string()),
        aliases: aliases.iter().map(|alias| alias.to_string()).collect(),
        keywords: Vec::new(),
        active: true,
    };

    vec![
        // Any other product printed with the manufacturer marker.
        CatalogEntry {
            sku: SkuCode("DAR000".to_string()),
            aliases: Vec::new(),
            keywords: [
                "Дарниця", "Дарница", "Дарниці", "Дарницю", "Дарницею", "Darnitsa", "Darnitsia",
            ]
            .iter()
            .map(|keyword| keyword.to_string())
            .collect(),
            active: true,
        },
        entry(
            "DAR001",
            &["Citramon Darnitsa", "Цитрамон Дарниця", "Цитрамон-Дарниця"],
        ),
        entry("DAR002", &["Analgin Darnitsa", "Анальгін Дарниця"]),
        entry("DAR003", &["Corvalol Darnitsa", "Корвалол Дарниця"]),
        entry("DAR004", &["Ascorbic acid Darnitsa", "Аскорбінова кислота"]),
        entry("DAR005", &["Ibuprofen Darnitsa", "Ібупрофен Дарниця"]),
    ]
}
