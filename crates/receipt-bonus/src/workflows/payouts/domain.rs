use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflows::receipts::{ReceiptId, UserId};

/// Identifier wrapper for ledger records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Provider-facing deduplication token. Stable across retries of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Derived from the receipt so that duplicated orchestrator invocations share one key.
    /// `generation` only changes when an operator supersedes a failed transaction.
    pub fn for_receipt(receipt_id: &ReceiptId, generation: u32) -> Self {
        Self(format!("rcpt-{}-g{generation}", receipt_id.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Created,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
}

impl PayoutStatus {
    pub const fn label(self) -> &'static str {
        match self {
            PayoutStatus::Created => "created",
            PayoutStatus::InFlight => "in_flight",
            PayoutStatus::Succeeded => "succeeded",
            PayoutStatus::FailedRetryable => "failed_retryable",
            PayoutStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, PayoutStatus::Succeeded | PayoutStatus::FailedPermanent)
    }
}

/// Coarse failure category shown to the end user; provider detail stays in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserFacingReason {
    TemporaryProblem,
    InvalidRecipient,
    Rejected,
}

impl UserFacingReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            UserFacingReason::TemporaryProblem => "temporary_problem",
            UserFacingReason::InvalidRecipient => "invalid_recipient",
            UserFacingReason::Rejected => "rejected",
        }
    }
}

/// Classified failure persisted on the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutFailure {
    pub code: String,
    pub reason: UserFacingReason,
}

/// Input to the transaction state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutEvent {
    SendStarted,
    Confirmed { provider_reference: Option<String> },
    TransientFailure(PayoutFailure),
    PermanentFailure(PayoutFailure),
}

impl PayoutEvent {
    fn label(&self) -> &'static str {
        match self {
            PayoutEvent::SendStarted => "send_started",
            PayoutEvent::Confirmed { .. } => "confirmed",
            PayoutEvent::TransientFailure(_) => "transient_failure",
            PayoutEvent::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// Processing lease held by the worker currently allowed to mutate a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Audit line appended on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PayoutStatus,
    pub to: PayoutStatus,
    pub event: String,
    pub at: DateTime<Utc>,
    pub error_code: Option<String>,
}

/// Ledger record of one payout attempt-chain for a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusTransaction {
    pub transaction_id: TransactionId,
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    /// `None` when no valid number could be resolved for the user.
    pub msisdn: Option<String>,
    pub payee_id: Option<String>,
    /// Minor currency units.
    pub amount_minor: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub idempotency_key: IdempotencyKey,
    pub generation: u32,
    pub provider_reference: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<PayoutFailure>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub in_flight_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when an operator replaced this record with a newer generation.
    pub superseded: bool,
    pub lease: Option<Lease>,
    /// Optimistic concurrency token, bumped by the ledger on every save.
    pub version: u64,
    pub history: Vec<TransitionRecord>,
}

impl BonusTransaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receipt_id: ReceiptId,
        user_id: UserId,
        msisdn: Option<String>,
        payee_id: Option<String>,
        amount_minor: i64,
        currency: String,
        generation: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            idempotency_key: IdempotencyKey::for_receipt(&receipt_id, generation),
            receipt_id,
            user_id,
            msisdn,
            payee_id,
            amount_minor,
            currency,
            status: PayoutStatus::Created,
            generation,
            provider_reference: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: Some(now),
            in_flight_since: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            superseded: false,
            lease: None,
            version: 0,
            history: Vec::new(),
        }
    }

    /// Applies one state-machine event. `max_retries` bounds the transient failures tolerated
    /// before the transaction is failed permanently.
    pub fn apply(
        &mut self,
        event: PayoutEvent,
        at: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<PayoutStatus, TransitionError> {
        let from = self.status;
        let label = event.label();
        let mut error_code = None;

        let to = match (from, event) {
            (PayoutStatus::Created | PayoutStatus::FailedRetryable, PayoutEvent::SendStarted) => {
                self.in_flight_since = Some(at);
                self.next_attempt_at = None;
                PayoutStatus::InFlight
            }
            (PayoutStatus::InFlight, PayoutEvent::Confirmed { provider_reference }) => {
                if provider_reference.is_some() {
                    self.provider_reference = provider_reference;
                }
                self.in_flight_since = None;
                self.completed_at = Some(at);
                PayoutStatus::Succeeded
            }
            (PayoutStatus::InFlight, PayoutEvent::TransientFailure(failure)) => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.in_flight_since = None;
                error_code = Some(failure.code.clone());
                self.last_error = Some(failure);
                if self.retry_count > max_retries {
                    self.completed_at = Some(at);
                    PayoutStatus::FailedPermanent
                } else {
                    PayoutStatus::FailedRetryable
                }
            }
            (status, PayoutEvent::PermanentFailure(failure)) if !status.is_terminal() => {
                self.in_flight_since = None;
                self.next_attempt_at = None;
                self.completed_at = Some(at);
                error_code = Some(failure.code.clone());
                self.last_error = Some(failure);
                PayoutStatus::FailedPermanent
            }
            (status, _) => {
                return Err(TransitionError {
                    from: status,
                    event: label,
                })
            }
        };

        if to == PayoutStatus::FailedPermanent {
            self.next_attempt_at = None;
        }
        self.status = to;
        self.updated_at = at;
        self.history.push(TransitionRecord {
            from,
            to,
            event: label.to_string(),
            at,
            error_code,
        });
        Ok(to)
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.expires_at > now)
    }

    pub fn user_facing_reason(&self) -> Option<UserFacingReason> {
        match self.status {
            PayoutStatus::FailedPermanent => Some(
                self.last_error
                    .as_ref()
                    .map_or(UserFacingReason::Rejected, |failure| failure.reason),
            ),
            _ => None,
        }
    }

    pub fn status_view(&self) -> PayoutStatusView {
        PayoutStatusView {
            transaction_id: self.transaction_id.clone(),
            receipt_id: self.receipt_id.clone(),
            status: self.status.label(),
            amount_minor: self.amount_minor,
            currency: self.currency.clone(),
            retry_count: self.retry_count,
            superseded: self.superseded,
            user_facing_reason: self.user_facing_reason().map(UserFacingReason::as_str),
            next_attempt_at: self.next_attempt_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {event} is not valid in state {}", .from.label())]
pub struct TransitionError {
    pub from: PayoutStatus,
    pub event: &'static str,
}

/// Sanitized representation of a transaction for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutStatusView {
    pub transaction_id: TransactionId,
    pub receipt_id: ReceiptId,
    pub status: &'static str,
    pub amount_minor: i64,
    pub currency: String,
    pub retry_count: u32,
    pub superseded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_facing_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Terminal notification for the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub receipt_id: ReceiptId,
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub status: PayoutStatus,
    pub user_facing_reason: Option<UserFacingReason>,
}

impl PayoutOutcome {
    pub fn from_transaction(transaction: &BonusTransaction) -> Self {
        Self {
            receipt_id: transaction.receipt_id.clone(),
            transaction_id: transaction.transaction_id.clone(),
            user_id: transaction.user_id.clone(),
            status: transaction.status,
            user_facing_reason: transaction.user_facing_reason(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ReconciliationConflict,
    PermanentFailure,
    InvalidRecipient,
}

/// Operator queue item; never resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    pub receipt_id: ReceiptId,
    pub transaction_id: TransactionId,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Success,
    Failure,
}

/// Asynchronous confirmation from the provider. Matched by idempotency key first, then by
/// provider reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutCallback {
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
    #[serde(default)]
    pub provider_reference: Option<String>,
    pub status: CallbackStatus,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Operator request to replace a permanently failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubmitRequest {
    pub operator: String,
    #[serde(default)]
    pub msisdn: Option<String>,
}
