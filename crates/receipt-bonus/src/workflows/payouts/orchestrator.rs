use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use metrics::counter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::PayoutConfig;
use super::domain::{
    AlertKind, BonusTransaction, CallbackStatus, OperatorAlert, PayoutCallback, PayoutEvent,
    PayoutFailure, PayoutOutcome, PayoutStatus, ResubmitRequest, TransactionId, TransitionError,
    UserFacingReason,
};
use super::ledger::{CreateOutcome, Ledger, LedgerError};
use super::msisdn::{Msisdn, MsisdnError};
use super::notifier::{DirectoryError, PayoutNotifier, RecipientDirectory};
use super::provider::{
    PayoutMetadata, PayoutProvider, PayoutRequest, ProviderAck, ProviderError, ProviderStatus,
};
use crate::clock::Clock;
use crate::telemetry::AUDIT_TARGET;
use crate::workflows::receipts::{ReceiptAccepted, ReceiptId, UserId};

/// Records pulled per sweep of `retry_due` / `reconcile_stale`.
const SWEEP_BATCH: usize = 100;

/// How a provider callback was applied to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDisposition {
    Applied(PayoutStatus),
    /// Same confirmation already recorded.
    Duplicate,
    /// Failure report for a transaction that is not awaiting confirmation.
    Ignored,
    /// Callback contradicts a terminal local state; raised to operators, state preserved.
    Conflict,
}

/// Drives bonus transactions from acceptance to a terminal state.
pub struct PayoutOrchestrator<L, P, N> {
    ledger: Arc<L>,
    provider: Arc<P>,
    notifier: Arc<N>,
    recipients: Arc<dyn RecipientDirectory>,
    clock: Arc<dyn Clock>,
    config: PayoutConfig,
}

impl<L, P, N> PayoutOrchestrator<L, P, N>
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    pub fn new(
        ledger: Arc<L>,
        provider: Arc<P>,
        notifier: Arc<N>,
        recipients: Arc<dyn RecipientDirectory>,
        clock: Arc<dyn Clock>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            notifier,
            recipients,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PayoutConfig {
        &self.config
    }

    /// Create (at most once per receipt) and attempt the payout for an accepted receipt.
    /// Safe under duplicate and concurrent delivery of the same event.
    pub async fn handle_acceptance(
        &self,
        event: &ReceiptAccepted,
    ) -> Result<BonusTransaction, OrchestratorError> {
        if let Some(existing) = self.ledger.active_for_receipt(&event.receipt_id)? {
            debug!(
                receipt_id = %event.receipt_id.0,
                transaction_id = %existing.transaction_id.0,
                "acceptance redelivered, transaction already exists"
            );
            return self.resume(existing).await;
        }

        // The recipient is resolved on each attempt, so a directory outage cannot drop the
        // acceptance before the transaction exists.
        let transaction = self.new_transaction(
            event.receipt_id.clone(),
            event.user_id.clone(),
            None,
            0,
            self.clock.now(),
        );

        match self.ledger.create_if_absent(transaction)? {
            CreateOutcome::Created(created) => {
                info!(
                    receipt_id = %created.receipt_id.0,
                    transaction_id = %created.transaction_id.0,
                    idempotency_key = %created.idempotency_key.0,
                    next_attempt_at = ?created.next_attempt_at,
                    "bonus transaction created"
                );
                self.resume(created).await
            }
            CreateOutcome::Existing(existing) => self.resume(existing).await,
        }
    }

    /// Attempt every transaction whose next attempt is due.
    pub async fn retry_due(&self) -> Result<usize, OrchestratorError> {
        let now = self.clock.now();
        let due = self.ledger.due_for_attempt(now, SWEEP_BATCH)?;
        let mut attempted = 0;
        for transaction in due {
            match self.attempt(&transaction.transaction_id).await {
                Ok(_) => attempted += 1,
                Err(err) => warn!(
                    transaction_id = %transaction.transaction_id.0,
                    error = %err,
                    "scheduled payout attempt failed"
                ),
            }
        }
        Ok(attempted)
    }

    /// Query the provider for `in_flight` transactions older than the grace period.
    pub async fn reconcile_stale(&self) -> Result<usize, OrchestratorError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.reconcile_grace);
        let stale = self.ledger.stale_in_flight(cutoff, now, SWEEP_BATCH)?;
        let mut reconciled = 0;
        for transaction in stale {
            match self.reconcile(&transaction.transaction_id).await {
                Ok(true) => reconciled += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    transaction_id = %transaction.transaction_id.0,
                    error = %err,
                    "reconciliation failed"
                ),
            }
        }
        Ok(reconciled)
    }

    /// Apply an asynchronous provider confirmation. Callbacks may arrive in any order and are
    /// matched by idempotency key, then provider reference.
    pub async fn handle_callback(
        &self,
        callback: &PayoutCallback,
    ) -> Result<CallbackDisposition, OrchestratorError> {
        let found = match &callback.idempotency_key {
            Some(key) => self.ledger.find_by_idempotency_key(key)?,
            None => None,
        };
        let found = match (found, &callback.provider_reference) {
            (Some(transaction), _) => Some(transaction),
            (None, Some(reference)) => self.ledger.find_by_provider_reference(reference)?,
            (None, None) => None,
        };
        let transaction = found.ok_or(OrchestratorError::UnknownCallback)?;

        let now = self.clock.now();
        let owner = self.lease_owner();
        let mut transaction = self
            .ledger
            .acquire_lease(&transaction.transaction_id, &owner, now, self.lease_ttl())?
            .ok_or(OrchestratorError::Busy)?;

        let disposition = match (transaction.status, callback.status) {
            (PayoutStatus::InFlight, CallbackStatus::Success) => {
                let event = PayoutEvent::Confirmed {
                    provider_reference: callback.provider_reference.clone(),
                };
                let settled = self.settle(transaction, Some(event), now, "succeeded")?;
                CallbackDisposition::Applied(settled.status)
            }
            (PayoutStatus::InFlight, CallbackStatus::Failure) => {
                let error = ProviderError::from_code(callback.error_code.as_deref().unwrap_or(""));
                let outcome = outcome_label(&error);
                let settled =
                    self.settle(transaction, Some(self.failure_event(&error)), now, outcome)?;
                CallbackDisposition::Applied(settled.status)
            }
            (PayoutStatus::Succeeded, CallbackStatus::Success) => {
                self.release(transaction)?;
                CallbackDisposition::Duplicate
            }
            (PayoutStatus::Created | PayoutStatus::FailedRetryable, CallbackStatus::Failure)
            | (PayoutStatus::FailedPermanent, CallbackStatus::Failure) => {
                self.release(transaction)?;
                CallbackDisposition::Ignored
            }
            (status, reported) => {
                transaction.lease = None;
                let transaction = self.ledger.save(transaction)?;
                self.raise_conflict(&transaction, status, reported, callback);
                CallbackDisposition::Conflict
            }
        };

        Ok(disposition)
    }

    /// Operator path for a permanently failed transaction: the old record is kept as
    /// superseded and a new generation with a fresh idempotency key is attempted.
    pub async fn resubmit(
        &self,
        transaction_id: &TransactionId,
        request: &ResubmitRequest,
    ) -> Result<BonusTransaction, OrchestratorError> {
        let operator = request.operator.trim();
        if operator.is_empty() {
            return Err(OrchestratorError::MissingOperator);
        }

        let previous = self
            .ledger
            .fetch(transaction_id)?
            .ok_or(OrchestratorError::NotFound)?;
        if previous.superseded || previous.status != PayoutStatus::FailedPermanent {
            return Err(OrchestratorError::NotResubmittable {
                status: previous.status,
                superseded: previous.superseded,
            });
        }

        let msisdn = match &request.msisdn {
            Some(raw) => Msisdn::parse(raw)?,
            None => self
                .resolve_recipient(&previous.user_id)?
                .ok_or_else(|| MsisdnError::Unrecognized(String::new()))?,
        };

        let now = self.clock.now();
        let replacement = self.new_transaction(
            previous.receipt_id.clone(),
            previous.user_id.clone(),
            Some(&msisdn),
            previous.generation + 1,
            now,
        );
        let created = self
            .ledger
            .supersede(&previous.transaction_id, previous.version, replacement)?;

        info!(
            target: AUDIT_TARGET,
            operator = %operator,
            receipt_id = %created.receipt_id.0,
            superseded = %previous.transaction_id.0,
            transaction_id = %created.transaction_id.0,
            generation = created.generation,
            "payout resubmitted"
        );

        self.resume(created).await
    }

    pub fn transactions_for_receipt(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Vec<BonusTransaction>, OrchestratorError> {
        Ok(self.ledger.history_for_receipt(receipt_id)?)
    }

    async fn resume(
        &self,
        transaction: BonusTransaction,
    ) -> Result<BonusTransaction, OrchestratorError> {
        let now = self.clock.now();
        let due = transaction
            .next_attempt_at
            .is_some_and(|next| next <= now);
        let sendable = matches!(
            transaction.status,
            PayoutStatus::Created | PayoutStatus::FailedRetryable
        );
        if due && sendable && !transaction.superseded {
            self.attempt(&transaction.transaction_id).await
        } else {
            Ok(transaction)
        }
    }

    pub(crate) async fn attempt(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<BonusTransaction, OrchestratorError> {
        let now = self.clock.now();
        let owner = self.lease_owner();
        let Some(mut transaction) =
            self.ledger
                .acquire_lease(transaction_id, &owner, now, self.lease_ttl())?
        else {
            debug!(transaction_id = %transaction_id.0, "transaction leased elsewhere");
            return self
                .ledger
                .fetch(transaction_id)?
                .ok_or(OrchestratorError::NotFound);
        };

        let sendable = matches!(
            transaction.status,
            PayoutStatus::Created | PayoutStatus::FailedRetryable
        );
        // A sweep snapshot may predate a backoff scheduled by another worker.
        let due = transaction
            .next_attempt_at
            .is_some_and(|next| next <= now);
        if !sendable || !due || transaction.superseded {
            return self.release(transaction);
        }

        let msisdn = match transaction.msisdn.clone() {
            Some(msisdn) => msisdn,
            None => match self.resolve_recipient(&transaction.user_id) {
                Ok(Some(resolved)) => {
                    transaction.payee_id = self.config.payees.payee_for(&resolved);
                    transaction.msisdn = Some(resolved.as_str().to_string());
                    resolved.as_str().to_string()
                }
                Ok(None) => {
                    let failure = PayoutFailure {
                        code: "invalid_recipient".to_string(),
                        reason: UserFacingReason::InvalidRecipient,
                    };
                    return self.settle(
                        transaction,
                        Some(PayoutEvent::PermanentFailure(failure)),
                        now,
                        "invalid_recipient",
                    );
                }
                Err(err) => {
                    let delay = self.config.backoff.delay_for_attempt(transaction.retry_count);
                    let resume_at = now + to_chrono(delay);
                    transaction.next_attempt_at = Some(resume_at);
                    warn!(
                        transaction_id = %transaction.transaction_id.0,
                        resume_at = %resume_at,
                        error = %err,
                        "recipient lookup failed, attempt deferred"
                    );
                    return self.release(transaction);
                }
            },
        };

        if self.budget_exhausted(now)? {
            let resume_at = next_utc_midnight(now);
            transaction.next_attempt_at = Some(resume_at);
            info!(
                transaction_id = %transaction.transaction_id.0,
                resume_at = %resume_at,
                "daily payout budget exhausted, attempt deferred"
            );
            return self.release(transaction);
        }

        transaction.apply(PayoutEvent::SendStarted, now, self.config.max_retries)?;
        let mut transaction = self.ledger.save(transaction)?;

        let request = PayoutRequest {
            idempotency_key: transaction.idempotency_key.clone(),
            msisdn,
            amount_minor_units: transaction.amount_minor,
            currency: transaction.currency.clone(),
            payee_id: transaction.payee_id.clone(),
            metadata: PayoutMetadata {
                receipt_id: transaction.receipt_id.clone(),
                transaction_id: transaction.transaction_id.clone(),
            },
        };
        let result =
            match tokio::time::timeout(self.config.provider_timeout, self.provider.submit(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

        let at = self.clock.now();
        match result {
            Ok(ProviderAck::Completed { provider_reference }) => {
                let event = PayoutEvent::Confirmed {
                    provider_reference: Some(provider_reference),
                };
                self.settle(transaction, Some(event), at, "succeeded")
            }
            Ok(ProviderAck::Accepted { provider_reference }) => {
                if provider_reference.is_some() {
                    transaction.provider_reference = provider_reference;
                }
                self.settle(transaction, None, at, "accepted")
            }
            Err(err) => {
                let outcome = outcome_label(&err);
                warn!(
                    transaction_id = %transaction.transaction_id.0,
                    retry_count = transaction.retry_count,
                    error = %err,
                    "payout attempt failed"
                );
                self.settle(transaction, Some(self.failure_event(&err)), at, outcome)
            }
        }
    }

    /// Returns `true` when the transaction left `in_flight`.
    async fn reconcile(&self, transaction_id: &TransactionId) -> Result<bool, OrchestratorError> {
        let now = self.clock.now();
        let owner = self.lease_owner();
        let Some(mut transaction) =
            self.ledger
                .acquire_lease(transaction_id, &owner, now, self.lease_ttl())?
        else {
            return Ok(false);
        };
        if transaction.status != PayoutStatus::InFlight {
            self.release(transaction)?;
            return Ok(false);
        }

        let status = match tokio::time::timeout(
            self.config.provider_timeout,
            self.provider.status(&transaction.idempotency_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        let at = self.clock.now();
        let settled = match status {
            Ok(ProviderStatus::Succeeded { provider_reference }) => self.settle(
                transaction,
                Some(PayoutEvent::Confirmed { provider_reference }),
                at,
                "succeeded",
            )?,
            Ok(ProviderStatus::Failed { code }) => {
                let err = ProviderError::from_code(&code);
                let outcome = outcome_label(&err);
                self.settle(transaction, Some(self.failure_event(&err)), at, outcome)?
            }
            Ok(ProviderStatus::Unknown) => {
                // Never reached the provider; resend later under the same key.
                let failure = PayoutFailure {
                    code: "not_received".to_string(),
                    reason: UserFacingReason::TemporaryProblem,
                };
                self.settle(
                    transaction,
                    Some(PayoutEvent::TransientFailure(failure)),
                    at,
                    "transient_failure",
                )?
            }
            Ok(ProviderStatus::Pending) => {
                transaction.in_flight_since = Some(at);
                self.release(transaction)?
            }
            Err(err) => {
                warn!(
                    transaction_id = %transaction.transaction_id.0,
                    error = %err,
                    "provider status query failed, will retry on next sweep"
                );
                self.release(transaction)?
            }
        };

        info!(
            transaction_id = %settled.transaction_id.0,
            status = settled.status.label(),
            "in-flight transaction reconciled"
        );
        Ok(settled.status != PayoutStatus::InFlight)
    }

    /// Apply the event (if any), schedule the next retry, release the lease, persist and notify.
    fn settle(
        &self,
        mut transaction: BonusTransaction,
        event: Option<PayoutEvent>,
        at: DateTime<Utc>,
        outcome: &'static str,
    ) -> Result<BonusTransaction, OrchestratorError> {
        if let Some(event) = event {
            if let PayoutEvent::TransientFailure(failure) = &event {
                counter!(
                    "payout_transient_failures_total",
                    "kind" => failure.code.clone()
                )
                .increment(1);
            }
            transaction.apply(event, at, self.config.max_retries)?;
        }
        if transaction.status == PayoutStatus::FailedRetryable {
            let attempt = transaction.retry_count.saturating_sub(1);
            let delay = self.config.backoff.delay_for_attempt(attempt);
            transaction.next_attempt_at = Some(at + to_chrono(delay));
        }

        transaction.lease = None;
        let saved = self.ledger.save(transaction)?;
        counter!("payout_attempts_total", "outcome" => outcome).increment(1);

        info!(
            receipt_id = %saved.receipt_id.0,
            transaction_id = %saved.transaction_id.0,
            status = saved.status.label(),
            retry_count = saved.retry_count,
            next_attempt_at = ?saved.next_attempt_at,
            "payout transaction updated"
        );

        if saved.status.is_terminal() {
            self.notify_terminal(&saved);
        }
        Ok(saved)
    }

    fn release(&self, mut transaction: BonusTransaction) -> Result<BonusTransaction, OrchestratorError> {
        transaction.lease = None;
        Ok(self.ledger.save(transaction)?)
    }

    fn failure_event(&self, error: &ProviderError) -> PayoutEvent {
        if error.is_transient() {
            PayoutEvent::TransientFailure(error.to_failure())
        } else {
            PayoutEvent::PermanentFailure(error.to_failure())
        }
    }

    fn notify_terminal(&self, transaction: &BonusTransaction) {
        let outcome = PayoutOutcome::from_transaction(transaction);
        if let Err(err) = self.notifier.publish_outcome(&outcome) {
            warn!(
                transaction_id = %transaction.transaction_id.0,
                error = %err,
                "payout outcome notification failed"
            );
        }

        if transaction.status != PayoutStatus::FailedPermanent {
            return;
        }
        let kind = match transaction.user_facing_reason() {
            Some(UserFacingReason::InvalidRecipient) => AlertKind::InvalidRecipient,
            _ => AlertKind::PermanentFailure,
        };
        let mut details = BTreeMap::new();
        details.insert("retry_count".to_string(), transaction.retry_count.to_string());
        if let Some(failure) = &transaction.last_error {
            details.insert("error_code".to_string(), failure.code.clone());
        }
        self.send_alert(OperatorAlert {
            kind,
            receipt_id: transaction.receipt_id.clone(),
            transaction_id: transaction.transaction_id.clone(),
            details,
        });
    }

    fn raise_conflict(
        &self,
        transaction: &BonusTransaction,
        local: PayoutStatus,
        reported: CallbackStatus,
        callback: &PayoutCallback,
    ) {
        counter!("payout_reconciliation_conflicts_total").increment(1);
        error!(
            receipt_id = %transaction.receipt_id.0,
            transaction_id = %transaction.transaction_id.0,
            local_status = local.label(),
            reported = ?reported,
            "provider callback contradicts local state"
        );

        let mut details = BTreeMap::new();
        details.insert("local_status".to_string(), local.label().to_string());
        details.insert(
            "callback_status".to_string(),
            match reported {
                CallbackStatus::Success => "success".to_string(),
                CallbackStatus::Failure => "failure".to_string(),
            },
        );
        if let Some(reference) = &callback.provider_reference {
            details.insert("provider_reference".to_string(), reference.clone());
        }
        if let Some(code) = &callback.error_code {
            details.insert("error_code".to_string(), code.clone());
        }
        self.send_alert(OperatorAlert {
            kind: AlertKind::ReconciliationConflict,
            receipt_id: transaction.receipt_id.clone(),
            transaction_id: transaction.transaction_id.clone(),
            details,
        });
    }

    fn send_alert(&self, alert: OperatorAlert) {
        if let Err(err) = self.notifier.raise_alert(&alert) {
            error!(
                transaction_id = %alert.transaction_id.0,
                error = %err,
                "operator alert could not be delivered"
            );
        }
    }

    fn resolve_recipient(&self, user_id: &UserId) -> Result<Option<Msisdn>, OrchestratorError> {
        let Some(raw) = self.recipients.msisdn_for(user_id)? else {
            warn!(user_id = %user_id.0, "no phone number registered for user");
            return Ok(None);
        };
        match Msisdn::parse(&raw) {
            Ok(msisdn) => Ok(Some(msisdn)),
            Err(err) => {
                warn!(user_id = %user_id.0, error = %err, "registered phone number is invalid");
                Ok(None)
            }
        }
    }

    fn new_transaction(
        &self,
        receipt_id: ReceiptId,
        user_id: UserId,
        msisdn: Option<&Msisdn>,
        generation: u32,
        now: DateTime<Utc>,
    ) -> BonusTransaction {
        BonusTransaction::new(
            receipt_id,
            user_id,
            msisdn.map(|value| value.as_str().to_string()),
            msisdn.and_then(|value| self.config.payees.payee_for(value)),
            self.config.amount_minor,
            self.config.currency.clone(),
            generation,
            now,
        )
    }

    fn budget_exhausted(&self, now: DateTime<Utc>) -> Result<bool, OrchestratorError> {
        if self.config.daily_success_cap == 0 {
            return Ok(false);
        }
        let succeeded = self.ledger.count_succeeded_since(start_of_utc_day(now))?;
        Ok(succeeded >= self.config.daily_success_cap as usize)
    }

    fn lease_owner(&self) -> String {
        format!("{}/{}", self.config.worker_id, Uuid::new_v4())
    }

    fn lease_ttl(&self) -> Duration {
        to_chrono(self.config.lease_ttl)
    }
}

fn outcome_label(error: &ProviderError) -> &'static str {
    if error.is_transient() {
        "transient_failure"
    } else {
        "permanent_failure"
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000))
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

pub(crate) fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_utc_day(now) + Duration::days(1)
}

/// Error raised by the payout orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    InvalidRecipient(#[from] MsisdnError),
    #[error("transaction not found")]
    NotFound,
    #[error("callback does not match any transaction")]
    UnknownCallback,
    #[error("transaction is being processed, retry later")]
    Busy,
    #[error("operator identity is required")]
    MissingOperator,
    #[error("transaction in state {} (superseded: {superseded}) cannot be resubmitted", .status.label())]
    NotResubmittable {
        status: PayoutStatus,
        superseded: bool,
    },
}

impl OrchestratorError {
    /// Storage or lookup outages and lease contention that may clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Ledger(LedgerError::Unavailable(_))
                | OrchestratorError::Ledger(LedgerError::VersionConflict { .. })
                | OrchestratorError::Directory(_)
                | OrchestratorError::Busy
        )
    }
}
