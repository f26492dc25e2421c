use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::workflows::payouts::{
    BonusTransaction, CreateOutcome, IdempotencyKey, Lease, Ledger, LedgerError, PayoutStatus,
    TransactionId,
};
use crate::workflows::receipts::ReceiptId;

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<TransactionId, BonusTransaction>,
    /// Unique index: receipt -> its non-superseded transaction.
    active_by_receipt: HashMap<ReceiptId, TransactionId>,
}

/// Bonus transaction ledger. Records are only ever inserted or updated.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger lock poisoned".to_string()))
    }
}

impl LedgerState {
    fn find(&self, predicate: impl Fn(&BonusTransaction) -> bool) -> Option<BonusTransaction> {
        self.transactions
            .values()
            .find(|transaction| predicate(transaction))
            .cloned()
    }
}

impl Ledger for InMemoryLedger {
    fn create_if_absent(
        &self,
        mut transaction: BonusTransaction,
    ) -> Result<CreateOutcome, LedgerError> {
        let mut state = self.lock()?;
        if let Some(existing_id) = state.active_by_receipt.get(&transaction.receipt_id) {
            let existing = state
                .transactions
                .get(existing_id)
                .cloned()
                .ok_or(LedgerError::NotFound)?;
            return Ok(CreateOutcome::Existing(existing));
        }

        transaction.version = 1;
        state.active_by_receipt.insert(
            transaction.receipt_id.clone(),
            transaction.transaction_id.clone(),
        );
        state
            .transactions
            .insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(CreateOutcome::Created(transaction))
    }

    fn fetch(&self, id: &TransactionId) -> Result<Option<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state.transactions.get(id).cloned())
    }

    fn active_for_receipt(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Option<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .active_by_receipt
            .get(receipt_id)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    fn history_for_receipt(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Vec<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        let mut history: Vec<BonusTransaction> = state
            .transactions
            .values()
            .filter(|transaction| &transaction.receipt_id == receipt_id)
            .cloned()
            .collect();
        history.sort_by_key(|transaction| transaction.generation);
        Ok(history)
    }

    fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state.find(|transaction| &transaction.idempotency_key == key))
    }

    fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state.find(|transaction| transaction.provider_reference.as_deref() == Some(reference)))
    }

    fn save(&self, mut transaction: BonusTransaction) -> Result<BonusTransaction, LedgerError> {
        let mut state = self.lock()?;
        let stored = state
            .transactions
            .get_mut(&transaction.transaction_id)
            .ok_or(LedgerError::NotFound)?;
        if stored.version != transaction.version {
            return Err(LedgerError::VersionConflict {
                expected: transaction.version,
                actual: stored.version,
            });
        }

        transaction.version += 1;
        *stored = transaction.clone();
        Ok(transaction)
    }

    fn acquire_lease(
        &self,
        id: &TransactionId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<BonusTransaction>, LedgerError> {
        let mut state = self.lock()?;
        let stored = state.transactions.get_mut(id).ok_or(LedgerError::NotFound)?;
        if stored.lease_active(now) {
            return Ok(None);
        }

        stored.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        });
        stored.version += 1;
        Ok(Some(stored.clone()))
    }

    fn due_for_attempt(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        let mut due: Vec<BonusTransaction> = state
            .transactions
            .values()
            .filter(|transaction| {
                !transaction.superseded
                    && matches!(
                        transaction.status,
                        PayoutStatus::Created | PayoutStatus::FailedRetryable
                    )
                    && transaction.next_attempt_at.is_some_and(|next| next <= now)
                    && !transaction.lease_active(now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|transaction| transaction.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    fn stale_in_flight(
        &self,
        sent_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BonusTransaction>, LedgerError> {
        let state = self.lock()?;
        let mut stale: Vec<BonusTransaction> = state
            .transactions
            .values()
            .filter(|transaction| {
                transaction.status == PayoutStatus::InFlight
                    && transaction
                        .in_flight_since
                        .is_some_and(|since| since <= sent_before)
                    && !transaction.lease_active(now)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|transaction| transaction.in_flight_since);
        stale.truncate(limit);
        Ok(stale)
    }

    fn count_succeeded_since(&self, since: DateTime<Utc>) -> Result<usize, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .values()
            .filter(|transaction| {
                transaction.status == PayoutStatus::Succeeded
                    && transaction.completed_at.is_some_and(|at| at >= since)
            })
            .count())
    }

    fn supersede(
        &self,
        previous: &TransactionId,
        expected_version: u64,
        mut replacement: BonusTransaction,
    ) -> Result<BonusTransaction, LedgerError> {
        let mut state = self.lock()?;
        let receipt_id = {
            let stored = state
                .transactions
                .get(previous)
                .ok_or(LedgerError::NotFound)?;
            if stored.version != expected_version {
                return Err(LedgerError::VersionConflict {
                    expected: expected_version,
                    actual: stored.version,
                });
            }
            if stored.superseded || stored.receipt_id != replacement.receipt_id {
                return Err(LedgerError::Conflict);
            }
            stored.receipt_id.clone()
        };
        if state.active_by_receipt.get(&receipt_id) != Some(previous) {
            return Err(LedgerError::Conflict);
        }

        if let Some(stored) = state.transactions.get_mut(previous) {
            stored.superseded = true;
            stored.version += 1;
        }
        replacement.version = 1;
        state
            .active_by_receipt
            .insert(receipt_id, replacement.transaction_id.clone());
        state
            .transactions
            .insert(replacement.transaction_id.clone(), replacement.clone());
        Ok(replacement)
    }
}
