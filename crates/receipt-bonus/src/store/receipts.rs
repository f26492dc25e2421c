use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::workflows::receipts::{
    DecisionUpdate, DedupScope, OutboxEntry, OverrideVerdict, Receipt, ReceiptId,
    ReceiptRepository, ReceiptStatus, RepositoryError, UserHistory, UserId,
};

#[derive(Default)]
struct ReceiptState {
    receipts: HashMap<ReceiptId, Receipt>,
    last_sequence: u64,
    outbox: BTreeMap<u64, OutboxEntry>,
    last_outbox_sequence: u64,
}

/// Receipt table plus transactional outbox.
#[derive(Default)]
pub struct InMemoryReceiptStore {
    state: Mutex<ReceiptState>,
}

impl InMemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReceiptState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("receipt store lock poisoned".to_string()))
    }
}

/// When the receipt reached `accepted`, whether automatically or by a reviewer.
fn accepted_at(receipt: &Receipt) -> Option<DateTime<Utc>> {
    if receipt.status != ReceiptStatus::Accepted {
        return None;
    }
    match &receipt.manual_override {
        Some(manual) if manual.verdict == OverrideVerdict::Accept => Some(manual.decided_at),
        _ => receipt.decision.as_ref().map(|record| record.decided_at),
    }
}

impl ReceiptRepository for InMemoryReceiptStore {
    fn insert(&self, mut receipt: Receipt) -> Result<Receipt, RepositoryError> {
        let mut state = self.lock()?;
        if state.receipts.contains_key(&receipt.receipt_id) {
            return Err(RepositoryError::Conflict);
        }
        state.last_sequence += 1;
        receipt.sequence = state.last_sequence;
        state
            .receipts
            .insert(receipt.receipt_id.clone(), receipt.clone());
        Ok(receipt)
    }

    fn fetch(&self, id: &ReceiptId) -> Result<Option<Receipt>, RepositoryError> {
        let state = self.lock()?;
        Ok(state.receipts.get(id).cloned())
    }

    fn history(
        &self,
        user_id: &UserId,
        scope: DedupScope,
        before_sequence: u64,
        accepted_since: DateTime<Utc>,
    ) -> Result<UserHistory, RepositoryError> {
        let state = self.lock()?;
        let mut prior_fingerprints = HashSet::new();
        let mut accepted_last_24h = 0u32;

        for receipt in state.receipts.values() {
            let same_user = &receipt.user_id == user_id;
            if receipt.sequence < before_sequence && (same_user || scope == DedupScope::Global) {
                prior_fingerprints.insert(receipt.fingerprint.clone());
            }
            if same_user && accepted_at(receipt).is_some_and(|at| at >= accepted_since) {
                accepted_last_24h += 1;
            }
        }

        Ok(UserHistory {
            accepted_last_24h,
            prior_fingerprints,
        })
    }

    fn apply_decision(
        &self,
        id: &ReceiptId,
        expected: ReceiptStatus,
        update: DecisionUpdate,
        recorded_at: DateTime<Utc>,
    ) -> Result<Receipt, RepositoryError> {
        let mut state = self.lock()?;
        let receipt = state.receipts.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if receipt.status != expected {
            return Err(RepositoryError::StaleStatus {
                expected,
                actual: receipt.status,
            });
        }

        receipt.status = update.status;
        receipt.decision = update.decision;
        if update.manual_override.is_some() {
            receipt.manual_override = update.manual_override;
        }
        let updated = receipt.clone();

        for event in update.events {
            state.last_outbox_sequence += 1;
            let sequence = state.last_outbox_sequence;
            state.outbox.insert(
                sequence,
                OutboxEntry {
                    sequence,
                    event,
                    recorded_at,
                },
            );
        }

        Ok(updated)
    }

    fn undelivered(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let state = self.lock()?;
        Ok(state.outbox.values().take(limit).cloned().collect())
    }

    fn mark_delivered(&self, sequences: &[u64]) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        for sequence in sequences {
            state.outbox.remove(sequence);
        }
        Ok(())
    }
}
