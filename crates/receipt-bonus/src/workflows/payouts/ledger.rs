use chrono::{DateTime, Duration, Utc};

use super::domain::{BonusTransaction, IdempotencyKey, TransactionId};
use crate::workflows::receipts::ReceiptId;

/// Result of the atomic create-if-absent keyed by receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(BonusTransaction),
    /// A non-superseded transaction already exists for the receipt.
    Existing(BonusTransaction),
}

impl CreateOutcome {
    pub fn into_transaction(self) -> BonusTransaction {
        match self {
            CreateOutcome::Created(transaction) | CreateOutcome::Existing(transaction) => {
                transaction
            }
        }
    }
}

/// Durable store of bonus transactions. Records are never deleted.
///
/// Implementations must enforce at most one non-superseded transaction per receipt inside
/// `create_if_absent` and `supersede`, and reject `save` when the stored version differs
/// from the one carried by the caller.
pub trait Ledger: Send + Sync {
    fn create_if_absent(&self, transaction: BonusTransaction)
        -> Result<CreateOutcome, LedgerError>;
    fn fetch(&self, id: &TransactionId) -> Result<Option<BonusTransaction>, LedgerError>;
    fn active_for_receipt(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Option<BonusTransaction>, LedgerError>;
    /// All generations for a receipt, oldest first.
    fn history_for_receipt(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Vec<BonusTransaction>, LedgerError>;
    fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<BonusTransaction>, LedgerError>;
    fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BonusTransaction>, LedgerError>;
    /// Persist a mutated record; returns it with the bumped version.
    fn save(&self, transaction: BonusTransaction) -> Result<BonusTransaction, LedgerError>;
    /// Grants the processing lease unless an unexpired one is held. `Ok(None)` when it is.
    /// The lease is released by saving the record with `lease` cleared.
    fn acquire_lease(
        &self,
        id: &TransactionId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<BonusTransaction>, LedgerError>;
    /// `created` / `failed_retryable` records whose next attempt is due and that nobody leases.
    fn due_for_attempt(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BonusTransaction>, LedgerError>;
    /// `in_flight` records sent at or before `sent_before` and not currently leased.
    fn stale_in_flight(
        &self,
        sent_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BonusTransaction>, LedgerError>;
    fn count_succeeded_since(&self, since: DateTime<Utc>) -> Result<usize, LedgerError>;
    /// Atomically marks `previous` superseded and inserts `replacement` as the receipt's
    /// active transaction.
    fn supersede(
        &self,
        previous: &TransactionId,
        expected_version: u64,
        replacement: BonusTransaction,
    ) -> Result<BonusTransaction, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction not found")]
    NotFound,
    #[error("transaction was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("receipt already has an active transaction")]
    Conflict,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}
