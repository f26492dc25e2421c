use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    DecisionRecord, ManualOverride, Receipt, ReceiptEvent, ReceiptId, ReceiptStatus,
    UserId,
};
use super::eligibility::{DedupScope, UserHistory};

/// Status change applied together with its outbox events.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionUpdate {
    pub status: ReceiptStatus,
    pub decision: Option<DecisionRecord>,
    pub manual_override: Option<ManualOverride>,
    pub events: Vec<ReceiptEvent>,
}

/// Event waiting in the transactional outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub event: ReceiptEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Storage abstraction for receipts and their outbox.
pub trait ReceiptRepository: Send + Sync {
    /// Stores a new receipt and assigns its sequence. `Conflict` if the id already exists.
    fn insert(&self, receipt: Receipt) -> Result<Receipt, RepositoryError>;
    fn fetch(&self, id: &ReceiptId) -> Result<Option<Receipt>, RepositoryError>;
    /// Prior fingerprints (receipts stored before `before_sequence`, within `scope`) and the
    /// user's accepted count since `accepted_since`.
    fn history(
        &self,
        user_id: &UserId,
        scope: DedupScope,
        before_sequence: u64,
        accepted_since: DateTime<Utc>,
    ) -> Result<UserHistory, RepositoryError>;
    /// Atomically moves the receipt from `expected` to `update.status` and appends
    /// `update.events` to the outbox. `StaleStatus` if the receipt is no longer in `expected`.
    fn apply_decision(
        &self,
        id: &ReceiptId,
        expected: ReceiptStatus,
        update: DecisionUpdate,
        recorded_at: DateTime<Utc>,
    ) -> Result<Receipt, RepositoryError>;
    fn undelivered(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError>;
    fn mark_delivered(&self, sequences: &[u64]) -> Result<(), RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("receipt is {actual:?}, expected {expected:?}")]
    StaleStatus {
        expected: ReceiptStatus,
        actual: ReceiptStatus,
    },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Outbound hook for decision and acceptance events (notification, analytics, payouts).
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &ReceiptEvent) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event transport unavailable: {0}")]
    Transport(String),
}
