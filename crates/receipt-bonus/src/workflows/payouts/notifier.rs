use super::domain::{OperatorAlert, PayoutOutcome};
use crate::workflows::receipts::UserId;

/// Outbound hooks for the messaging layer and the operator queue.
pub trait PayoutNotifier: Send + Sync {
    fn publish_outcome(&self, outcome: &PayoutOutcome) -> Result<(), NotifyError>;
    fn raise_alert(&self, alert: &OperatorAlert) -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Resolves the phone number registered for a user.
pub trait RecipientDirectory: Send + Sync {
    fn msisdn_for(&self, user_id: &UserId) -> Result<Option<String>, DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("recipient directory unavailable: {0}")]
    Unavailable(String),
}
