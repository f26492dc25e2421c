use std::collections::HashMap;
use std::sync::RwLock;

use crate::workflows::payouts::{DirectoryError, RecipientDirectory};
use crate::workflows::receipts::UserId;

/// Phone numbers registered by users, as captured by the chat front-end.
#[derive(Default)]
pub struct InMemoryRecipientDirectory {
    numbers: RwLock<HashMap<UserId, String>>,
}

impl InMemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the raw number; normalisation happens when a payout is built.
    pub fn register(&self, user_id: UserId, msisdn: impl Into<String>) -> Result<(), DirectoryError> {
        let mut numbers = self
            .numbers
            .write()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".to_string()))?;
        numbers.insert(user_id, msisdn.into());
        Ok(())
    }
}

impl RecipientDirectory for InMemoryRecipientDirectory {
    fn msisdn_for(&self, user_id: &UserId) -> Result<Option<String>, DirectoryError> {
        let numbers = self
            .numbers
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".to_string()))?;
        Ok(numbers.get(user_id).cloned())
    }
}
