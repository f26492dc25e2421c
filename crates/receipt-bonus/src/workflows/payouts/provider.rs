use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{IdempotencyKey, PayoutFailure, TransactionId, UserFacingReason};
use crate::workflows::receipts::ReceiptId;

/// Request sent to the payment provider. The idempotency key lets the provider drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub idempotency_key: IdempotencyKey,
    pub msisdn: String,
    pub amount_minor_units: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee_id: Option<String>,
    pub metadata: PayoutMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutMetadata {
    pub receipt_id: ReceiptId,
    pub transaction_id: TransactionId,
}

/// Synchronous provider acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAck {
    /// Funds delivered; nothing left to wait for.
    Completed { provider_reference: String },
    /// Request taken; a callback (or a status query) will confirm it later.
    Accepted { provider_reference: Option<String> },
}

/// Provider-side view of a request, used by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Succeeded { provider_reference: Option<String> },
    Failed { code: String },
    Pending,
    /// The provider has no record of the idempotency key.
    Unknown,
}

/// Outbound boundary to the payment provider.
#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn submit(&self, request: &PayoutRequest) -> Result<ProviderAck, ProviderError>;
    async fn status(&self, key: &IdempotencyKey) -> Result<ProviderStatus, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider unavailable (status {status})")]
    Unavailable { status: u16 },
    #[error("recipient rejected by provider: {code}")]
    InvalidRecipient { code: String },
    #[error("request failed provider validation: {code}")]
    Validation { code: String },
    #[error("payout rejected by provider: {code}")]
    Rejected { code: String },
}

impl ProviderError {
    /// Timeouts, 5xx and network failures may have had a side effect and are retried with the
    /// same idempotency key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::Transport(_) | ProviderError::Unavailable { .. }
        )
    }

    /// Short label used for metrics and the persisted error code.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Transport(_) => "transport",
            ProviderError::Unavailable { .. } => "unavailable",
            ProviderError::InvalidRecipient { .. } => "invalid_recipient",
            ProviderError::Validation { .. } => "validation",
            ProviderError::Rejected { .. } => "rejected",
        }
    }

    pub fn user_facing(&self) -> UserFacingReason {
        match self {
            ProviderError::Timeout
            | ProviderError::Transport(_)
            | ProviderError::Unavailable { .. } => UserFacingReason::TemporaryProblem,
            ProviderError::InvalidRecipient { .. } => UserFacingReason::InvalidRecipient,
            ProviderError::Validation { .. } | ProviderError::Rejected { .. } => {
                UserFacingReason::Rejected
            }
        }
    }

    pub fn to_failure(&self) -> PayoutFailure {
        let code = match self {
            ProviderError::Timeout => "timeout".to_string(),
            ProviderError::Transport(_) => "transport".to_string(),
            ProviderError::Unavailable { status } => format!("http_{status}"),
            ProviderError::InvalidRecipient { code }
            | ProviderError::Validation { code }
            | ProviderError::Rejected { code } => code.clone(),
        };
        PayoutFailure {
            code,
            reason: self.user_facing(),
        }
    }

    /// Classifies a provider error code received out of band (callback or status query).
    pub fn from_code(code: &str) -> Self {
        let normalized = code.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "timeout" | "gateway_timeout" => ProviderError::Timeout,
            "network" | "transport" | "connection_reset" => {
                ProviderError::Transport(normalized.clone())
            }
            "unavailable" | "service_unavailable" | "internal_error" => {
                ProviderError::Unavailable { status: 503 }
            }
            "invalid_recipient" | "invalid_phone" | "invalid_msisdn" | "unknown_subscriber" => {
                ProviderError::InvalidRecipient { code: normalized }
            }
            "validation" | "invalid_amount" | "invalid_currency" | "invalid_payee" => {
                ProviderError::Validation { code: normalized }
            }
            _ => ProviderError::Rejected {
                code: if normalized.is_empty() {
                    "unspecified".to_string()
                } else {
                    normalized
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Unavailable { status: 502 }.is_transient());
        assert!(ProviderError::Transport("reset".to_string()).is_transient());
        assert!(!ProviderError::Rejected {
            code: "limit".to_string()
        }
        .is_transient());
    }

    #[test]
    fn callback_codes_map_to_coarse_user_reasons() {
        assert_eq!(
            ProviderError::from_code("INVALID_PHONE").user_facing(),
            UserFacingReason::InvalidRecipient
        );
        assert_eq!(
            ProviderError::from_code("gateway_timeout").user_facing(),
            UserFacingReason::TemporaryProblem
        );
        assert_eq!(
            ProviderError::from_code("merchant_blocked").user_facing(),
            UserFacingReason::Rejected
        );
        assert_eq!(ProviderError::from_code("").to_failure().code, "unspecified");
    }
}
