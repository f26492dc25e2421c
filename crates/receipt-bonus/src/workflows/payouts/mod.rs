//! Bonus payout orchestration and the transaction ledger.
//!
//! Every accepted receipt gets at most one active [`BonusTransaction`]. The orchestrator
//! persists each state change before calling the provider, reuses the receipt-derived
//! idempotency key on retries, and settles unanswered requests by querying the provider
//! instead of resending blindly.

pub mod config;
pub mod domain;
pub mod ledger;
pub mod msisdn;
pub mod notifier;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod router;
pub mod worker;

#[cfg(test)]
mod tests;

pub use config::PayoutConfig;
pub use domain::{
    AlertKind, BonusTransaction, CallbackStatus, IdempotencyKey, Lease, OperatorAlert,
    PayoutCallback, PayoutEvent, PayoutFailure, PayoutOutcome, PayoutStatus, PayoutStatusView,
    ResubmitRequest, TransactionId, TransitionError, TransitionRecord, UserFacingReason,
};
pub use ledger::{CreateOutcome, Ledger, LedgerError};
pub use msisdn::{MobileOperator, Msisdn, MsisdnError, PayeeDirectory};
pub use notifier::{DirectoryError, NotifyError, PayoutNotifier, RecipientDirectory};
pub use orchestrator::{CallbackDisposition, OrchestratorError, PayoutOrchestrator};
pub use provider::{
    PayoutMetadata, PayoutProvider, PayoutRequest, ProviderAck, ProviderError, ProviderStatus,
};
pub use retry::BackoffPolicy;
pub use router::{payout_router, CALLBACK_TOKEN_HEADER};
pub use worker::{spawn_acceptance_consumer, spawn_payout_worker, WorkerHandle};
