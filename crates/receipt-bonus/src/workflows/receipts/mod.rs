//! Receipt intake: catalog matching, eligibility decisions, and the decision outbox.
//!
//! OCR output arrives as a [`ReceiptReady`] event. The intake service matches line candidates
//! against a cached catalog snapshot, runs the eligibility rules, and persists the resulting
//! status together with the outbound events in one repository call so that an accepted
//! receipt can never be left without its payout work item.

pub mod catalog;
pub mod domain;
pub(crate) mod eligibility;
pub mod fingerprint;
pub mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use catalog::{
    CatalogCache, CatalogError, CatalogMatcher, CatalogSnapshot, CatalogSource, LineCandidate,
    MatcherConfig, StaticCatalogSource,
};
pub use domain::{
    CatalogEntry, DecisionKind, DecisionMade, DecisionRecord, LineItem, ManualOverride, OcrLine,
    OverrideVerdict, Receipt, ReceiptAccepted, ReceiptEvent, ReceiptId, ReceiptReady,
    ReceiptStatus, ReceiptStatusView, ReviewerOverride, SkuCode, UserId,
};
pub use eligibility::{
    DedupScope, EligibilityConfig, EligibilityDecision, EligibilityEngine, EligibilityOutcome,
    EligibilityRule, ReasonCode, RuleCheck, UserHistory,
};
pub use repository::{
    DecisionUpdate, EventPublisher, OutboxEntry, PublishError, ReceiptRepository,
    RepositoryError,
};
pub use router::receipt_router;
pub use service::{ReceiptIntakeService, ReceiptServiceError};
