mod config;
mod policy;
mod rules;

pub use config::{DedupScope, EligibilityConfig};
pub use policy::{EligibilityDecision, ReasonCode};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Receipt, ReceiptId, SkuCode};
use policy::decide_outcome;
use rules::RuleContext;

/// Per-user context loaded from the repository before deciding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserHistory {
    pub accepted_last_24h: u32,
    /// Fingerprints of receipts stored earlier, within the configured dedup scope.
    pub prior_fingerprints: HashSet<String>,
}

/// Stateless evaluator that applies the eligibility rules to a populated receipt.
#[derive(Debug, Clone)]
pub struct EligibilityEngine {
    config: EligibilityConfig,
}

impl EligibilityEngine {
    pub fn new(config: EligibilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EligibilityConfig {
        &self.config
    }

    pub fn decide(
        &self,
        receipt: &Receipt,
        history: &UserHistory,
        now: DateTime<Utc>,
    ) -> EligibilityOutcome {
        let ctx = RuleContext {
            receipt,
            history,
            config: &self.config,
            now,
        };
        let (decision, aggregate_confidence, checks) = decide_outcome(&ctx);

        EligibilityOutcome {
            receipt_id: receipt.receipt_id.clone(),
            decision,
            aggregate_confidence,
            matched_skus: receipt.matched_skus(),
            checks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityRule {
    InputValidation,
    FingerprintDuplicate,
    AgeWindow,
    RateLimit,
    CatalogPresence,
    ConfidenceGate,
    TotalCrossCheck,
}

/// One evaluated rule, kept on the receipt as the audit trail of the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCheck {
    pub rule: EligibilityRule,
    pub passed: bool,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityOutcome {
    pub receipt_id: ReceiptId,
    pub decision: EligibilityDecision,
    pub aggregate_confidence: Option<f64>,
    pub matched_skus: Vec<SkuCode>,
    pub checks: Vec<RuleCheck>,
}
