use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::eligibility::{EligibilityDecision, EligibilityOutcome, ReasonCode, RuleCheck};

/// Identifier wrapper for uploaded receipts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiptId(pub String);

/// Identifier of the chat user that owns a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Canonical product code from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SkuCode(pub String);

/// Lifecycle of a receipt. Leaves `Pending` exactly once through an automated decision;
/// `ManualReview` may additionally be resolved by a reviewer override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Accepted,
    Rejected,
    ManualReview,
}

impl ReceiptStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Accepted => "accepted",
            ReceiptStatus::Rejected => "rejected",
            ReceiptStatus::ManualReview => "manual_review",
        }
    }

    pub fn for_decision(decision: &EligibilityDecision) -> Self {
        match decision {
            EligibilityDecision::Accept => ReceiptStatus::Accepted,
            EligibilityDecision::Reject(_) => ReceiptStatus::Rejected,
            EligibilityDecision::Escalate(_) => ReceiptStatus::ManualReview,
        }
    }
}

/// One matched (or unmatched) line of a receipt. Created by the catalog matcher, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: Option<SkuCode>,
    pub raw_text: String,
    pub quantity: u32,
    /// Minor currency units.
    pub unit_price: i64,
    pub confidence: f64,
}

impl LineItem {
    pub fn line_total(&self) -> i64 {
        self.unit_price.saturating_mul(i64::from(self.quantity))
    }

    pub fn is_matched(&self) -> bool {
        self.sku.is_some()
    }
}

/// Reference data: one product and the aliases it is printed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub sku: SkuCode,
    pub aliases: Vec<String>,
    /// Single-word manufacturer markers ("Дарниця") that qualify a line missing from the
    /// alias list. Checked only when no alias matched.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub active: bool,
}

/// Persisted receipt with its line items and the decision trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    pub uploaded_at: DateTime<Utc>,
    pub purchased_at: Option<DateTime<Utc>>,
    /// Opaque pointer to the stored image / OCR payload.
    pub artifact_ref: Option<String>,
    pub status: ReceiptStatus,
    pub fingerprint: String,
    /// Minor currency units as read by OCR.
    pub declared_total: Option<i64>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub decision: Option<DecisionRecord>,
    pub manual_override: Option<ManualOverride>,
    /// Insertion order assigned by the repository; earlier receipts win fingerprint ties.
    pub sequence: u64,
}

impl Receipt {
    pub fn matched_skus(&self) -> Vec<SkuCode> {
        let mut skus: Vec<SkuCode> = self
            .line_items
            .iter()
            .filter_map(|item| item.sku.clone())
            .collect();
        skus.sort();
        skus.dedup();
        skus
    }

    pub fn line_sum(&self) -> i64 {
        self.line_items
            .iter()
            .fold(0i64, |acc, item| acc.saturating_add(item.line_total()))
    }

    pub fn decision_rationale(&self) -> String {
        if let Some(manual) = &self.manual_override {
            return format!(
                "{} by reviewer {}",
                manual.verdict.summary(),
                manual.reviewer
            );
        }
        match &self.decision {
            Some(record) => record.decision.summary(),
            None => "pending evaluation".to_string(),
        }
    }

    /// Reason behind the current status. A reviewer acceptance clears the escalation reason.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        if let Some(manual) = &self.manual_override {
            if manual.verdict == OverrideVerdict::Accept {
                return None;
            }
        }
        self.decision
            .as_ref()
            .and_then(|record| record.decision.reason())
    }

    pub fn status_view(&self) -> ReceiptStatusView {
        ReceiptStatusView {
            receipt_id: self.receipt_id.clone(),
            status: self.status.label(),
            decision_rationale: self.decision_rationale(),
            reason_code: self.reason_code().map(ReasonCode::as_str),
            matched_skus: self.matched_skus(),
            aggregate_confidence: self
                .decision
                .as_ref()
                .and_then(|record| record.aggregate_confidence),
        }
    }
}

/// Automated decision as persisted on the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: EligibilityDecision,
    pub decided_at: DateTime<Utc>,
    pub aggregate_confidence: Option<f64>,
    pub checks: Vec<RuleCheck>,
}

impl DecisionRecord {
    pub fn from_outcome(outcome: &EligibilityOutcome, decided_at: DateTime<Utc>) -> Self {
        Self {
            decision: outcome.decision.clone(),
            decided_at,
            aggregate_confidence: outcome.aggregate_confidence,
            checks: outcome.checks.clone(),
        }
    }
}

/// Reviewer resolution of a `manual_review` receipt, kept separately from the automated decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub reviewer: String,
    pub verdict: OverrideVerdict,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideVerdict {
    Accept,
    Reject,
}

impl OverrideVerdict {
    pub fn summary(&self) -> &'static str {
        match self {
            OverrideVerdict::Accept => "accepted on manual review",
            OverrideVerdict::Reject => "rejected on manual review",
        }
    }

    pub fn status(self) -> ReceiptStatus {
        match self {
            OverrideVerdict::Accept => ReceiptStatus::Accepted,
            OverrideVerdict::Reject => ReceiptStatus::Rejected,
        }
    }
}

/// Request body for a reviewer resolving an escalated receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerOverride {
    pub reviewer: String,
    pub verdict: OverrideVerdict,
    #[serde(default)]
    pub note: Option<String>,
}

/// Sanitized representation of a receipt's exposed status.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptStatusView {
    pub receipt_id: ReceiptId,
    pub status: &'static str,
    pub decision_rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<&'static str>,
    pub matched_skus: Vec<SkuCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_confidence: Option<f64>,
}

/// Inbound event from the OCR/ingestion subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptReady {
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    #[serde(default)]
    pub line_items: Vec<OcrLine>,
    #[serde(default)]
    pub purchase_timestamp: Option<DateTime<Utc>>,
    /// Minor currency units.
    #[serde(default)]
    pub declared_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact_ref: Option<String>,
}

/// A line candidate as clustered by OCR. Fields are optional so that incomplete payloads
/// reach the decision path (and manual review) instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub quantity: Option<u32>,
    /// Minor currency units.
    #[serde(default)]
    pub unit_price: Option<i64>,
    #[serde(default)]
    pub ocr_confidence: Option<f64>,
}

/// Outbound notification describing the decision taken on a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMade {
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    pub decision: DecisionKind,
    pub reason_code: Option<ReasonCode>,
    pub matched_skus: Vec<SkuCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Accept,
    Reject,
    Escalate,
}

/// Work item for the payout orchestrator; emitted atomically with the accepted status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptAccepted {
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptEvent {
    DecisionMade(DecisionMade),
    ReceiptAccepted(ReceiptAccepted),
}

impl ReceiptEvent {
    pub fn receipt_id(&self) -> &ReceiptId {
        match self {
            ReceiptEvent::DecisionMade(event) => &event.receipt_id,
            ReceiptEvent::ReceiptAccepted(event) => &event.receipt_id,
        }
    }
}
