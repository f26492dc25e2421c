use serde::{Deserialize, Serialize};

use super::rules::{self, RuleContext, RuleResult};
use super::{EligibilityRule, RuleCheck};

/// Outcome of the eligibility rules for one receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum EligibilityDecision {
    Accept,
    Reject(ReasonCode),
    Escalate(ReasonCode),
}

impl EligibilityDecision {
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            EligibilityDecision::Accept => None,
            EligibilityDecision::Reject(reason) | EligibilityDecision::Escalate(reason) => {
                Some(*reason)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EligibilityDecision::Accept => "accept",
            EligibilityDecision::Reject(_) => "reject",
            EligibilityDecision::Escalate(_) => "escalate",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            EligibilityDecision::Accept => "receipt accepted".to_string(),
            EligibilityDecision::Reject(reason) => format!("rejected: {}", reason.summary()),
            EligibilityDecision::Escalate(reason) => {
                format!("sent to manual review: {}", reason.summary())
            }
        }
    }
}

/// Reason codes consumed by the notification layer to build an actionable user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Duplicate,
    TooOld,
    RateLimited,
    NoMatch,
    Illegible,
    LowConfidence,
    TotalMismatch,
    MalformedInput,
}

impl ReasonCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Duplicate => "duplicate",
            ReasonCode::TooOld => "too_old",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::NoMatch => "no_match",
            ReasonCode::Illegible => "illegible",
            ReasonCode::LowConfidence => "low_confidence",
            ReasonCode::TotalMismatch => "total_mismatch",
            ReasonCode::MalformedInput => "malformed_input",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            ReasonCode::Duplicate => "this receipt was already submitted",
            ReasonCode::TooOld => "the purchase is outside the eligibility window",
            ReasonCode::RateLimited => "daily receipt limit reached",
            ReasonCode::NoMatch => "no participating products found",
            ReasonCode::Illegible => "the photo is not legible enough",
            ReasonCode::LowConfidence => "products could not be identified with certainty",
            ReasonCode::TotalMismatch => "the receipt total does not add up",
            ReasonCode::MalformedInput => "the receipt could not be read completely",
        }
    }
}

/// Runs the rules in order; the first terminal rule wins. An accept can still be downgraded
/// by the total cross-check.
pub(crate) fn decide_outcome(
    ctx: &RuleContext<'_>,
) -> (EligibilityDecision, Option<f64>, Vec<RuleCheck>) {
    let mut checks = Vec::new();
    let ordered: [fn(&RuleContext<'_>) -> RuleResult; 4] = [
        rules::fingerprint_duplicate,
        rules::age_window,
        rules::rate_limit,
        rules::catalog_presence,
    ];

    for rule in ordered {
        let (check, decision) = rule(ctx);
        checks.push(check);
        if let Some(decision) = decision {
            return (decision, None, checks);
        }
    }

    let Some(aggregate) = rules::aggregate_confidence(ctx.receipt) else {
        checks.push(RuleCheck {
            rule: EligibilityRule::ConfidenceGate,
            passed: false,
            notes: "no finite confidence on matched lines".to_string(),
        });
        return (
            EligibilityDecision::Reject(ReasonCode::Illegible),
            None,
            checks,
        );
    };

    let (check, decision) = rules::confidence_gate(ctx, aggregate);
    checks.push(check);
    let decision = decision.unwrap_or(EligibilityDecision::Escalate(ReasonCode::LowConfidence));

    if decision != EligibilityDecision::Accept {
        return (decision, Some(aggregate), checks);
    }

    match rules::total_cross_check(ctx) {
        Some(check) if !check.passed => {
            checks.push(check);
            (
                EligibilityDecision::Escalate(ReasonCode::TotalMismatch),
                Some(aggregate),
                checks,
            )
        }
        Some(check) => {
            checks.push(check);
            (decision, Some(aggregate), checks)
        }
        None => (decision, Some(aggregate), checks),
    }
}
