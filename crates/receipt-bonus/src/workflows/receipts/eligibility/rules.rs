use chrono::{DateTime, Duration, Utc};

use super::config::EligibilityConfig;
use super::policy::{EligibilityDecision, ReasonCode};
use super::{EligibilityRule, RuleCheck, UserHistory};
use crate::workflows::receipts::domain::Receipt;

pub(crate) struct RuleContext<'a> {
    pub receipt: &'a Receipt,
    pub history: &'a UserHistory,
    pub config: &'a EligibilityConfig,
    pub now: DateTime<Utc>,
}

/// Result of one short-circuiting rule: the audit line plus a terminal decision, if any.
pub(crate) type RuleResult = (RuleCheck, Option<EligibilityDecision>);

fn passed(rule: EligibilityRule, notes: String) -> RuleResult {
    (
        RuleCheck {
            rule,
            passed: true,
            notes,
        },
        None,
    )
}

fn failed(rule: EligibilityRule, notes: String, decision: EligibilityDecision) -> RuleResult {
    (
        RuleCheck {
            rule,
            passed: false,
            notes,
        },
        Some(decision),
    )
}

pub(crate) fn fingerprint_duplicate(ctx: &RuleContext<'_>) -> RuleResult {
    let fingerprint = &ctx.receipt.fingerprint;
    if ctx.history.prior_fingerprints.contains(fingerprint) {
        failed(
            EligibilityRule::FingerprintDuplicate,
            format!("fingerprint {fingerprint} already submitted"),
            EligibilityDecision::Reject(ReasonCode::Duplicate),
        )
    } else {
        passed(
            EligibilityRule::FingerprintDuplicate,
            "fingerprint not seen before".to_string(),
        )
    }
}

pub(crate) fn age_window(ctx: &RuleContext<'_>) -> RuleResult {
    let Some(purchased_at) = ctx.receipt.purchased_at else {
        return passed(
            EligibilityRule::AgeWindow,
            "purchase timestamp unknown".to_string(),
        );
    };

    let window = Duration::days(i64::from(ctx.config.age_window_days));
    let age = ctx.now.signed_duration_since(purchased_at);
    if age > window {
        failed(
            EligibilityRule::AgeWindow,
            format!(
                "purchased {} days ago, window is {} days",
                age.num_days(),
                ctx.config.age_window_days
            ),
            EligibilityDecision::Reject(ReasonCode::TooOld),
        )
    } else {
        passed(
            EligibilityRule::AgeWindow,
            format!("purchased {} hours ago", age.num_hours()),
        )
    }
}

pub(crate) fn rate_limit(ctx: &RuleContext<'_>) -> RuleResult {
    let accepted = ctx.history.accepted_last_24h;
    let max = ctx.config.max_accepted_per_day;
    if accepted >= max {
        failed(
            EligibilityRule::RateLimit,
            format!("{accepted} receipts accepted in the last 24h (max {max})"),
            EligibilityDecision::Reject(ReasonCode::RateLimited),
        )
    } else {
        passed(
            EligibilityRule::RateLimit,
            format!("{accepted} of {max} daily accepts used"),
        )
    }
}

pub(crate) fn catalog_presence(ctx: &RuleContext<'_>) -> RuleResult {
    let matched = ctx
        .receipt
        .line_items
        .iter()
        .filter(|item| item.is_matched())
        .count();
    if matched == 0 {
        failed(
            EligibilityRule::CatalogPresence,
            format!(
                "none of {} line items matched the catalog",
                ctx.receipt.line_items.len()
            ),
            EligibilityDecision::Reject(ReasonCode::NoMatch),
        )
    } else {
        passed(
            EligibilityRule::CatalogPresence,
            format!("{matched} line item(s) matched the catalog"),
        )
    }
}

/// Highest confidence among matched lines; irrelevant low-confidence lines do not drag it down.
pub(crate) fn aggregate_confidence(receipt: &Receipt) -> Option<f64> {
    receipt
        .line_items
        .iter()
        .filter(|item| item.is_matched())
        .map(|item| item.confidence)
        .filter(|confidence| confidence.is_finite())
        .fold(None, |best: Option<f64>, value| {
            Some(best.map_or(value, |current| current.max(value)))
        })
}

pub(crate) fn confidence_gate(ctx: &RuleContext<'_>, aggregate: f64) -> RuleResult {
    let config = ctx.config;
    let rule = EligibilityRule::ConfidenceGate;
    if aggregate >= config.high_confidence {
        (
            RuleCheck {
                rule,
                passed: true,
                notes: format!(
                    "confidence {aggregate:.3} meets threshold {:.3}",
                    config.high_confidence
                ),
            },
            Some(EligibilityDecision::Accept),
        )
    } else if aggregate < config.low_confidence {
        failed(
            rule,
            format!(
                "confidence {aggregate:.3} below floor {:.3}",
                config.low_confidence
            ),
            EligibilityDecision::Reject(ReasonCode::Illegible),
        )
    } else {
        failed(
            rule,
            format!(
                "confidence {aggregate:.3} between {:.3} and {:.3}",
                config.low_confidence, config.high_confidence
            ),
            EligibilityDecision::Escalate(ReasonCode::LowConfidence),
        )
    }
}

/// Compares the declared total with the sum of line totals. `None` when there is nothing to
/// compare against.
pub(crate) fn total_cross_check(ctx: &RuleContext<'_>) -> Option<RuleCheck> {
    let declared = ctx.receipt.declared_total?;
    let line_sum = ctx.receipt.line_sum();
    let diff = line_sum.abs_diff(declared);

    let within = if declared == 0 {
        diff == 0
    } else {
        let pct = diff as f64 * 100.0 / declared.unsigned_abs() as f64;
        pct <= ctx.config.total_tolerance_pct
    };

    Some(RuleCheck {
        rule: EligibilityRule::TotalCrossCheck,
        passed: within,
        notes: format!(
            "declared total {declared}, line sum {line_sum}, tolerance {:.2}%",
            ctx.config.total_tolerance_pct
        ),
    })
}
