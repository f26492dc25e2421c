use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use tracing::{info, warn};

use super::catalog::{CatalogCache, CatalogMatcher, LineCandidate, MatcherConfig};
use super::domain::{
    DecisionKind, DecisionMade, DecisionRecord, ManualOverride, OcrLine, OverrideVerdict, Receipt,
    ReceiptAccepted, ReceiptEvent, ReceiptId, ReceiptReady, ReceiptStatus, ReviewerOverride,
};
use super::eligibility::{
    EligibilityConfig, EligibilityDecision, EligibilityEngine, EligibilityOutcome,
    EligibilityRule, ReasonCode, RuleCheck,
};
use super::fingerprint;
use super::repository::{
    DecisionUpdate, EventPublisher, PublishError, ReceiptRepository, RepositoryError,
};
use crate::clock::Clock;
use crate::telemetry::AUDIT_TARGET;

/// Outbox entries flushed after each decision.
const OUTBOX_BATCH: usize = 64;

/// Service composing the catalog matcher, eligibility engine, repository and outbox.
pub struct ReceiptIntakeService<R, P> {
    repository: Arc<R>,
    publisher: Arc<P>,
    catalog: Arc<CatalogCache>,
    matcher: CatalogMatcher,
    engine: Arc<EligibilityEngine>,
    clock: Arc<dyn Clock>,
}

impl<R, P> ReceiptIntakeService<R, P>
where
    R: ReceiptRepository + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        catalog: Arc<CatalogCache>,
        matcher: MatcherConfig,
        eligibility: EligibilityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            publisher,
            catalog,
            matcher: CatalogMatcher::new(matcher),
            engine: Arc::new(EligibilityEngine::new(eligibility)),
            clock,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogCache> {
        &self.catalog
    }

    /// Match, decide and persist an OCR result. Redelivery of an already decided receipt
    /// returns the stored record unchanged; a receipt left pending by an interrupted run is
    /// decided again.
    pub fn ingest(&self, ready: ReceiptReady) -> Result<Receipt, ReceiptServiceError> {
        if ready.receipt_id.0.trim().is_empty() {
            return Err(IntakeError::MissingField("receipt_id").into());
        }
        if ready.user_id.0.trim().is_empty() {
            return Err(IntakeError::MissingField("user_id").into());
        }

        let receipt = match self.repository.fetch(&ready.receipt_id)? {
            Some(existing) if existing.status != ReceiptStatus::Pending => return Ok(existing),
            Some(existing) => existing,
            None => match self.repository.insert(self.build_pending(&ready)) {
                Ok(stored) => stored,
                Err(RepositoryError::Conflict) => self
                    .repository
                    .fetch(&ready.receipt_id)?
                    .ok_or(RepositoryError::NotFound)?,
                Err(other) => return Err(other.into()),
            },
        };
        if receipt.status != ReceiptStatus::Pending {
            return Ok(receipt);
        }

        let now = self.clock.now();
        let outcome = match malformed_reason(&ready) {
            Some(notes) => EligibilityOutcome {
                receipt_id: receipt.receipt_id.clone(),
                decision: EligibilityDecision::Escalate(ReasonCode::MalformedInput),
                aggregate_confidence: None,
                matched_skus: receipt.matched_skus(),
                checks: vec![RuleCheck {
                    rule: EligibilityRule::InputValidation,
                    passed: false,
                    notes,
                }],
            },
            None => {
                let history = self.repository.history(
                    &receipt.user_id,
                    self.engine.config().dedup_scope,
                    receipt.sequence,
                    now - Duration::hours(24),
                )?;
                self.engine.decide(&receipt, &history, now)
            }
        };

        let mut events = vec![ReceiptEvent::DecisionMade(DecisionMade {
            receipt_id: receipt.receipt_id.clone(),
            user_id: receipt.user_id.clone(),
            decision: decision_kind(&outcome.decision),
            reason_code: outcome.decision.reason(),
            matched_skus: outcome.matched_skus.clone(),
        })];
        if outcome.decision == EligibilityDecision::Accept {
            events.push(ReceiptEvent::ReceiptAccepted(ReceiptAccepted {
                receipt_id: receipt.receipt_id.clone(),
                user_id: receipt.user_id.clone(),
                accepted_at: now,
            }));
        }

        let update = DecisionUpdate {
            status: ReceiptStatus::for_decision(&outcome.decision),
            decision: Some(DecisionRecord::from_outcome(&outcome, now)),
            manual_override: None,
            events,
        };
        let decided =
            match self
                .repository
                .apply_decision(&receipt.receipt_id, ReceiptStatus::Pending, update, now)
            {
                Ok(decided) => decided,
                Err(RepositoryError::StaleStatus { .. }) => self
                    .repository
                    .fetch(&receipt.receipt_id)?
                    .ok_or(RepositoryError::NotFound)?,
                Err(other) => return Err(other.into()),
            };

        let reason = outcome.decision.reason().map_or("none", ReasonCode::as_str);
        counter!(
            "receipt_decisions_total",
            "decision" => outcome.decision.label(),
            "reason" => reason
        )
        .increment(1);
        info!(
            receipt_id = %decided.receipt_id.0,
            user_id = %decided.user_id.0,
            decision = outcome.decision.label(),
            reason_code = reason,
            aggregate_confidence = ?outcome.aggregate_confidence,
            "receipt decided"
        );

        self.flush_outbox();
        Ok(decided)
    }

    /// Resolve a `manual_review` receipt on behalf of a reviewer.
    pub fn override_decision(
        &self,
        receipt_id: &ReceiptId,
        request: ReviewerOverride,
    ) -> Result<Receipt, ReceiptServiceError> {
        let reviewer = request.reviewer.trim();
        if reviewer.is_empty() {
            return Err(OverrideError::MissingReviewer.into());
        }

        let receipt = self
            .repository
            .fetch(receipt_id)?
            .ok_or(RepositoryError::NotFound)?;
        if receipt.status != ReceiptStatus::ManualReview {
            return Err(OverrideError::NotUnderReview {
                status: receipt.status,
            }
            .into());
        }

        let now = self.clock.now();
        let escalation_reason = receipt
            .decision
            .as_ref()
            .and_then(|record| record.decision.reason());
        let mut events = vec![ReceiptEvent::DecisionMade(DecisionMade {
            receipt_id: receipt.receipt_id.clone(),
            user_id: receipt.user_id.clone(),
            decision: match request.verdict {
                OverrideVerdict::Accept => DecisionKind::Accept,
                OverrideVerdict::Reject => DecisionKind::Reject,
            },
            reason_code: match request.verdict {
                OverrideVerdict::Accept => None,
                OverrideVerdict::Reject => escalation_reason,
            },
            matched_skus: receipt.matched_skus(),
        })];
        if request.verdict == OverrideVerdict::Accept {
            events.push(ReceiptEvent::ReceiptAccepted(ReceiptAccepted {
                receipt_id: receipt.receipt_id.clone(),
                user_id: receipt.user_id.clone(),
                accepted_at: now,
            }));
        }

        let update = DecisionUpdate {
            status: request.verdict.status(),
            decision: receipt.decision.clone(),
            manual_override: Some(ManualOverride {
                reviewer: reviewer.to_string(),
                verdict: request.verdict,
                note: request.note.clone(),
                decided_at: now,
            }),
            events,
        };
        let updated =
            self.repository
                .apply_decision(receipt_id, ReceiptStatus::ManualReview, update, now)?;

        info!(
            target: AUDIT_TARGET,
            receipt_id = %receipt_id.0,
            reviewer = %reviewer,
            verdict = request.verdict.summary(),
            previous_reason = escalation_reason.map_or("none", ReasonCode::as_str),
            "manual override applied"
        );

        self.flush_outbox();
        Ok(updated)
    }

    /// Fetch a receipt for API responses.
    pub fn get(&self, receipt_id: &ReceiptId) -> Result<Receipt, ReceiptServiceError> {
        let receipt = self
            .repository
            .fetch(receipt_id)?
            .ok_or(RepositoryError::NotFound)?;
        Ok(receipt)
    }

    /// Publish undelivered outbox events in order. Stops at the first publish failure; the
    /// remaining events stay queued for the next call.
    pub fn dispatch_outbox(&self, limit: usize) -> Result<usize, ReceiptServiceError> {
        let pending = self.repository.undelivered(limit)?;
        let mut delivered = Vec::with_capacity(pending.len());
        let mut failure = None;

        for entry in &pending {
            match self.publisher.publish(&entry.event) {
                Ok(()) => delivered.push(entry.sequence),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.repository.mark_delivered(&delivered)?;
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(delivered.len()),
        }
    }

    fn flush_outbox(&self) {
        if let Err(err) = self.dispatch_outbox(OUTBOX_BATCH) {
            warn!(error = %err, "outbox dispatch deferred");
        }
    }

    fn build_pending(&self, ready: &ReceiptReady) -> Receipt {
        let snapshot = self.catalog.snapshot();
        let candidates: Vec<LineCandidate> = ready.line_items.iter().map(candidate).collect();
        let line_items = self.matcher.match_lines(&candidates, &snapshot);

        let fingerprint = ready
            .fingerprint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                fingerprint::compute(
                    &ready.line_items,
                    ready.declared_total,
                    ready.purchase_timestamp,
                )
            });

        Receipt {
            receipt_id: ready.receipt_id.clone(),
            user_id: ready.user_id.clone(),
            uploaded_at: ready.uploaded_at.unwrap_or_else(|| self.clock.now()),
            purchased_at: ready.purchase_timestamp,
            artifact_ref: ready.artifact_ref.clone(),
            status: ReceiptStatus::Pending,
            fingerprint,
            declared_total: ready.declared_total,
            currency: ready
                .currency
                .as_deref()
                .map(|currency| currency.trim().to_uppercase())
                .unwrap_or_default(),
            line_items,
            decision: None,
            manual_override: None,
            sequence: 0,
        }
    }
}

fn candidate(line: &OcrLine) -> LineCandidate {
    LineCandidate {
        raw_text: line.raw_text.clone(),
        quantity: line.quantity.unwrap_or(1),
        unit_price: line.unit_price.unwrap_or(0).max(0),
        ocr_confidence: line
            .ocr_confidence
            .filter(|value| value.is_finite())
            .unwrap_or(0.0),
    }
}

fn decision_kind(decision: &EligibilityDecision) -> DecisionKind {
    match decision {
        EligibilityDecision::Accept => DecisionKind::Accept,
        EligibilityDecision::Reject(_) => DecisionKind::Reject,
        EligibilityDecision::Escalate(_) => DecisionKind::Escalate,
    }
}

/// Describes the first missing or out-of-range OCR field, if any.
fn malformed_reason(ready: &ReceiptReady) -> Option<String> {
    if ready.line_items.is_empty() {
        return Some("no line items in OCR payload".to_string());
    }
    if ready
        .currency
        .as_deref()
        .map_or(true, |currency| currency.trim().is_empty())
    {
        return Some("currency missing".to_string());
    }
    if ready.declared_total.is_some_and(|total| total < 0) {
        return Some("declared total is negative".to_string());
    }

    for (index, line) in ready.line_items.iter().enumerate() {
        if line.raw_text.trim().is_empty() {
            return Some(format!("line {index}: raw_text missing"));
        }
        match line.ocr_confidence {
            None => return Some(format!("line {index}: ocr_confidence missing")),
            Some(value) if !(0.0..=1.0).contains(&value) => {
                return Some(format!("line {index}: ocr_confidence {value} out of range"));
            }
            Some(_) => {}
        }
        if line.quantity == Some(0) {
            return Some(format!("line {index}: quantity is zero"));
        }
        if line.unit_price.is_some_and(|price| price < 0) {
            return Some(format!("line {index}: unit_price is negative"));
        }
    }
    None
}

/// Rejected intake payloads that cannot be stored at all.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("reviewer identity is required")]
    MissingReviewer,
    #[error("receipt is {}, only manual_review receipts can be overridden", .status.label())]
    NotUnderReview { status: ReceiptStatus },
}

/// Error raised by the receipt intake service.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptServiceError {
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}
