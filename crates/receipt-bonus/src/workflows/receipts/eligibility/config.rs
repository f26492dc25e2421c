use serde::{Deserialize, Serialize};

/// Whether a content fingerprint only collides with the same user's receipts or with anyone's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    PerUser,
    Global,
}

/// Business-rule thresholds, injected once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityConfig {
    pub high_confidence: f64,
    pub low_confidence: f64,
    pub age_window_days: u32,
    pub max_accepted_per_day: u32,
    pub total_tolerance_pct: f64,
    pub dedup_scope: DedupScope,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.8,
            low_confidence: 0.4,
            age_window_days: 7,
            max_accepted_per_day: 3,
            total_tolerance_pct: 1.0,
            dedup_scope: DedupScope::Global,
        }
    }
}
