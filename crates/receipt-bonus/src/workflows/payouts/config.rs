use std::time::Duration;

use super::msisdn::PayeeDirectory;
use super::retry::BackoffPolicy;

/// Policy knobs shared by the orchestrator and its worker loop.
#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Fixed bonus per accepted receipt, in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
    /// Transient failures tolerated before a transaction fails permanently.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub provider_timeout: Duration,
    /// `in_flight` transactions older than this are reconciled against the provider.
    pub reconcile_grace: Duration,
    pub lease_ttl: Duration,
    /// Pause between background retry and reconciliation sweeps.
    pub sweep_interval: Duration,
    /// Successful payouts allowed per UTC day, system-wide. 0 disables the cap.
    pub daily_success_cap: u32,
    pub callback_token: Option<String>,
    pub payees: PayeeDirectory,
    /// Lease owner name for this process.
    pub worker_id: String,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            amount_minor: 100,
            currency: "UAH".to_string(),
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            provider_timeout: Duration::from_secs(10),
            reconcile_grace: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            daily_success_cap: 10,
            callback_token: None,
            payees: PayeeDirectory::default(),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}
