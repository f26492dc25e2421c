use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::workflows::payouts::{BackoffPolicy, PayeeDirectory, PayoutConfig};
use crate::workflows::receipts::{DedupScope, EligibilityConfig, MatcherConfig};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub eligibility: EligibilityConfig,
    pub matcher: MatcherConfig,
    pub payout: PayoutConfig,
    pub catalog: CatalogConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            eligibility: load_eligibility()?,
            matcher: load_matcher()?,
            payout: load_payout()?,
            catalog: CatalogConfig {
                refresh_interval: Duration::from_secs(parse_var("CATALOG_REFRESH_SECS", 300u64)?),
            },
        })
    }
}

fn load_eligibility() -> Result<EligibilityConfig, ConfigError> {
    let defaults = EligibilityConfig::default();
    let dedup_scope = match env::var("ELIGIBILITY_DEDUP_SCOPE") {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "global" | "system" => DedupScope::Global,
            "user" | "per_user" => DedupScope::PerUser,
            _ => return Err(ConfigError::invalid("ELIGIBILITY_DEDUP_SCOPE", raw)),
        },
        Err(_) => defaults.dedup_scope,
    };

    let config = EligibilityConfig {
        high_confidence: parse_var("ELIGIBILITY_HIGH_CONFIDENCE", defaults.high_confidence)?,
        low_confidence: parse_var("ELIGIBILITY_LOW_CONFIDENCE", defaults.low_confidence)?,
        age_window_days: parse_var("ELIGIBILITY_WINDOW_DAYS", defaults.age_window_days)?,
        max_accepted_per_day: parse_var(
            "ELIGIBILITY_MAX_ACCEPTED_PER_DAY",
            defaults.max_accepted_per_day,
        )?,
        total_tolerance_pct: parse_var(
            "ELIGIBILITY_TOTAL_TOLERANCE_PCT",
            defaults.total_tolerance_pct,
        )?,
        dedup_scope,
    };

    let thresholds_ordered = (0.0..=1.0).contains(&config.low_confidence)
        && (0.0..=1.0).contains(&config.high_confidence)
        && config.low_confidence <= config.high_confidence;
    if !thresholds_ordered {
        return Err(ConfigError::InconsistentThresholds {
            low: config.low_confidence,
            high: config.high_confidence,
        });
    }
    if !(config.total_tolerance_pct.is_finite() && config.total_tolerance_pct >= 0.0) {
        return Err(ConfigError::invalid(
            "ELIGIBILITY_TOTAL_TOLERANCE_PCT",
            config.total_tolerance_pct.to_string(),
        ));
    }

    Ok(config)
}

fn load_matcher() -> Result<MatcherConfig, ConfigError> {
    let defaults = MatcherConfig::default();
    let config = MatcherConfig {
        ocr_weight: parse_var("MATCHER_OCR_WEIGHT", defaults.ocr_weight)?,
        match_weight: parse_var("MATCHER_MATCH_WEIGHT", defaults.match_weight)?,
        max_edit_distance: parse_var("MATCHER_MAX_EDIT_DISTANCE", defaults.max_edit_distance)?,
        chars_per_edit: parse_var("MATCHER_CHARS_PER_EDIT", defaults.chars_per_edit)?,
        max_unit_price: parse_var("MATCHER_MAX_UNIT_PRICE", defaults.max_unit_price)?,
        keyword_match_quality: parse_var(
            "MATCHER_KEYWORD_QUALITY",
            defaults.keyword_match_quality,
        )?,
    };

    let weights_valid = config.ocr_weight >= 0.0
        && config.match_weight >= 0.0
        && config.ocr_weight + config.match_weight > 0.0;
    if !weights_valid {
        return Err(ConfigError::invalid(
            "MATCHER_OCR_WEIGHT",
            format!("{}/{}", config.ocr_weight, config.match_weight),
        ));
    }

    if !(0.0..=1.0).contains(&config.keyword_match_quality) {
        return Err(ConfigError::invalid(
            "MATCHER_KEYWORD_QUALITY",
            config.keyword_match_quality.to_string(),
        ));
    }

    Ok(config)
}

fn load_payout() -> Result<PayoutConfig, ConfigError> {
    let defaults = PayoutConfig::default();
    let backoff = BackoffPolicy {
        base_delay: Duration::from_millis(parse_var(
            "PAYOUT_BACKOFF_BASE_MS",
            defaults.backoff.base_delay.as_millis() as u64,
        )?),
        multiplier: parse_var("PAYOUT_BACKOFF_MULTIPLIER", defaults.backoff.multiplier)?,
        max_delay: Duration::from_millis(parse_var(
            "PAYOUT_BACKOFF_CAP_MS",
            defaults.backoff.max_delay.as_millis() as u64,
        )?),
        jitter: parse_var("PAYOUT_BACKOFF_JITTER", defaults.backoff.jitter)?,
    };
    if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
        return Err(ConfigError::invalid(
            "PAYOUT_BACKOFF_MULTIPLIER",
            backoff.multiplier.to_string(),
        ));
    }

    let default_payee = env::var("PAYOUT_PAYEE_DEFAULT").ok();
    let payees = PayeeDirectory {
        default: default_payee,
        kyivstar: env::var("PAYOUT_PAYEE_KYIVSTAR").ok(),
        vodafone: env::var("PAYOUT_PAYEE_VODAFONE").ok(),
        lifecell: env::var("PAYOUT_PAYEE_LIFECELL").ok(),
    };

    let amount_minor: i64 = parse_var("PAYOUT_AMOUNT_MINOR", defaults.amount_minor)?;
    if amount_minor <= 0 {
        return Err(ConfigError::invalid(
            "PAYOUT_AMOUNT_MINOR",
            amount_minor.to_string(),
        ));
    }

    let config = PayoutConfig {
        amount_minor,
        currency: env::var("PAYOUT_CURRENCY").unwrap_or(defaults.currency),
        max_retries: parse_var("PAYOUT_MAX_RETRIES", defaults.max_retries)?,
        backoff,
        provider_timeout: Duration::from_secs(parse_var(
            "PAYOUT_PROVIDER_TIMEOUT_SECS",
            defaults.provider_timeout.as_secs(),
        )?),
        reconcile_grace: Duration::from_secs(parse_var(
            "PAYOUT_RECONCILE_GRACE_SECS",
            defaults.reconcile_grace.as_secs(),
        )?),
        lease_ttl: Duration::from_secs(parse_var(
            "PAYOUT_LEASE_TTL_SECS",
            defaults.lease_ttl.as_secs(),
        )?),
        sweep_interval: Duration::from_secs(parse_var(
            "PAYOUT_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
        )?),
        daily_success_cap: parse_var("PAYOUT_DAILY_SUCCESS_CAP", defaults.daily_success_cap)?,
        callback_token: env::var("PAYOUT_CALLBACK_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty()),
        payees,
        worker_id: defaults.worker_id,
    };

    // A lease shorter than one provider call lets a second worker resend mid-flight.
    if config.lease_ttl <= config.provider_timeout {
        return Err(ConfigError::invalid(
            "PAYOUT_LEASE_TTL_SECS",
            format!(
                "{}s (provider timeout {}s)",
                config.lease_ttl.as_secs(),
                config.provider_timeout.as_secs()
            ),
        ));
    }
    if config.sweep_interval.is_zero() {
        return Err(ConfigError::invalid("PAYOUT_SWEEP_INTERVAL_SECS", "0"));
    }

    Ok(config)
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// How often the local catalog snapshot is rebuilt from its source.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub refresh_interval: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidValue { name: &'static str, value: String },
    InconsistentThresholds { low: f64, high: f64 },
}

impl ConfigError {
    fn invalid(name: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidValue { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
            ConfigError::InconsistentThresholds { low, high } => write!(
                f,
                "confidence thresholds must satisfy 0 <= low ({low}) <= high ({high}) <= 1"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidValue { .. }
            | ConfigError::InconsistentThresholds { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "ELIGIBILITY_HIGH_CONFIDENCE",
            "ELIGIBILITY_LOW_CONFIDENCE",
            "ELIGIBILITY_DEDUP_SCOPE",
            "PAYOUT_MAX_RETRIES",
            "PAYOUT_CALLBACK_TOKEN",
            "PAYOUT_AMOUNT_MINOR",
            "PAYOUT_BACKOFF_JITTER",
            "PAYOUT_PROVIDER_TIMEOUT_SECS",
            "PAYOUT_LEASE_TTL_SECS",
            "PAYOUT_SWEEP_INTERVAL_SECS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.eligibility.max_accepted_per_day, 3);
        assert_eq!(config.eligibility.dedup_scope, DedupScope::Global);
        assert_eq!(config.payout.max_retries, 3);
        assert_eq!(config.payout.amount_minor, 100);
        assert!(config.payout.callback_token.is_none());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        env::remove_var("APP_HOST");
    }

    #[test]
    fn rejects_inverted_confidence_thresholds() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ELIGIBILITY_HIGH_CONFIDENCE", "0.3");
        env::set_var("ELIGIBILITY_LOW_CONFIDENCE", "0.5");
        let result = AppConfig::load();
        reset_env();
        assert!(matches!(
            result,
            Err(ConfigError::InconsistentThresholds { .. })
        ));
    }

    #[test]
    fn reads_dedup_scope_and_callback_token() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ELIGIBILITY_DEDUP_SCOPE", "user");
        env::set_var("PAYOUT_CALLBACK_TOKEN", "s3cret");
        let config = AppConfig::load().expect("config loads");
        reset_env();
        assert_eq!(config.eligibility.dedup_scope, DedupScope::PerUser);
        assert_eq!(config.payout.callback_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn names_the_offending_variable() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PAYOUT_MAX_RETRIES", "many");
        let err = AppConfig::load().expect_err("invalid retries rejected");
        reset_env();
        assert!(err.to_string().contains("PAYOUT_MAX_RETRIES"));
    }

    #[test]
    fn rejects_lease_not_longer_than_provider_timeout() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PAYOUT_PROVIDER_TIMEOUT_SECS", "30");
        env::set_var("PAYOUT_LEASE_TTL_SECS", "30");
        let err = AppConfig::load().expect_err("lease must outlive a provider call");
        reset_env();
        assert!(err.to_string().contains("PAYOUT_LEASE_TTL_SECS"));
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PAYOUT_SWEEP_INTERVAL_SECS", "0");
        let err = AppConfig::load().expect_err("zero sweep interval rejected");
        reset_env();
        assert!(err.to_string().contains("PAYOUT_SWEEP_INTERVAL_SECS"));
    }

    #[test]
    fn backoff_jitter_is_a_switch() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PAYOUT_BACKOFF_JITTER", "false");
        let config = AppConfig::load().expect("config loads");
        reset_env();
        assert!(!config.payout.backoff.jitter);
    }
}
