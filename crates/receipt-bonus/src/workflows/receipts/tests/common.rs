use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::clock::FixedClock;
use crate::store::InMemoryReceiptStore;
use crate::workflows::receipts::{
    receipt_router, CatalogCache, CatalogEntry, CatalogSnapshot, DecisionUpdate, DedupScope,
    EligibilityConfig, EventPublisher, LineItem, MatcherConfig, OcrLine, OutboxEntry,
    PublishError, Receipt, ReceiptEvent, ReceiptId, ReceiptIntakeService, ReceiptReady,
    ReceiptRepository, ReceiptStatus, RepositoryError, SkuCode, StaticCatalogSource,
    UserHistory, UserId,
};

pub(super) type TestService = ReceiptIntakeService<InMemoryReceiptStore, RecordingPublisher>;

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

pub(super) fn catalog_entries() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            sku: SkuCode("DAR001".to_string()),
            aliases: vec![
                "Citramon Darnitsa".to_string(),
                "Цитрамон Дарниця".to_string(),
            ],
            keywords: Vec::new(),
            active: true,
        },
        CatalogEntry {
            sku: SkuCode("ANL002".to_string()),
            aliases: vec!["Analgin".to_string()],
            keywords: Vec::new(),
            active: true,
        },
        CatalogEntry {
            sku: SkuCode("NOS003".to_string()),
            aliases: vec!["Nosol".to_string()],
            keywords: Vec::new(),
            active: true,
        },
        CatalogEntry {
            sku: SkuCode("NOS004".to_string()),
            aliases: vec!["Nosol Spray".to_string()],
            keywords: Vec::new(),
            active: true,
        },
        CatalogEntry {
            sku: SkuCode("VAL009".to_string()),
            aliases: vec!["Validol".to_string()],
            keywords: Vec::new(),
            active: false,
        },
    ]
}

pub(super) fn snapshot() -> CatalogSnapshot {
    CatalogSnapshot::new(&catalog_entries())
}

pub(super) fn eligibility_config() -> EligibilityConfig {
    EligibilityConfig {
        high_confidence: 0.8,
        low_confidence: 0.4,
        age_window_days: 7,
        max_accepted_per_day: 3,
        total_tolerance_pct: 1.0,
        dedup_scope: DedupScope::Global,
    }
}

pub(super) fn matched(sku: &str, confidence: f64, unit_price: i64) -> LineItem {
    LineItem {
        sku: Some(SkuCode(sku.to_string())),
        raw_text: sku.to_lowercase(),
        quantity: 1,
        unit_price,
        confidence,
    }
}

pub(super) fn unmatched(text: &str, confidence: f64, unit_price: i64) -> LineItem {
    LineItem {
        sku: None,
        raw_text: text.to_string(),
        quantity: 1,
        unit_price,
        confidence,
    }
}

/// A pending receipt purchased one day before `now()` with the given lines.
pub(super) fn receipt(line_items: Vec<LineItem>, declared_total: Option<i64>) -> Receipt {
    Receipt {
        receipt_id: ReceiptId("rcpt-1".to_string()),
        user_id: UserId("user-1".to_string()),
        uploaded_at: now(),
        purchased_at: Some(now() - Duration::days(1)),
        artifact_ref: None,
        status: ReceiptStatus::Pending,
        fingerprint: "fp-1".to_string(),
        declared_total,
        currency: "UAH".to_string(),
        line_items,
        decision: None,
        manual_override: None,
        sequence: 1,
    }
}

pub(super) fn empty_history() -> UserHistory {
    UserHistory::default()
}

pub(super) fn ocr_line(text: &str, unit_price: i64, confidence: f64) -> OcrLine {
    OcrLine {
        raw_text: text.to_string(),
        quantity: Some(1),
        unit_price: Some(unit_price),
        ocr_confidence: Some(confidence),
    }
}

/// `ReceiptReady` for the canonical citramon purchase (45.00 UAH, bought yesterday).
pub(super) fn ready(receipt_id: &str, user_id: &str) -> ReceiptReady {
    ReceiptReady {
        receipt_id: ReceiptId(receipt_id.to_string()),
        user_id: UserId(user_id.to_string()),
        line_items: vec![ocr_line("Citramon Darnitsa", 4500, 0.92)],
        purchase_timestamp: Some(now() - Duration::days(1)),
        declared_total: Some(4500),
        currency: Some("UAH".to_string()),
        fingerprint: Some(format!("fp-{receipt_id}")),
        uploaded_at: None,
        artifact_ref: Some(format!("s3://receipts/{receipt_id}.jpg")),
    }
}

pub(super) fn build_service() -> (
    TestService,
    Arc<InMemoryReceiptStore>,
    Arc<RecordingPublisher>,
    Arc<FixedClock>,
) {
    build_service_with(eligibility_config())
}

pub(super) fn build_service_with(
    config: EligibilityConfig,
) -> (
    TestService,
    Arc<InMemoryReceiptStore>,
    Arc<RecordingPublisher>,
    Arc<FixedClock>,
) {
    let repository = Arc::new(InMemoryReceiptStore::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let clock = Arc::new(FixedClock::new(now()));
    let catalog = Arc::new(
        CatalogCache::primed(Arc::new(StaticCatalogSource::new(catalog_entries())))
            .expect("static catalog loads"),
    );
    let service = ReceiptIntakeService::new(
        repository.clone(),
        publisher.clone(),
        catalog,
        MatcherConfig::default(),
        config,
        clock.clone(),
    );
    (service, repository, publisher, clock)
}

#[derive(Default)]
pub(super) struct RecordingPublisher {
    events: Mutex<Vec<ReceiptEvent>>,
    offline: AtomicBool,
}

impl RecordingPublisher {
    pub(super) fn events(&self) -> Vec<ReceiptEvent> {
        self.events.lock().expect("publisher mutex poisoned").clone()
    }

    pub(super) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(super) fn accepted_receipts(&self) -> Vec<ReceiptId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ReceiptEvent::ReceiptAccepted(accepted) => Some(accepted.receipt_id),
                ReceiptEvent::DecisionMade(_) => None,
            })
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &ReceiptEvent) -> Result<(), PublishError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::Transport("broker offline".to_string()));
        }
        self.events
            .lock()
            .expect("publisher mutex poisoned")
            .push(event.clone());
        Ok(())
    }
}

pub(super) struct UnavailableRepository;

impl ReceiptRepository for UnavailableRepository {
    fn insert(&self, _receipt: Receipt) -> Result<Receipt, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &ReceiptId) -> Result<Option<Receipt>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn history(
        &self,
        _user_id: &UserId,
        _scope: DedupScope,
        _before_sequence: u64,
        _accepted_since: DateTime<Utc>,
    ) -> Result<UserHistory, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn apply_decision(
        &self,
        _id: &ReceiptId,
        _expected: ReceiptStatus,
        _update: DecisionUpdate,
        _recorded_at: DateTime<Utc>,
    ) -> Result<Receipt, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn undelivered(&self, _limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn mark_delivered(&self, _sequences: &[u64]) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) fn unavailable_router() -> axum::Router {
    let catalog = Arc::new(CatalogCache::new(Arc::new(StaticCatalogSource::new(
        catalog_entries(),
    ))));
    let service = ReceiptIntakeService::new(
        Arc::new(UnavailableRepository),
        Arc::new(RecordingPublisher::default()),
        catalog,
        MatcherConfig::default(),
        eligibility_config(),
        Arc::new(FixedClock::new(now())),
    );
    receipt_router(Arc::new(service))
}

pub(super) fn router_with_service(service: TestService) -> axum::Router {
    receipt_router(Arc::new(service))
}

pub(super) fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
