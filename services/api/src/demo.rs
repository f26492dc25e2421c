use crate::infra::{seed_catalog, ChannelPublisher, LogNotifier, SandboxProvider};
use chrono::{Duration, Utc};
use clap::Args;
use receipt_bonus::clock::SystemClock;
use receipt_bonus::error::AppError;
use receipt_bonus::store::{InMemoryLedger, InMemoryReceiptStore, InMemoryRecipientDirectory};
use receipt_bonus::workflows::payouts::{
    Msisdn, OrchestratorError, PayoutConfig, PayoutOrchestrator, PayoutStatusView,
};
use receipt_bonus::workflows::receipts::{
    CatalogCache, EligibilityConfig, MatcherConfig, OcrLine, ReceiptId, ReceiptIntakeService,
    ReceiptReady, ReceiptStatusView, StaticCatalogSource, UserId,
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// User submitting the receipt.
    #[arg(long, default_value = "demo-user")]
    pub(crate) user_id: String,
    /// Phone number the bonus is delivered to.
    #[arg(long, default_value = "+380 67 123 45 67")]
    pub(crate) msisdn: String,
    /// Product line as printed on the receipt.
    #[arg(long, default_value = "Цитрамон Дарниця")]
    pub(crate) line: String,
    /// OCR confidence reported for the line.
    #[arg(long, default_value_t = 0.92)]
    pub(crate) confidence: f64,
    /// Line price in kopiyky.
    #[arg(long, default_value_t = 4500)]
    pub(crate) price_minor: i64,
    /// Days between purchase and upload.
    #[arg(long, default_value_t = 1)]
    pub(crate) purchased_days_ago: i64,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            user_id: "demo-user".to_string(),
            msisdn: "+380 67 123 45 67".to_string(),
            line: "Цитрамон Дарниця".to_string(),
            confidence: 0.92,
            price_minor: 4500,
            purchased_days_ago: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DemoReport {
    pub(crate) receipt: ReceiptStatusView,
    pub(crate) payouts: Vec<PayoutStatusView>,
    pub(crate) provider_charges: usize,
}

/// Walks one receipt from OCR output to a delivered bonus, then redelivers the acceptance
/// event to show that the provider is charged once.
pub(crate) async fn execute_demo(args: &DemoArgs) -> Result<DemoReport, AppError> {
    let msisdn = Msisdn::parse(&args.msisdn).map_err(OrchestratorError::from)?;

    let catalog = Arc::new(CatalogCache::primed(Arc::new(StaticCatalogSource::new(
        seed_catalog(),
    )))?);
    let (accepted_tx, mut accepted_rx) = mpsc::channel(16);
    let receipts = ReceiptIntakeService::new(
        Arc::new(InMemoryReceiptStore::new()),
        Arc::new(ChannelPublisher::new(accepted_tx)),
        catalog,
        MatcherConfig::default(),
        EligibilityConfig::default(),
        Arc::new(SystemClock),
    );

    let recipients = Arc::new(InMemoryRecipientDirectory::new());
    recipients
        .register(UserId(args.user_id.clone()), msisdn.as_str())
        .map_err(OrchestratorError::from)?;
    let provider = Arc::new(SandboxProvider::default());
    let payouts = PayoutOrchestrator::new(
        Arc::new(InMemoryLedger::new()),
        provider.clone(),
        Arc::new(LogNotifier),
        recipients,
        Arc::new(SystemClock),
        PayoutConfig::default(),
    );

    let now = Utc::now();
    let receipt_id = ReceiptId(format!("demo-{}", now.timestamp_millis()));
    let receipt = receipts.ingest(ReceiptReady {
        receipt_id: receipt_id.clone(),
        user_id: UserId(args.user_id.clone()),
        line_items: vec![OcrLine {
            raw_text: args.line.clone(),
            quantity: Some(1),
            unit_price: Some(args.price_minor),
            ocr_confidence: Some(args.confidence),
        }],
        purchase_timestamp: Some(now - Duration::days(args.purchased_days_ago)),
        declared_total: Some(args.price_minor),
        currency: Some("UAH".to_string()),
        fingerprint: None,
        uploaded_at: Some(now),
        artifact_ref: None,
    })?;

    let mut delivered = Vec::new();
    while let Ok(event) = accepted_rx.try_recv() {
        delivered.push(event);
    }
    for event in delivered.iter().chain(delivered.iter()) {
        payouts.handle_acceptance(event).await?;
    }

    let history = payouts.transactions_for_receipt(&receipt_id)?;
    Ok(DemoReport {
        receipt: receipt.status_view(),
        payouts: history.iter().map(|tx| tx.status_view()).collect(),
        provider_charges: provider.charges(),
    })
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let report = execute_demo(&args).await?;

    println!("== Receipt decision ==");
    println!(
        "{} -> {} ({})",
        report.receipt.receipt_id.0, report.receipt.status, report.receipt.decision_rationale
    );
    if !report.receipt.matched_skus.is_empty() {
        let skus: Vec<&str> = report
            .receipt
            .matched_skus
            .iter()
            .map(|sku| sku.0.as_str())
            .collect();
        println!("matched: {}", skus.join(", "));
    }
    if let Some(confidence) = report.receipt.aggregate_confidence {
        println!("aggregate confidence: {confidence:.2}");
    }

    println!("\n== Bonus payouts ==");
    if report.payouts.is_empty() {
        println!("no payout started");
    }
    for payout in &report.payouts {
        println!(
            "{} {} {} {} (retries: {})",
            payout.transaction_id.0,
            payout.status,
            payout.amount_minor,
            payout.currency,
            payout.retry_count
        );
    }
    println!("provider charges: {}", report.provider_charges);

    Ok(())
}
