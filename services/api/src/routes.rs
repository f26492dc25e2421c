use crate::infra::{AppState, Orchestrator, ReceiptService};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use receipt_bonus::store::InMemoryRecipientDirectory;
use receipt_bonus::workflows::payouts::{payout_router, Msisdn};
use receipt_bonus::workflows::receipts::{receipt_router, UserId};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub(crate) struct RecipientRegistration {
    pub(crate) msisdn: String,
}

pub(crate) fn with_receipt_bonus_routes(
    receipts: Arc<ReceiptService>,
    payouts: Arc<Orchestrator>,
    recipients: Arc<InMemoryRecipientDirectory>,
) -> axum::Router {
    let recipient_routes = axum::Router::new()
        .route(
            "/api/v1/recipients/:user_id",
            axum::routing::put(register_recipient),
        )
        .with_state(recipients);

    receipt_router(receipts)
        .merge(payout_router(payouts))
        .merge(recipient_routes)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Stores the normalised number a user wants bonuses delivered to.
pub(crate) async fn register_recipient(
    State(recipients): State<Arc<InMemoryRecipientDirectory>>,
    Path(user_id): Path<String>,
    Json(registration): Json<RecipientRegistration>,
) -> Response {
    let msisdn = match Msisdn::parse(&registration.msisdn) {
        Ok(msisdn) => msisdn,
        Err(err) => {
            let payload = json!({ "user_id": user_id, "error": err.to_string() });
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(payload)).into_response();
        }
    };

    let user = UserId(user_id);
    if let Err(err) = recipients.register(user.clone(), msisdn.as_str()) {
        let payload = json!({ "error": err.to_string() });
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response();
    }

    info!(user_id = %user.0, msisdn = %msisdn.masked(), "recipient registered");
    let payload = json!({
        "user_id": user.0,
        "msisdn": msisdn.masked(),
        "operator": msisdn.operator(),
    });
    (StatusCode::OK, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{ChannelPublisher, LogNotifier, SandboxProvider};
    use axum::body::Body;
    use axum::http::Request;
    use receipt_bonus::clock::SystemClock;
    use receipt_bonus::store::{InMemoryLedger, InMemoryReceiptStore};
    use receipt_bonus::workflows::payouts::{PayoutConfig, PayoutOrchestrator, RecipientDirectory};
    use receipt_bonus::workflows::receipts::{
        CatalogCache, EligibilityConfig, MatcherConfig, ReceiptIntakeService, StaticCatalogSource,
    };
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn router() -> (axum::Router, Arc<InMemoryRecipientDirectory>) {
        let (sender, _receiver) = mpsc::channel(8);
        let receipts = Arc::new(ReceiptIntakeService::new(
            Arc::new(InMemoryReceiptStore::new()),
            Arc::new(ChannelPublisher::new(sender)),
            Arc::new(CatalogCache::new(Arc::new(StaticCatalogSource::default()))),
            MatcherConfig::default(),
            EligibilityConfig::default(),
            Arc::new(SystemClock),
        ));
        let recipients = Arc::new(InMemoryRecipientDirectory::new());
        let payouts = Arc::new(PayoutOrchestrator::new(
            Arc::new(InMemoryLedger::new()),
            Arc::new(SandboxProvider::default()),
            Arc::new(LogNotifier),
            recipients.clone(),
            Arc::new(SystemClock),
            PayoutConfig::default(),
        ));
        (
            with_receipt_bonus_routes(receipts, payouts, recipients.clone()),
            recipients,
        )
    }

    fn put_number(user_id: &str, msisdn: &str) -> Request<Body> {
        Request::put(format!("/api/v1/recipients/{user_id}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({ "msisdn": msisdn })).unwrap(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let Json(body) = healthcheck().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn registers_normalised_recipient_numbers() {
        let (router, recipients) = router();

        let response = router
            .oneshot(put_number("user-7", "+38 (067) 123-45-67"))
            .await
            .expect("route executes");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            recipients
                .msisdn_for(&UserId("user-7".to_string()))
                .expect("lookup"),
            Some("380671234567".to_string())
        );
    }

    #[tokio::test]
    async fn rejects_foreign_numbers() {
        let (router, recipients) = router();

        let response = router
            .oneshot(put_number("user-8", "+48 601 234 567"))
            .await
            .expect("route executes");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            recipients
                .msisdn_for(&UserId("user-8".to_string()))
                .expect("lookup"),
            None
        );
    }
}
