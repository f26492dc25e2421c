use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use super::domain::{PayoutCallback, ResubmitRequest, TransactionId};
use super::ledger::{Ledger, LedgerError};
use super::notifier::PayoutNotifier;
use super::orchestrator::{CallbackDisposition, OrchestratorError, PayoutOrchestrator};
use super::provider::PayoutProvider;
use crate::workflows::receipts::ReceiptId;

/// Header carrying the shared secret on provider callbacks.
pub const CALLBACK_TOKEN_HEADER: &str = "x-payout-token";

/// Router builder exposing the provider callback and operator endpoints.
pub fn payout_router<L, P, N>(orchestrator: Arc<PayoutOrchestrator<L, P, N>>) -> Router
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    Router::new()
        .route("/api/v1/payouts/callback", post(callback_handler::<L, P, N>))
        .route(
            "/api/v1/payouts/receipts/:receipt_id",
            get(receipt_payouts_handler::<L, P, N>),
        )
        .route(
            "/api/v1/payouts/:transaction_id/resubmit",
            post(resubmit_handler::<L, P, N>),
        )
        .with_state(orchestrator)
}

pub(crate) async fn callback_handler<L, P, N>(
    State(orchestrator): State<Arc<PayoutOrchestrator<L, P, N>>>,
    headers: HeaderMap,
    axum::Json(callback): axum::Json<PayoutCallback>,
) -> Response
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    if let Some(expected) = orchestrator.config().callback_token.as_deref() {
        let presented = headers
            .get(CALLBACK_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected) {
            let payload = json!({ "error": "invalid callback token" });
            return (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response();
        }
    }

    match orchestrator.handle_callback(&callback).await {
        Ok(disposition) => {
            let result = match disposition {
                CallbackDisposition::Applied(status) => status.label(),
                CallbackDisposition::Duplicate => "duplicate",
                CallbackDisposition::Ignored => "ignored",
                CallbackDisposition::Conflict => "conflict",
            };
            (StatusCode::OK, axum::Json(json!({ "result": result }))).into_response()
        }
        Err(OrchestratorError::UnknownCallback) => {
            let payload = json!({ "error": "callback does not match any transaction" });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(OrchestratorError::Busy)
        | Err(OrchestratorError::Ledger(LedgerError::VersionConflict { .. })) => {
            let payload = json!({ "error": "transaction busy, retry later" });
            (StatusCode::SERVICE_UNAVAILABLE, axum::Json(payload)).into_response()
        }
        Err(other) => internal_error(other),
    }
}

pub(crate) async fn receipt_payouts_handler<L, P, N>(
    State(orchestrator): State<Arc<PayoutOrchestrator<L, P, N>>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    let id = ReceiptId(receipt_id);
    match orchestrator.transactions_for_receipt(&id) {
        Ok(transactions) if transactions.is_empty() => {
            let payload = json!({
                "receipt_id": id.0,
                "error": "no payout for receipt",
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Ok(transactions) => {
            let views: Vec<_> = transactions
                .iter()
                .map(|transaction| transaction.status_view())
                .collect();
            (StatusCode::OK, axum::Json(views)).into_response()
        }
        Err(other) => internal_error(other),
    }
}

pub(crate) async fn resubmit_handler<L, P, N>(
    State(orchestrator): State<Arc<PayoutOrchestrator<L, P, N>>>,
    Path(transaction_id): Path<String>,
    axum::Json(request): axum::Json<ResubmitRequest>,
) -> Response
where
    L: Ledger + 'static,
    P: PayoutProvider + 'static,
    N: PayoutNotifier + 'static,
{
    let id = TransactionId(transaction_id);
    match orchestrator.resubmit(&id, &request).await {
        Ok(transaction) => {
            (StatusCode::ACCEPTED, axum::Json(transaction.status_view())).into_response()
        }
        Err(OrchestratorError::NotFound) => {
            let payload = json!({
                "transaction_id": id.0,
                "error": "transaction not found",
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(error @ OrchestratorError::NotResubmittable { .. })
        | Err(error @ OrchestratorError::Ledger(LedgerError::Conflict))
        | Err(error @ OrchestratorError::Ledger(LedgerError::VersionConflict { .. })) => {
            let payload = json!({ "error": error.to_string() });
            (StatusCode::CONFLICT, axum::Json(payload)).into_response()
        }
        Err(error @ OrchestratorError::MissingOperator)
        | Err(error @ OrchestratorError::InvalidRecipient(_)) => {
            let payload = json!({ "error": error.to_string() });
            (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)).into_response()
        }
        Err(other) => internal_error(other),
    }
}

fn internal_error(error: OrchestratorError) -> Response {
    let payload = json!({
        "error": error.to_string(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
}
