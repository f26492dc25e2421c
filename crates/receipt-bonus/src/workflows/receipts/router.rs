use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use super::domain::{ReceiptId, ReceiptReady, ReviewerOverride};
use super::repository::{EventPublisher, ReceiptRepository, RepositoryError};
use super::service::{OverrideError, ReceiptIntakeService, ReceiptServiceError};

/// Router builder exposing HTTP endpoints for receipt intake, status and manual review.
pub fn receipt_router<R, P>(service: Arc<ReceiptIntakeService<R, P>>) -> Router
where
    R: ReceiptRepository + 'static,
    P: EventPublisher + 'static,
{
    Router::new()
        .route("/api/v1/receipts", post(ingest_handler::<R, P>))
        .route("/api/v1/receipts/:receipt_id", get(status_handler::<R, P>))
        .route(
            "/api/v1/receipts/:receipt_id/override",
            post(override_handler::<R, P>),
        )
        .with_state(service)
}

pub(crate) async fn ingest_handler<R, P>(
    State(service): State<Arc<ReceiptIntakeService<R, P>>>,
    axum::Json(ready): axum::Json<ReceiptReady>,
) -> Response
where
    R: ReceiptRepository + 'static,
    P: EventPublisher + 'static,
{
    match service.ingest(ready) {
        Ok(receipt) => (StatusCode::ACCEPTED, axum::Json(receipt.status_view())).into_response(),
        Err(ReceiptServiceError::Intake(error)) => {
            let payload = json!({
                "error": error.to_string(),
            });
            (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response()
        }
        Err(other) => internal_error(other),
    }
}

pub(crate) async fn status_handler<R, P>(
    State(service): State<Arc<ReceiptIntakeService<R, P>>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    R: ReceiptRepository + 'static,
    P: EventPublisher + 'static,
{
    let id = ReceiptId(receipt_id);
    match service.get(&id) {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.status_view())).into_response(),
        Err(ReceiptServiceError::Repository(RepositoryError::NotFound)) => not_found(&id),
        Err(other) => internal_error(other),
    }
}

pub(crate) async fn override_handler<R, P>(
    State(service): State<Arc<ReceiptIntakeService<R, P>>>,
    Path(receipt_id): Path<String>,
    axum::Json(request): axum::Json<ReviewerOverride>,
) -> Response
where
    R: ReceiptRepository + 'static,
    P: EventPublisher + 'static,
{
    let id = ReceiptId(receipt_id);
    match service.override_decision(&id, request) {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.status_view())).into_response(),
        Err(ReceiptServiceError::Repository(RepositoryError::NotFound)) => not_found(&id),
        Err(ReceiptServiceError::Override(error)) => {
            let status = match error {
                OverrideError::MissingReviewer => StatusCode::UNPROCESSABLE_ENTITY,
                OverrideError::NotUnderReview { .. } => StatusCode::CONFLICT,
            };
            let payload = json!({
                "error": error.to_string(),
            });
            (status, axum::Json(payload)).into_response()
        }
        Err(ReceiptServiceError::Repository(RepositoryError::StaleStatus { .. })) => {
            let payload = json!({
                "error": "receipt was resolved concurrently",
            });
            (StatusCode::CONFLICT, axum::Json(payload)).into_response()
        }
        Err(other) => internal_error(other),
    }
}

fn not_found(id: &ReceiptId) -> Response {
    let payload = json!({
        "receipt_id": id.0,
        "error": "receipt not found",
    });
    (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
}

fn internal_error(error: ReceiptServiceError) -> Response {
    let payload = json!({
        "error": error.to_string(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
}
