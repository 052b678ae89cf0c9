use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use shared::DomainError;
use std::sync::Arc;
use tracing::error;

use crate::notification::GatewayKind;
use crate::webhook::{NotificationOutcome, NotificationProcessor};

pub const SIGNATURE_HEADER: &str = "x-signature";

/// HTTP rendering of [`DomainError`]. Security failures carry no detail.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            DomainError::OutOfStock {
                product_id,
                available,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "out_of_stock",
                    "product_id": product_id,
                    "available": available,
                }),
            ),
            DomainError::InsufficientInventory(shortfalls) => (
                StatusCode::CONFLICT,
                json!({ "error": "insufficient_inventory", "products": shortfalls }),
            ),
            DomainError::AddressNotServiceable => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": "address_not_serviceable", "message": self.0.to_string() }),
            ),
            DomainError::InvalidStateTransition { from, to } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "invalid_state_transition",
                    "message": match from {
                        shared::OrderStatus::Complete => "order is already completed".to_string(),
                        shared::OrderStatus::Cancelled => "order is already cancelled".to_string(),
                        _ => format!("cannot move order from {from} to {to}"),
                    },
                }),
            ),
            DomainError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "rejected" }))
            }
            DomainError::AmountMismatch { .. } => {
                (StatusCode::BAD_REQUEST, json!({ "error": "rejected" }))
            }
            DomainError::OrderNotFound(_) => {
                (StatusCode::NOT_FOUND, json!({ "error": "order_not_found" }))
            }
            DomainError::DuplicateNotification => (StatusCode::OK, json!({ "outcome": "duplicate" })),
            DomainError::ReservationExpired(_) => (
                StatusCode::GONE,
                json!({
                    "error": "reservation_expired",
                    "message": "reservation has expired, please check out again",
                }),
            ),
            DomainError::EmptyCart => (StatusCode::BAD_REQUEST, json!({ "error": "empty_cart" })),
            DomainError::ProductNotFound(product_id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "product_not_found", "product_id": product_id }),
            ),
            DomainError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_request", "message": message }),
            ),
            DomainError::Gateway(message) => {
                error!(error = %message, "Payment gateway call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": "payment_gateway_unavailable" }),
                )
            }
            DomainError::Store(e) => {
                error!(error = %e, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal_error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<NotificationProcessor>,
}

pub fn create_router(processor: Arc<NotificationProcessor>) -> Router {
    Router::new()
        .route("/payments/:gateway/notification", post(receive_notification))
        .with_state(WebhookState { processor })
}

pub async fn receive_notification(
    State(state): State<WebhookState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<NotificationOutcome>, ApiError> {
    let gateway: GatewayKind = gateway.parse()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.processor.process(gateway, &body, signature).await?;
    Ok(Json(outcome))
}

pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check() -> &'static str {
    "OK"
}
