use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post, put},
    Router,
};
use payment_service::api::{self as webhook_api, ApiError};
use payment_service::NotificationProcessor;
use serde::{Deserialize, Serialize};
use shared::{Order, OrderStatus, ReconciliationCase};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cart::{AddOutcome, Cart, CartService};
use crate::checkout::{CheckoutReceipt, CheckoutService, DeliveryInfo};
use crate::orders::{OrderService, OrderView};

#[derive(Clone)]
pub struct AppState {
    pub carts: CartService,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub cart: Cart,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<AddOutcome>,
}

impl CartResponse {
    fn new(cart: Cart, outcome: AddOutcome) -> Self {
        let adjustment = match outcome {
            AddOutcome::Added => None,
            adjusted => Some(adjusted),
        };
        Self { cart, adjustment }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub note: String,
}

pub fn create_router(state: AppState, webhook: Arc<NotificationProcessor>) -> Router {
    Router::new()
        .route("/carts/:tenant/:session", get(get_cart).delete(clear_cart))
        .route("/carts/:tenant/:session/items", post(add_item))
        .route(
            "/carts/:tenant/:session/items/:product",
            put(update_item).delete(remove_item),
        )
        .route("/checkout/:tenant/:session", post(checkout))
        .route("/orders/:tenant/:reference", get(get_order))
        .route("/orders/:tenant/:reference/payment", post(retry_payment))
        .route("/admin/:tenant/orders/:id/status", patch(transition_status))
        .route("/admin/:tenant/orders/:id/notes", post(add_staff_note))
        .route("/admin/:tenant/reconciliation", get(reconciliation_cases))
        .with_state(state)
        .merge(webhook_api::create_router(webhook))
        .merge(webhook_api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn get_cart(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(Uuid, String)>,
) -> Result<Json<Cart>, ApiError> {
    Ok(Json(state.carts.get_cart(tenant, &session).await?))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    state.carts.clear_cart(tenant, &session).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_item(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(Uuid, String)>,
    Json(request): Json<AddItemRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    let (cart, outcome) = state
        .carts
        .add_item(tenant, &session, request.product_id, request.quantity)
        .await?;
    Ok(Json(CartResponse::new(cart, outcome)))
}

pub async fn update_item(
    State(state): State<AppState>,
    Path((tenant, session, product)): Path<(Uuid, String, Uuid)>,
    Json(request): Json<UpdateItemRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    let (cart, outcome) = state
        .carts
        .update_item(tenant, &session, product, request.quantity)
        .await?;
    Ok(Json(CartResponse::new(cart, outcome)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path((tenant, session, product)): Path<(Uuid, String, Uuid)>,
) -> Result<Json<Cart>, ApiError> {
    Ok(Json(state.carts.remove_item(tenant, &session, product).await?))
}

pub async fn checkout(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(Uuid, String)>,
    Json(info): Json<DeliveryInfo>,
) -> Result<(StatusCode, Json<CheckoutReceipt>), ApiError> {
    let receipt = state.checkout.checkout(tenant, &session, &info).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path((tenant, reference)): Path<(Uuid, String)>,
) -> Result<Json<OrderView>, ApiError> {
    Ok(Json(state.orders.get_order(tenant, &reference).await?))
}

pub async fn retry_payment(
    State(state): State<AppState>,
    Path((tenant, reference)): Path<(Uuid, String)>,
) -> Result<Json<CheckoutReceipt>, ApiError> {
    Ok(Json(state.checkout.retry_payment(tenant, &reference).await?))
}

pub async fn transition_status(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(Uuid, Uuid)>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(
        state
            .orders
            .transition_status(tenant, id, request.status)
            .await?,
    ))
}

pub async fn add_staff_note(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(Uuid, Uuid)>,
    Json(request): Json<NoteRequest>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(state.orders.add_staff_note(tenant, id, &request.note).await?))
}

pub async fn reconciliation_cases(
    State(state): State<AppState>,
    Path(tenant): Path<Uuid>,
) -> Result<Json<Vec<ReconciliationCase>>, ApiError> {
    Ok(Json(state.orders.open_reconciliation_cases(tenant).await?))
}
