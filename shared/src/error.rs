use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::OrderStatus;

/// Failures of the transactional or ephemeral stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("field cipher error: {0}")]
    Cipher(String),

    #[error("transaction already finished")]
    TransactionClosed,
}

/// A cart line that could not be satisfied at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub product_id: Uuid,
    pub requested: i64,
    pub available: i64,
}

/// Business-rule and protocol failures surfaced by the checkout core.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("product {product_id} is out of stock ({available} available)")]
    OutOfStock { product_id: Uuid, available: i64 },

    #[error("insufficient inventory for {} product(s)", .0.len())]
    InsufficientInventory(Vec<Shortfall>),

    #[error("delivery address is outside the service area")]
    AddressNotServiceable,

    #[error("invalid status transition from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    #[error("invalid notification signature")]
    InvalidSignature,

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("notification amount {received} does not match order total {expected}")]
    AmountMismatch { expected: i64, received: String },

    #[error("notification already processed")]
    DuplicateNotification,

    #[error("reservations for order {0} are no longer active")]
    ReservationExpired(String),

    #[error("cart is empty")]
    EmptyCart,

    #[error("product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DomainError {
    /// Errors that must be logged as security events and hidden from the caller.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            DomainError::InvalidSignature | DomainError::AmountMismatch { .. }
        )
    }
}

pub type Result<T, E = DomainError> = std::result::Result<T, E>;
