use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod cipher;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod reference;
pub mod schema;
pub mod store;

pub use error::{DomainError, Shortfall, StoreError};

/// Order lifecycle. `Complete` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Complete,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Complete,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Complete | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Paid, OrderStatus::Complete)
                | (OrderStatus::Paid, OrderStatus::Cancelled)
        )
    }

    /// Validates `self -> next` against the transition table.
    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStateTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "COMPLETE" => Ok(OrderStatus::Complete),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown order status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Expired,
    Converted,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Converted => "converted",
            ReservationStatus::Released => "released",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl FromStr for ReservationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "expired" => Ok(ReservationStatus::Expired),
            "converted" => Ok(ReservationStatus::Converted),
            "released" => Ok(ReservationStatus::Released),
            other => Err(StoreError::Corrupt(format!("unknown reservation status '{other}'"))),
        }
    }
}

/// Why an active reservation is being given back to stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Released,
}

impl From<ReleaseReason> for ReservationStatus {
    fn from(reason: ReleaseReason) -> Self {
        match reason {
            ReleaseReason::Expired => ReservationStatus::Expired,
            ReleaseReason::Released => ReservationStatus::Released,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    Pickup,
    Delivery,
    DineIn,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Pickup => "pickup",
            DeliveryType::Delivery => "delivery",
            DeliveryType::DineIn => "dine_in",
        }
    }
}

impl FromStr for DeliveryType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pickup" => Ok(DeliveryType::Pickup),
            "delivery" => Ok(DeliveryType::Delivery),
            "dine_in" => Ok(DeliveryType::DineIn),
            other => Err(StoreError::Corrupt(format!("unknown delivery type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Catalog record for a sellable product. Owned by the catalog, read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub sku: String,
    pub unit_price: i64,
    pub total_quantity: i64,
}

/// A product row together with the quantities currently held against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub sku: String,
    pub unit_price: i64,
    pub total_quantity: i64,
    /// Sum of `active` reservations.
    pub reserved_quantity: i64,
    /// Sum of `converted` reservations.
    pub allocated_quantity: i64,
}

impl ProductStock {
    pub fn available(&self) -> i64 {
        (self.total_quantity - self.reserved_quantity - self.allocated_quantity).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub reference: String,
    pub status: OrderStatus,
    pub subtotal: i64,
    pub delivery_fee: i64,
    pub total: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_type: DeliveryType,
    pub table_number: Option<String>,
    pub notes: Option<String>,
    pub staff_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of a cart line taken when the order was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub gateway: String,
    pub external_transaction_id: Option<String>,
    pub external_order_id: String,
    pub amount: BigDecimal,
    pub payment_type: Option<String>,
    pub transaction_status: String,
    pub fraud_status: Option<String>,
    pub raw_payload: serde_json::Value,
    pub signature_verified: bool,
    pub idempotency_key: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub notification_received_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub id: Uuid,
    pub order_id: Uuid,
    pub address_text: String,
    pub coordinates: Coordinates,
    pub serviceable: bool,
    pub zone: Option<String>,
    pub fee: i64,
    pub distance_km: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Operator-facing record for a payment the system refused to apply automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationCase {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub payment_transaction_id: Option<Uuid>,
    pub reason: String,
    pub details: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Everything a status query needs about one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub reservations: Vec<Reservation>,
    pub address: Option<DeliveryAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    OrderCreated,
    OrderPaid,
    OrderCompleted,
    OrderCancelled,
    ReservationsReleased,
    ReconciliationRequired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "OrderCreated",
            EventType::OrderPaid => "OrderPaid",
            EventType::OrderCompleted => "OrderCompleted",
            EventType::OrderCancelled => "OrderCancelled",
            EventType::ReservationsReleased => "ReservationsReleased",
            EventType::ReconciliationRequired => "ReconciliationRequired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        aggregate_id: Uuid,
        event_type: EventType,
        event_data: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            event_type: event_type.as_str().to_string(),
            event_data,
            processed: false,
            created_at,
        }
    }
}
