use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    Coordinates, DeliveryAddress, Order, OrderItem, OutboxEvent, PaymentTransaction, Product,
    ReconciliationCase, Reservation, StoreError,
};

pub fn to_numeric(value: i64) -> BigDecimal {
    BigDecimal::from(value)
}

pub fn from_numeric(value: &BigDecimal, field: &str) -> Result<i64, StoreError> {
    if value.with_scale(0) != *value {
        return Err(StoreError::Corrupt(format!("{field} has a fractional part: {value}")));
    }
    value
        .to_i64()
        .ok_or_else(|| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct ProductRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: BigDecimal,
    pub total_quantity: i32,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            unit_price: from_numeric(&row.price, "products.price")?,
            name: row.name,
            sku: row.sku,
            total_quantity: i64::from(row.total_quantity),
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub reference: String,
    pub status: String,
    pub subtotal: BigDecimal,
    pub delivery_fee: BigDecimal,
    pub total: BigDecimal,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_type: String,
    pub table_number: Option<String>,
    pub notes: Option<String>,
    pub staff_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            tenant_id: order.tenant_id,
            reference: order.reference.clone(),
            status: order.status.as_str().to_string(),
            subtotal: to_numeric(order.subtotal),
            delivery_fee: to_numeric(order.delivery_fee),
            total: to_numeric(order.total),
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            delivery_type: order.delivery_type.as_str().to_string(),
            table_number: order.table_number.clone(),
            notes: order.notes.clone(),
            staff_notes: order.staff_notes.clone(),
            created_at: order.created_at,
            updated_at: order.updated_at,
            paid_at: order.paid_at,
            completed_at: order.completed_at,
            cancelled_at: order.cancelled_at,
        }
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            status: row.status.parse()?,
            subtotal: from_numeric(&row.subtotal, "orders.subtotal")?,
            delivery_fee: from_numeric(&row.delivery_fee, "orders.delivery_fee")?,
            total: from_numeric(&row.total, "orders.total")?,
            delivery_type: row.delivery_type.parse()?,
            reference: row.reference,
            customer_name: row.customer_name,
            customer_phone: row.customer_phone,
            table_number: row.table_number,
            notes: row.notes,
            staff_notes: row.staff_notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            paid_at: row.paid_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
}

impl From<&OrderItem> for OrderItemRow {
    fn from(item: &OrderItem) -> Self {
        Self {
            id: item.id,
            order_id: item.order_id,
            position: item.position,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            sku: item.sku.clone(),
            quantity: item.quantity,
            unit_price: to_numeric(item.unit_price),
            total_price: to_numeric(item.total_price),
        }
    }
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = StoreError;

    fn try_from(row: OrderItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            position: row.position,
            product_id: row.product_id,
            unit_price: from_numeric(&row.unit_price, "order_items.unit_price")?,
            total_price: from_numeric(&row.total_price, "order_items.total_price")?,
            product_name: row.product_name,
            sku: row.sku,
            quantity: row.quantity,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::inventory_reservations)]
pub struct ReservationRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl From<&Reservation> for ReservationRow {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            tenant_id: r.tenant_id,
            order_id: r.order_id,
            product_id: r.product_id,
            quantity: r.quantity,
            status: r.status.as_str().to_string(),
            created_at: r.created_at,
            expires_at: r.expires_at,
            released_at: r.released_at,
        }
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            order_id: row.order_id,
            product_id: row.product_id,
            quantity: row.quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
            released_at: row.released_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::payment_transactions)]
pub struct PaymentTransactionRow {
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

impl From<&PaymentTransaction> for PaymentTransactionRow {
    fn from(p: &PaymentTransaction) -> Self {
        Self {
            id: p.id,
            order_id: p.order_id,
            gateway: p.gateway.clone(),
            external_transaction_id: p.external_transaction_id.clone(),
            external_order_id: p.external_order_id.clone(),
            amount: p.amount.clone(),
            payment_type: p.payment_type.clone(),
            transaction_status: p.transaction_status.clone(),
            fraud_status: p.fraud_status.clone(),
            raw_payload: p.raw_payload.clone(),
            signature_verified: p.signature_verified,
            idempotency_key: p.idempotency_key.clone(),
            outcome: p.outcome.clone(),
            created_at: p.created_at,
            notification_received_at: p.notification_received_at,
            settled_at: p.settled_at,
        }
    }
}

impl From<PaymentTransactionRow> for PaymentTransaction {
    fn from(row: PaymentTransactionRow) -> Self {
        Self {
            id: row.id,
            order_id: row.order_id,
            gateway: row.gateway,
            external_transaction_id: row.external_transaction_id,
            external_order_id: row.external_order_id,
            amount: row.amount,
            payment_type: row.payment_type,
            transaction_status: row.transaction_status,
            fraud_status: row.fraud_status,
            raw_payload: row.raw_payload,
            signature_verified: row.signature_verified,
            idempotency_key: row.idempotency_key,
            outcome: row.outcome,
            created_at: row.created_at,
            notification_received_at: row.notification_received_at,
            settled_at: row.settled_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::delivery_addresses)]
pub struct DeliveryAddressRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub address_text: String,
    pub latitude: f64,
    pub longitude: f64,
    pub serviceable: bool,
    pub zone: Option<String>,
    pub fee: BigDecimal,
    pub distance_km: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<&DeliveryAddress> for DeliveryAddressRow {
    fn from(a: &DeliveryAddress) -> Self {
        Self {
            id: a.id,
            order_id: a.order_id,
            address_text: a.address_text.clone(),
            latitude: a.coordinates.lat,
            longitude: a.coordinates.lng,
            serviceable: a.serviceable,
            zone: a.zone.clone(),
            fee: to_numeric(a.fee),
            distance_km: a.distance_km,
            created_at: a.created_at,
        }
    }
}

impl TryFrom<DeliveryAddressRow> for DeliveryAddress {
    type Error = StoreError;

    fn try_from(row: DeliveryAddressRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            fee: from_numeric(&row.fee, "delivery_addresses.fee")?,
            address_text: row.address_text,
            coordinates: Coordinates {
                lat: row.latitude,
                lng: row.longitude,
            },
            serviceable: row.serviceable,
            zone: row.zone,
            distance_km: row.distance_km,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::reconciliation_cases)]
pub struct ReconciliationCaseRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub payment_transaction_id: Option<Uuid>,
    pub reason: String,
    pub details: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ReconciliationCase> for ReconciliationCaseRow {
    fn from(c: &ReconciliationCase) -> Self {
        Self {
            id: c.id,
            tenant_id: c.tenant_id,
            order_id: c.order_id,
            payment_transaction_id: c.payment_transaction_id,
            reason: c.reason.clone(),
            details: c.details.clone(),
            status: c.status.clone(),
            created_at: c.created_at,
        }
    }
}

impl From<ReconciliationCaseRow> for ReconciliationCase {
    fn from(row: ReconciliationCaseRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            order_id: row.order_id,
            payment_transaction_id: row.payment_transaction_id,
            reason: row.reason,
            details: row.details,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&OutboxEvent> for DbOutboxEvent {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.clone(),
            event_data: event.event_data.clone(),
            processed: Some(event.processed),
            created_at: Some(event.created_at),
        }
    }
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_data: row.event_data,
            processed: row.processed.unwrap_or(false),
            created_at: row.created_at.unwrap_or_else(Utc::now),
        }
    }
}
