//! Order queries and staff-side transitions.

use chrono::{DateTime, Utc};
use inventory_service::reservations::{release_active, released_event};
use inventory_service::Availability;
use serde::Serialize;
use serde_json::json;
use shared::cipher::FieldCipher;
use shared::clock::Clock;
use shared::store::{Ledger, LedgerTx};
use shared::{
    DeliveryType, DomainError, EventType, Order, OrderItem, OrderStatus, OutboxEvent,
    ReconciliationCase, ReleaseReason, Reservation, ReservationStatus,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryView {
    pub address: String,
    pub zone: Option<String>,
    pub fee: i64,
    pub distance_km: Option<f64>,
}

/// What a guest holding the reference may see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub reference: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub subtotal: i64,
    pub delivery_fee: i64,
    pub total: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_type: DeliveryType,
    pub table_number: Option<String>,
    pub notes: Option<String>,
    pub delivery: Option<DeliveryView>,
    /// Earliest expiry of the still-active holds; `None` once nothing is held.
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct OrderService {
    ledger: Arc<dyn Ledger>,
    availability: Availability,
    cipher: Arc<dyn FieldCipher>,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        availability: Availability,
        cipher: Arc<dyn FieldCipher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            availability,
            cipher,
            clock,
        }
    }

    pub async fn get_order(&self, tenant_id: Uuid, reference: &str) -> Result<OrderView, DomainError> {
        let details = self
            .ledger
            .order_details(tenant_id, reference)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(reference.to_string()))?;
        let order = details.order;

        let delivery = match details.address {
            Some(a) => Some(DeliveryView {
                address: self.cipher.decrypt(&a.address_text)?,
                zone: a.zone,
                fee: a.fee,
                distance_km: a.distance_km,
            }),
            None => None,
        };

        Ok(OrderView {
            customer_phone: self.cipher.decrypt(&order.customer_phone)?,
            reservation_expires_at: earliest_active_expiry(&details.reservations),
            reference: order.reference,
            status: order.status,
            items: details.items,
            subtotal: order.subtotal,
            delivery_fee: order.delivery_fee,
            total: order.total,
            customer_name: order.customer_name,
            delivery_type: order.delivery_type,
            table_number: order.table_number,
            notes: order.notes,
            delivery,
            created_at: order.created_at,
            paid_at: order.paid_at,
            completed_at: order.completed_at,
            cancelled_at: order.cancelled_at,
        })
    }

    /// Staff may complete a paid order or cancel a pending or paid one. Cancelling a
    /// pending order gives its holds back; a paid order keeps its allocations.
    pub async fn transition_status(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<Order, DomainError> {
        let mut tx = self.ledger.begin().await?;
        let result = self.transition_in(tx.as_mut(), tenant_id, order_id, next).await;
        let (order, released) = match result {
            Ok(done) => done,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed transition failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        self.availability.restock(&released).await;
        info!(
            order_reference = %order.reference,
            status = %order.status,
            released = released.len(),
            "Order status changed by staff"
        );
        Ok(order)
    }

    async fn transition_in(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: Uuid,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<(Order, Vec<Reservation>), DomainError> {
        let mut order = tx
            .lock_order(tenant_id, order_id)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(order_id.to_string()))?;

        // Payment is only confirmed by the gateway.
        if next == OrderStatus::Paid || next == OrderStatus::Pending {
            return Err(DomainError::InvalidStateTransition {
                from: order.status,
                to: next,
            });
        }
        let previous = order.status;
        let status = previous.transition(next)?;

        let now = self.clock.now();
        tx.update_order_status(order.id, status, now).await?;

        let mut released = Vec::new();
        if status == OrderStatus::Cancelled && previous == OrderStatus::Pending {
            released = release_active(tx, order.id, ReleaseReason::Released, now).await?;
            if !released.is_empty() {
                tx.append_outbox(&released_event(
                    order.id,
                    &released,
                    ReleaseReason::Released,
                    now,
                ))
                .await?;
            }
        }

        let event_type = match status {
            OrderStatus::Complete => EventType::OrderCompleted,
            _ => EventType::OrderCancelled,
        };
        tx.append_outbox(&OutboxEvent::new(
            order.id,
            event_type,
            json!({
                "order_id": order.id,
                "tenant_id": order.tenant_id,
                "reference": order.reference,
                "previous_status": previous,
                "status": status,
            }),
            now,
        ))
        .await?;

        order.status = status;
        order.updated_at = now;
        match status {
            OrderStatus::Complete => order.completed_at = Some(now),
            OrderStatus::Cancelled => order.cancelled_at = Some(now),
            _ => {}
        }
        Ok((order, released))
    }

    /// Appends a line to the order's staff notes. The status is untouched.
    pub async fn add_staff_note(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        note: &str,
    ) -> Result<Order, DomainError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(DomainError::InvalidRequest("note must not be empty".to_string()));
        }

        let mut tx = self.ledger.begin().await?;
        let Some(mut order) = tx.lock_order(tenant_id, order_id).await? else {
            tx.rollback().await?;
            return Err(DomainError::OrderNotFound(order_id.to_string()));
        };

        let now = self.clock.now();
        let line = format!("[{}] {}", now.format("%Y-%m-%d %H:%M"), note);
        let notes = match order.staff_notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
            _ => line,
        };
        if let Err(e) = tx.set_staff_notes(order.id, &notes, now).await {
            tx.rollback().await?;
            return Err(e.into());
        }
        tx.commit().await?;

        order.staff_notes = Some(notes);
        order.updated_at = now;
        Ok(order)
    }

    pub async fn open_reconciliation_cases(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ReconciliationCase>, DomainError> {
        Ok(self.ledger.open_reconciliation_cases(tenant_id).await?)
    }
}

fn earliest_active_expiry(reservations: &[Reservation]) -> Option<DateTime<Utc>> {
    reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Active)
        .map(|r| r.expires_at)
        .min()
}
