//! Inventory reservation lifecycle: creation alongside an order, conversion on payment
//! and idempotent release on expiry or cancellation.

use chrono::{DateTime, Utc};
use serde_json::json;
use shared::clock::Clock;
use shared::store::{Ledger, LedgerTx};
use shared::{
    DomainError, EventType, Order, OrderItem, OutboxEvent, ReleaseReason, Reservation,
    ReservationStatus, StoreError,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::availability::Availability;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(Reservation),
    /// Already expired, converted or released by someone else.
    AlreadyFinished,
    /// An expiry release for a reservation whose TTL has not passed yet.
    NotDue,
    /// Unknown id, or the row is locked by a concurrent release.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Converted(Vec<Reservation>),
    /// At least one reservation was no longer active; nothing was converted.
    NotAllActive(Vec<Reservation>),
}

/// One active reservation per order line, created with the order.
pub fn build_reservations(
    order: &Order,
    items: &[OrderItem],
    ttl: chrono::Duration,
) -> Vec<Reservation> {
    items
        .iter()
        .map(|item| Reservation {
            id: Uuid::new_v4(),
            tenant_id: order.tenant_id,
            order_id: order.id,
            product_id: item.product_id,
            quantity: item.quantity,
            status: ReservationStatus::Active,
            created_at: order.created_at,
            expires_at: order.created_at + ttl,
            released_at: None,
        })
        .collect()
}

pub fn released_event(
    order_id: Uuid,
    released: &[Reservation],
    reason: ReleaseReason,
    at: DateTime<Utc>,
) -> OutboxEvent {
    let lines: Vec<_> = released
        .iter()
        .map(|r| {
            json!({
                "reservation_id": r.id,
                "product_id": r.product_id,
                "quantity": r.quantity,
            })
        })
        .collect();
    OutboxEvent::new(
        order_id,
        EventType::ReservationsReleased,
        json!({
            "order_id": order_id,
            "reason": reason,
            "reservations": lines,
        }),
        at,
    )
}

/// Releases every still-active reservation of the order inside `tx`. The caller
/// restocks the availability counters after committing.
pub async fn release_active(
    tx: &mut dyn LedgerTx,
    order_id: Uuid,
    reason: ReleaseReason,
    at: DateTime<Utc>,
) -> Result<Vec<Reservation>, StoreError> {
    let mut released = Vec::new();
    for mut r in tx.lock_order_reservations(order_id).await? {
        if r.status != ReservationStatus::Active {
            continue;
        }
        if tx.finish_reservation(r.id, reason.into(), at).await? {
            r.status = reason.into();
            r.released_at = Some(at);
            released.push(r);
        }
    }
    Ok(released)
}

/// Converts all of the order's reservations into permanent allocations, or none of them.
///
/// Conversion depends on status only. A reservation past its `expires_at` that the
/// sweeper has not reached yet still converts; one the sweeper already expired does not.
pub async fn convert_all(
    tx: &mut dyn LedgerTx,
    order_id: Uuid,
    at: DateTime<Utc>,
) -> Result<Conversion, StoreError> {
    let reservations = tx.lock_order_reservations(order_id).await?;
    if reservations.is_empty()
        || reservations
            .iter()
            .any(|r| r.status != ReservationStatus::Active)
    {
        return Ok(Conversion::NotAllActive(reservations));
    }

    let mut converted = Vec::with_capacity(reservations.len());
    for mut r in reservations {
        if !tx
            .finish_reservation(r.id, ReservationStatus::Converted, at)
            .await?
        {
            return Err(StoreError::Corrupt(format!(
                "reservation {} changed state under lock",
                r.id
            )));
        }
        r.status = ReservationStatus::Converted;
        r.released_at = Some(at);
        converted.push(r);
    }
    Ok(Conversion::Converted(converted))
}

#[derive(Clone)]
pub struct ReservationLedger {
    ledger: Arc<dyn Ledger>,
    availability: Availability,
    clock: Arc<dyn Clock>,
}

impl ReservationLedger {
    pub fn new(ledger: Arc<dyn Ledger>, availability: Availability, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            availability,
            clock,
        }
    }

    /// Moves one active reservation to `expired` or `released`. Calling it again, or on a
    /// reservation a concurrent worker already finished, is a no-op.
    pub async fn release_reservation(
        &self,
        reservation_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, DomainError> {
        let mut tx = self.ledger.begin().await?;
        match self.release_in(tx.as_mut(), reservation_id, reason).await {
            Ok(Some(released)) => {
                tx.commit().await?;
                self.availability
                    .record_released(
                        released.tenant_id,
                        released.product_id,
                        i64::from(released.quantity),
                    )
                    .await;
                info!(
                    reservation_id = %released.id,
                    order_id = %released.order_id,
                    product_id = %released.product_id,
                    quantity = released.quantity,
                    status = released.status.as_str(),
                    "Reservation released"
                );
                Ok(ReleaseOutcome::Released(released))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(ReleaseOutcome::Missing)
            }
            Err(ReleaseSkip::Finished) => {
                tx.rollback().await?;
                debug!(%reservation_id, "Reservation already finished");
                Ok(ReleaseOutcome::AlreadyFinished)
            }
            Err(ReleaseSkip::NotDue) => {
                tx.rollback().await?;
                Ok(ReleaseOutcome::NotDue)
            }
            Err(ReleaseSkip::Store(e)) => {
                tx.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn release_in(
        &self,
        tx: &mut dyn LedgerTx,
        reservation_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<Option<Reservation>, ReleaseSkip> {
        let Some(mut reservation) = tx.lock_reservation(reservation_id).await? else {
            return Ok(None);
        };
        if reservation.status != ReservationStatus::Active {
            return Err(ReleaseSkip::Finished);
        }

        let now = self.clock.now();
        if reason == ReleaseReason::Expired && reservation.expires_at >= now {
            return Err(ReleaseSkip::NotDue);
        }

        if !tx.finish_reservation(reservation_id, reason.into(), now).await? {
            return Err(ReleaseSkip::Finished);
        }
        reservation.status = reason.into();
        reservation.released_at = Some(now);

        tx.append_outbox(&released_event(
            reservation.order_id,
            std::slice::from_ref(&reservation),
            reason,
            now,
        ))
        .await?;

        Ok(Some(reservation))
    }
}

enum ReleaseSkip {
    Finished,
    NotDue,
    Store(StoreError),
}

impl From<StoreError> for ReleaseSkip {
    fn from(e: StoreError) -> Self {
        ReleaseSkip::Store(e)
    }
}
