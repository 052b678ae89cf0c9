//! Idempotent application of gateway notifications to orders and reservations.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use inventory_service::reservations::{convert_all, release_active, released_event, Conversion};
use inventory_service::Availability;
use serde::Serialize;
use serde_json::json;
use shared::clock::Clock;
use shared::store::{Ledger, LedgerTx};
use shared::{
    DomainError, EventType, Order, OrderStatus, OutboxEvent, PaymentTransaction,
    ReconciliationCase, ReleaseReason, Reservation,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateway::{GatewayConfig, TenantKeys};
use crate::notification::{GatewayKind, Notification, PaymentAction};
use crate::signature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Paid { order_reference: String },
    Released { order_reference: String, reservations: usize },
    Recorded,
    /// Same transaction id and status was already applied.
    Duplicate,
    /// Success for an order that is already paid or completed.
    AlreadyPaid,
    /// Failure for an order that is no longer pending.
    Ignored,
    /// Success that could not be applied; an operator has to decide.
    ReconciliationRequired { case_id: Uuid },
}

impl NotificationOutcome {
    fn label(&self) -> &'static str {
        match self {
            NotificationOutcome::Paid { .. } => "paid",
            NotificationOutcome::Released { .. } => "released",
            NotificationOutcome::Recorded => "recorded",
            NotificationOutcome::Duplicate => "duplicate",
            NotificationOutcome::AlreadyPaid => "already_paid",
            NotificationOutcome::Ignored => "ignored",
            NotificationOutcome::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}

#[derive(Clone)]
pub struct NotificationProcessor {
    ledger: Arc<dyn Ledger>,
    availability: Availability,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    keys: Arc<dyn TenantKeys>,
}

/// Effects decided under the order lock, written together with the audit row.
struct Decision {
    outcome: NotificationOutcome,
    released: Vec<Reservation>,
    events: Vec<OutboxEvent>,
    case: Option<(String, serde_json::Value)>,
    settled_at: Option<DateTime<Utc>>,
}

impl Decision {
    fn only(outcome: NotificationOutcome) -> Self {
        Self {
            outcome,
            released: Vec::new(),
            events: Vec::new(),
            case: None,
            settled_at: None,
        }
    }
}

impl NotificationProcessor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        availability: Availability,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
        keys: Arc<dyn TenantKeys>,
    ) -> Self {
        Self {
            ledger,
            availability,
            clock,
            config,
            keys,
        }
    }

    pub async fn process(
        &self,
        gateway: GatewayKind,
        body: &[u8],
        header_signature: Option<&str>,
    ) -> Result<NotificationOutcome, DomainError> {
        let notification = Notification::parse(gateway, body)?;

        let result = self
            .process_parsed(gateway, &notification, body, header_signature)
            .await;
        if let Err(e) = &result {
            if e.is_security_event() {
                warn!(
                    target: "security",
                    gateway = gateway.as_str(),
                    order_reference = %notification.order_reference,
                    transaction_id = %notification.transaction_id,
                    status = %notification.status,
                    gross_amount = %notification.gross_amount,
                    error = %e,
                    "Rejected payment notification"
                );
            }
        }
        result
    }

    async fn process_parsed(
        &self,
        gateway: GatewayKind,
        notification: &Notification,
        body: &[u8],
        header_signature: Option<&str>,
    ) -> Result<NotificationOutcome, DomainError> {
        let tenant_id = self.ledger.order_tenant(&notification.order_reference).await?;
        let tenant_key = tenant_id.and_then(|t| self.keys.server_key(t));
        let secret = self.config.notification_secret(gateway, tenant_key);
        if !signature::verify(notification, body, header_signature, &secret) {
            return Err(DomainError::InvalidSignature);
        }

        let key = notification.idempotency_key();
        if self.ledger.payment_by_idempotency_key(&key).await?.is_some() {
            info!(idempotency_key = %key, "Duplicate notification ignored");
            return Ok(NotificationOutcome::Duplicate);
        }

        let mut tx = self.ledger.begin().await?;
        match self.apply(tx.as_mut(), notification, &key).await {
            Ok(Applied::Commit(decision)) => {
                tx.commit().await?;
                self.availability.restock(&decision.released).await;
                info!(
                    order_reference = %notification.order_reference,
                    status = %notification.status,
                    outcome = decision.outcome.label(),
                    "Payment notification applied"
                );
                Ok(decision.outcome)
            }
            Err(DomainError::DuplicateNotification) => {
                tx.rollback().await?;
                info!(idempotency_key = %key, "Duplicate notification ignored");
                Ok(NotificationOutcome::Duplicate)
            }
            Ok(Applied::Rejected(err)) => {
                // The audit row for the rejected notification is kept.
                tx.commit().await?;
                Err(err)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed notification failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        notification: &Notification,
        key: &str,
    ) -> Result<Applied, DomainError> {
        let Some(order) = tx.lock_order_by_reference(&notification.order_reference).await? else {
            warn!(
                order_reference = %notification.order_reference,
                "Notification for unknown order"
            );
            return Err(DomainError::OrderNotFound(notification.order_reference.clone()));
        };

        if tx.find_payment(key).await?.is_some() {
            return Err(DomainError::DuplicateNotification);
        }

        let now = self.clock.now();

        if notification.amount != BigDecimal::from(order.total) {
            let payment = self.audit_row(&order, notification, key, "amount_mismatch", now, None);
            if !tx.insert_payment(&payment).await? {
                return Err(DomainError::DuplicateNotification);
            }
            return Ok(Applied::Rejected(DomainError::AmountMismatch {
                expected: order.total,
                received: notification.gross_amount.clone(),
            }));
        }

        let decision = match notification.action() {
            PaymentAction::Settle => self.settle(tx, &order, now).await?,
            PaymentAction::Release => self.release(tx, &order, now).await?,
            PaymentAction::Record => Decision::only(NotificationOutcome::Recorded),
        };

        let payment = self.audit_row(
            &order,
            notification,
            key,
            decision.outcome.label(),
            now,
            decision.settled_at,
        );
        if !tx.insert_payment(&payment).await? {
            return Err(DomainError::DuplicateNotification);
        }

        let mut decision = decision;
        if let Some((reason, details)) = decision.case.take() {
            let case = ReconciliationCase {
                id: Uuid::new_v4(),
                tenant_id: order.tenant_id,
                order_id: order.id,
                payment_transaction_id: Some(payment.id),
                reason: reason.clone(),
                details: details.clone(),
                status: "open".to_string(),
                created_at: now,
            };
            tx.insert_reconciliation_case(&case).await?;
            tx.append_outbox(&OutboxEvent::new(
                order.id,
                EventType::ReconciliationRequired,
                json!({
                    "case_id": case.id,
                    "order_reference": order.reference,
                    "reason": reason,
                    "details": details,
                }),
                now,
            ))
            .await?;
            error!(
                target: "reconciliation",
                case_id = %case.id,
                order_reference = %order.reference,
                reason = %case.reason,
                transaction_id = %notification.transaction_id,
                "Payment requires manual reconciliation"
            );
            decision.outcome = NotificationOutcome::ReconciliationRequired { case_id: case.id };
        }

        for event in &decision.events {
            tx.append_outbox(event).await?;
        }

        Ok(Applied::Commit(decision))
    }

    async fn settle(
        &self,
        tx: &mut dyn LedgerTx,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<Decision, DomainError> {
        match order.status {
            OrderStatus::Paid | OrderStatus::Complete => {
                Ok(Decision::only(NotificationOutcome::AlreadyPaid))
            }
            OrderStatus::Cancelled => {
                let mut decision = Decision::only(NotificationOutcome::Recorded);
                decision.case = Some((
                    "order_cancelled".to_string(),
                    json!({ "order_status": order.status }),
                ));
                Ok(decision)
            }
            OrderStatus::Pending => match convert_all(tx, order.id, now).await? {
                Conversion::Converted(converted) => {
                    let next = order.status.transition(OrderStatus::Paid)?;
                    tx.update_order_status(order.id, next, now).await?;
                    let mut decision = Decision::only(NotificationOutcome::Paid {
                        order_reference: order.reference.clone(),
                    });
                    decision.settled_at = Some(now);
                    decision.events.push(OutboxEvent::new(
                        order.id,
                        EventType::OrderPaid,
                        json!({
                            "order_id": order.id,
                            "tenant_id": order.tenant_id,
                            "reference": order.reference,
                            "total": order.total,
                            "converted_reservations": converted.len(),
                        }),
                        now,
                    ));
                    Ok(decision)
                }
                Conversion::NotAllActive(reservations) => {
                    let statuses: Vec<_> = reservations
                        .iter()
                        .map(|r| json!({ "reservation_id": r.id, "status": r.status }))
                        .collect();
                    let mut decision = Decision::only(NotificationOutcome::Recorded);
                    decision.case = Some((
                        "reservations_not_active".to_string(),
                        json!({ "reservations": statuses }),
                    ));
                    Ok(decision)
                }
            },
        }
    }

    async fn release(
        &self,
        tx: &mut dyn LedgerTx,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<Decision, DomainError> {
        if order.status != OrderStatus::Pending {
            return Ok(Decision::only(NotificationOutcome::Ignored));
        }
        let released = release_active(tx, order.id, ReleaseReason::Released, now).await?;
        let mut decision = Decision::only(NotificationOutcome::Released {
            order_reference: order.reference.clone(),
            reservations: released.len(),
        });
        if !released.is_empty() {
            decision
                .events
                .push(released_event(order.id, &released, ReleaseReason::Released, now));
        }
        decision.released = released;
        Ok(decision)
    }

    fn audit_row(
        &self,
        order: &Order,
        notification: &Notification,
        key: &str,
        outcome: &str,
        now: DateTime<Utc>,
        settled_at: Option<DateTime<Utc>>,
    ) -> PaymentTransaction {
        PaymentTransaction {
            id: Uuid::new_v4(),
            order_id: order.id,
            gateway: notification.gateway.as_str().to_string(),
            external_transaction_id: Some(notification.transaction_id.clone()),
            external_order_id: notification.order_reference.clone(),
            amount: notification.amount.clone(),
            payment_type: notification.payment_type.clone(),
            transaction_status: notification.status.as_str().to_string(),
            fraud_status: notification.fraud_status.clone(),
            raw_payload: notification.raw.clone(),
            signature_verified: true,
            idempotency_key: key.to_string(),
            outcome: outcome.to_string(),
            created_at: now,
            notification_received_at: Some(now),
            settled_at,
        }
    }
}

/// A redelivery detected under the order lock comes back as
/// `Err(DomainError::DuplicateNotification)` and is answered as success.
enum Applied {
    Commit(Decision),
    Rejected(DomainError),
}
