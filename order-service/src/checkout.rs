//! Checkout: cart snapshot to PENDING order with reservations, then a payment intent.

use chrono::{DateTime, Utc};
use inventory_service::reservations::build_reservations;
use inventory_service::Availability;
use payment_service::{IntentItem, PaymentGateway, PaymentIntent, PaymentIntentRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::cipher::FieldCipher;
use shared::clock::Clock;
use shared::config::CheckoutConfig;
use shared::reference::generate_order_reference;
use shared::store::{Ledger, LedgerTx};
use shared::{
    DeliveryAddress, DeliveryType, DomainError, EventType, Order, OrderItem, OrderStatus,
    OutboxEvent, PaymentTransaction, Reservation, Shortfall, StoreError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cart::CartService;
use crate::delivery::{self, DeliveryQuote, Geocoder};
use crate::tenant::TenantDirectory;

const REFERENCE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryInfo {
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_type: DeliveryType,
    pub table_number: Option<String>,
    pub notes: Option<String>,
    /// Required for `delivery` orders.
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub reservations: Vec<Reservation>,
    pub quote: Option<DeliveryQuote>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutReceipt {
    pub order_reference: String,
    pub total: i64,
    /// `None` when the gateway could not be reached; the guest retries payment on the
    /// same reference.
    pub payment_redirect_url: Option<String>,
    pub reservation_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CheckoutService {
    ledger: Arc<dyn Ledger>,
    availability: Availability,
    carts: CartService,
    gateway: Arc<dyn PaymentGateway>,
    geocoder: Arc<dyn Geocoder>,
    tenants: Arc<dyn TenantDirectory>,
    cipher: Arc<dyn FieldCipher>,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        availability: Availability,
        carts: CartService,
        gateway: Arc<dyn PaymentGateway>,
        geocoder: Arc<dyn Geocoder>,
        tenants: Arc<dyn TenantDirectory>,
        cipher: Arc<dyn FieldCipher>,
        clock: Arc<dyn Clock>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            ledger,
            availability,
            carts,
            gateway,
            geocoder,
            tenants,
            cipher,
            clock,
            config,
        }
    }

    /// Creates the order from the session cart, clears the cart and requests a payment
    /// intent.
    pub async fn checkout(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        info: &DeliveryInfo,
    ) -> Result<CheckoutReceipt, DomainError> {
        let cart = self.carts.get_cart(tenant_id, session_id).await?;
        if cart.is_empty() {
            return Err(DomainError::EmptyCart);
        }

        let created = self.create_order(tenant_id, &cart.items, info).await?;

        if let Err(e) = self.carts.clear_cart(tenant_id, session_id).await {
            warn!(error = %e, session_id, "Failed to clear cart after checkout");
        }

        let redirect = match self
            .request_intent(&created.order, &created.items, &info.customer_phone)
            .await
        {
            Ok(intent) => Some(intent.redirect_url),
            Err(e) => {
                warn!(
                    order_reference = %created.order.reference,
                    error = %e,
                    "Payment intent failed, order kept for retry"
                );
                None
            }
        };

        Ok(receipt(&created.order, &created.reservations, redirect))
    }

    /// Validates the snapshot against locked stock and writes the order, its lines, its
    /// reservations and its address in one transaction. Nothing is written on failure.
    pub async fn create_order(
        &self,
        tenant_id: Uuid,
        lines: &BTreeMap<Uuid, i32>,
        info: &DeliveryInfo,
    ) -> Result<CreatedOrder, DomainError> {
        validate(lines, info)?;
        let settings = self.tenants.settings(tenant_id);

        // Geocoding may be slow; resolve before any row is locked.
        let located = match info.delivery_type {
            DeliveryType::Delivery => {
                let address = info.address.as_deref().unwrap_or_default();
                let point = self
                    .geocoder
                    .resolve(address)
                    .await?
                    .ok_or(DomainError::AddressNotServiceable)?;
                let quote = delivery::evaluate(&settings.pricing, point);
                if !quote.serviceable {
                    info!(%tenant_id, "Delivery address outside service area");
                    return Err(DomainError::AddressNotServiceable);
                }
                Some((address.to_string(), point, quote))
            }
            DeliveryType::Pickup | DeliveryType::DineIn => None,
        };

        let ttl = self.config.reservation_ttl_for(settings.reservation_ttl());
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DomainError::InvalidRequest(format!("invalid reservation ttl: {e}")))?;

        let mut tx = self.ledger.begin().await?;
        let created = match self
            .write_order(tx.as_mut(), tenant_id, lines, info, located, ttl)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed checkout failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        for r in &created.reservations {
            self.availability
                .record_reserved(tenant_id, r.product_id, i64::from(r.quantity))
                .await;
        }

        info!(
            order_reference = %created.order.reference,
            %tenant_id,
            total = created.order.total,
            lines = created.items.len(),
            "Order created"
        );
        Ok(created)
    }

    async fn write_order(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: Uuid,
        lines: &BTreeMap<Uuid, i32>,
        info: &DeliveryInfo,
        located: Option<(String, shared::Coordinates, DeliveryQuote)>,
        ttl: chrono::Duration,
    ) -> Result<CreatedOrder, DomainError> {
        let product_ids: Vec<Uuid> = lines.keys().copied().collect();
        let stock = tx.lock_products(tenant_id, &product_ids).await?;
        let stock: BTreeMap<Uuid, _> = stock.into_iter().map(|s| (s.product_id, s)).collect();

        let mut shortfalls = Vec::new();
        for (product_id, quantity) in lines {
            let s = stock
                .get(product_id)
                .ok_or(DomainError::ProductNotFound(*product_id))?;
            let requested = i64::from(*quantity);
            if requested > s.available() {
                shortfalls.push(Shortfall {
                    product_id: *product_id,
                    requested,
                    available: s.available(),
                });
            }
        }
        if !shortfalls.is_empty() {
            info!(%tenant_id, products = shortfalls.len(), "Checkout rejected for insufficient inventory");
            return Err(DomainError::InsufficientInventory(shortfalls));
        }

        let reference = self.allocate_reference(tx).await?;
        let now = self.clock.now();
        let order_id = Uuid::new_v4();

        let mut items = Vec::with_capacity(lines.len());
        let mut subtotal: i64 = 0;
        for (position, (product_id, quantity)) in lines.iter().enumerate() {
            let s = &stock[product_id];
            let total_price = s
                .unit_price
                .checked_mul(i64::from(*quantity))
                .ok_or_else(|| DomainError::InvalidRequest("line total overflows".to_string()))?;
            subtotal = subtotal
                .checked_add(total_price)
                .ok_or_else(|| DomainError::InvalidRequest("order total overflows".to_string()))?;
            items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id,
                position: i32::try_from(position).unwrap_or(i32::MAX),
                product_id: *product_id,
                product_name: s.name.clone(),
                sku: s.sku.clone(),
                quantity: *quantity,
                unit_price: s.unit_price,
                total_price,
            });
        }

        let delivery_fee = located.as_ref().map(|(_, _, q)| q.fee).unwrap_or(0);
        let total = subtotal
            .checked_add(delivery_fee)
            .ok_or_else(|| DomainError::InvalidRequest("order total overflows".to_string()))?;
        let order = Order {
            id: order_id,
            tenant_id,
            reference,
            status: OrderStatus::Pending,
            subtotal,
            delivery_fee,
            total,
            customer_name: info.customer_name.trim().to_string(),
            customer_phone: self.cipher.encrypt(info.customer_phone.trim())?,
            delivery_type: info.delivery_type,
            table_number: info.table_number.clone(),
            notes: info.notes.clone(),
            staff_notes: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            completed_at: None,
            cancelled_at: None,
        };
        let reservations = build_reservations(&order, &items, ttl);

        let address = match located {
            Some((text, coordinates, quote)) => Some(DeliveryAddress {
                id: Uuid::new_v4(),
                order_id,
                address_text: self.cipher.encrypt(&text)?,
                coordinates,
                serviceable: quote.serviceable,
                zone: quote.zone.clone(),
                fee: quote.fee,
                distance_km: quote.distance_km,
                created_at: now,
            }),
            None => None,
        };

        tx.insert_order(&order, &items, &reservations, address.as_ref())
            .await?;
        tx.append_outbox(&OutboxEvent::new(
            order.id,
            EventType::OrderCreated,
            json!({
                "order_id": order.id,
                "tenant_id": tenant_id,
                "reference": order.reference,
                "total": order.total,
                "delivery_type": order.delivery_type,
                "expires_at": reservations.iter().map(|r| r.expires_at).min(),
            }),
            now,
        ))
        .await?;

        let quote = address.as_ref().map(|a| DeliveryQuote {
            serviceable: a.serviceable,
            fee: a.fee,
            zone: a.zone.clone(),
            distance_km: a.distance_km,
        });
        Ok(CreatedOrder {
            order,
            items,
            reservations,
            quote,
        })
    }

    async fn allocate_reference(&self, tx: &mut dyn LedgerTx) -> Result<String, DomainError> {
        for _ in 0..REFERENCE_ATTEMPTS {
            let candidate = generate_order_reference();
            if !tx.reference_exists(&candidate).await? {
                return Ok(candidate);
            }
            warn!(reference = %candidate, "Order reference collision");
        }
        Err(StoreError::Corrupt("could not allocate a unique order reference".to_string()).into())
    }

    /// New payment intent for a PENDING order whose reservations are all still live.
    pub async fn retry_payment(
        &self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<CheckoutReceipt, DomainError> {
        let details = self
            .ledger
            .order_details(tenant_id, reference)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(reference.to_string()))?;
        let order = &details.order;
        if order.status != OrderStatus::Pending {
            return Err(DomainError::InvalidStateTransition {
                from: order.status,
                to: OrderStatus::Paid,
            });
        }

        let now = self.clock.now();
        if details.reservations.is_empty() || !details.reservations.iter().all(|r| r.is_live(now)) {
            info!(order_reference = %reference, "Payment retry after reservation expiry");
            return Err(DomainError::ReservationExpired(reference.to_string()));
        }

        let phone = self.cipher.decrypt(&order.customer_phone)?;
        let intent = self.request_intent(order, &details.items, &phone).await?;
        Ok(receipt(order, &details.reservations, Some(intent.redirect_url)))
    }

    async fn request_intent(
        &self,
        order: &Order,
        items: &[OrderItem],
        phone: &str,
    ) -> Result<PaymentIntent, DomainError> {
        let mut intent_items: Vec<IntentItem> = items
            .iter()
            .map(|i| IntentItem {
                id: i.product_id.to_string(),
                name: i.product_name.clone(),
                price: i.unit_price,
                quantity: i.quantity,
            })
            .collect();
        if order.delivery_fee > 0 {
            intent_items.push(IntentItem {
                id: "delivery".to_string(),
                name: "Delivery fee".to_string(),
                price: order.delivery_fee,
                quantity: 1,
            });
        }

        let intent = self
            .gateway
            .create_transaction(&PaymentIntentRequest {
                tenant_id: order.tenant_id,
                order_reference: order.reference.clone(),
                gross_amount: order.total,
                customer_name: order.customer_name.clone(),
                customer_phone: phone.to_string(),
                items: intent_items,
            })
            .await?;

        self.record_intent(order, &intent).await?;
        Ok(intent)
    }

    async fn record_intent(&self, order: &Order, intent: &PaymentIntent) -> Result<(), DomainError> {
        let now = self.clock.now();
        let payment = PaymentTransaction {
            id: Uuid::new_v4(),
            order_id: order.id,
            gateway: self.gateway.name().to_string(),
            external_transaction_id: None,
            external_order_id: order.reference.clone(),
            amount: shared::models::to_numeric(order.total),
            payment_type: None,
            transaction_status: "intent_created".to_string(),
            fraud_status: None,
            raw_payload: json!({
                "token": intent.token,
                "redirect_url": intent.redirect_url,
            }),
            signature_verified: false,
            idempotency_key: format!("intent:{}:{}", order.reference, intent.token),
            outcome: "intent".to_string(),
            created_at: now,
            notification_received_at: None,
            settled_at: None,
        };

        let mut tx = self.ledger.begin().await?;
        match tx.insert_payment(&payment).await {
            Ok(_) => tx.commit().await?,
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn validate(lines: &BTreeMap<Uuid, i32>, info: &DeliveryInfo) -> Result<(), DomainError> {
    if lines.is_empty() {
        return Err(DomainError::EmptyCart);
    }
    if lines.values().any(|q| *q <= 0) {
        return Err(DomainError::InvalidRequest(
            "line quantities must be positive".to_string(),
        ));
    }
    if info.customer_name.trim().is_empty() || info.customer_phone.trim().is_empty() {
        return Err(DomainError::InvalidRequest(
            "customer name and phone are required".to_string(),
        ));
    }
    if info.delivery_type == DeliveryType::Delivery
        && info.address.as_deref().map_or(true, |a| a.trim().is_empty())
    {
        return Err(DomainError::InvalidRequest(
            "delivery orders need an address".to_string(),
        ));
    }
    Ok(())
}

fn receipt(order: &Order, reservations: &[Reservation], redirect: Option<String>) -> CheckoutReceipt {
    CheckoutReceipt {
        order_reference: order.reference.clone(),
        total: order.total,
        payment_redirect_url: redirect,
        reservation_expires_at: reservations
            .iter()
            .map(|r| r.expires_at)
            .min()
            .unwrap_or(order.created_at),
    }
}
