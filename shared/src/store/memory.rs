//! In-process ledger. One transaction at a time holds the whole state, so it behaves
//! like a fully serialized database; used by tests and single-node demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Ledger, LedgerTx};
use crate::{
    DeliveryAddress, Order, OrderDetails, OrderItem, OrderStatus, OutboxEvent, PaymentTransaction,
    Product, ProductStock, ReconciliationCase, Reservation, ReservationStatus, StoreError,
};

#[derive(Debug, Clone, Default)]
struct State {
    products: BTreeMap<Uuid, Product>,
    orders: HashMap<Uuid, Order>,
    items: HashMap<Uuid, Vec<OrderItem>>,
    reservations: BTreeMap<Uuid, Reservation>,
    addresses: HashMap<Uuid, DeliveryAddress>,
    payments: Vec<PaymentTransaction>,
    cases: Vec<ReconciliationCase>,
    outbox: Vec<OutboxEvent>,
}

impl State {
    fn stock(&self, product: &Product) -> ProductStock {
        let (reserved, allocated) = self
            .reservations
            .values()
            .filter(|r| r.product_id == product.id)
            .fold((0i64, 0i64), |(reserved, allocated), r| match r.status {
                ReservationStatus::Active => (reserved + i64::from(r.quantity), allocated),
                ReservationStatus::Converted => (reserved, allocated + i64::from(r.quantity)),
                _ => (reserved, allocated),
            });
        ProductStock {
            product_id: product.id,
            tenant_id: product.tenant_id,
            name: product.name.clone(),
            sku: product.sku.clone(),
            unit_price: product.unit_price,
            total_quantity: product.total_quantity,
            reserved_quantity: reserved,
            allocated_quantity: allocated,
        }
    }

    fn order_by_reference(&self, reference: &str) -> Option<&Order> {
        self.orders.values().find(|o| o.reference == reference)
    }

    fn reservations_of(&self, order_id: Uuid) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.product_id);
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<State>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn reservations_for_order(&self, order_id: Uuid) -> Vec<Reservation> {
        self.state.lock().await.reservations_of(order_id)
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Vec<PaymentTransaction> {
        self.state
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    /// Rewrites a reservation's expiry, for simulating clock skew between workers.
    pub async fn set_reservation_expiry(&self, reservation_id: Uuid, expires_at: DateTime<Utc>) {
        if let Some(r) = self.state.lock().await.reservations.get_mut(&reservation_id) {
            r.expires_at = expires_at;
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            working,
        }))
    }

    async fn product_stock(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<ProductStock>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .get(&product_id)
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| state.stock(p)))
    }

    async fn order_details(
        &self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<OrderDetails>, StoreError> {
        let state = self.state.lock().await;
        let Some(order) = state
            .order_by_reference(reference)
            .filter(|o| o.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        Ok(Some(OrderDetails {
            items: state.items.get(&order.id).cloned().unwrap_or_default(),
            reservations: state.reservations_of(order.id),
            address: state.addresses.get(&order.id).cloned(),
            order: order.clone(),
        }))
    }

    async fn order_tenant(&self, reference: &str) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.order_by_reference(reference).map(|o| o.tenant_id))
    }

    async fn payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.payments.iter().find(|p| p.idempotency_key == key).cloned())
    }

    async fn expired_reservation_ids(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<&Reservation> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active && r.expires_at < now)
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| r.id)
            .collect())
    }

    async fn open_reconciliation_cases(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ReconciliationCase>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .cases
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.status == "open")
            .cloned()
            .collect())
    }

    async fn unprocessed_outbox_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.processed)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_outbox_processed(&self, event_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == event_id) {
            event.processed = true;
        }
        Ok(())
    }
}

struct MemoryTx {
    guard: Option<OwnedMutexGuard<State>>,
    working: State,
}

impl MemoryTx {
    fn state(&mut self) -> Result<&mut State, StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(&mut self.working)
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductStock>, StoreError> {
        let state = self.state()?;
        let mut ids = product_ids.to_vec();
        ids.sort();
        ids.dedup();
        Ok(ids
            .iter()
            .filter_map(|id| state.products.get(id))
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| state.stock(p))
            .collect())
    }

    async fn reference_exists(&mut self, reference: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.order_by_reference(reference).is_some())
    }

    async fn insert_order(
        &mut self,
        order: &Order,
        items: &[OrderItem],
        reservations: &[Reservation],
        address: Option<&DeliveryAddress>,
    ) -> Result<(), StoreError> {
        let state = self.state()?;
        if state.orders.contains_key(&order.id) || state.order_by_reference(&order.reference).is_some() {
            return Err(StoreError::Corrupt(format!(
                "duplicate order {} / {}",
                order.id, order.reference
            )));
        }
        state.orders.insert(order.id, order.clone());
        state.items.insert(order.id, items.to_vec());
        for r in reservations {
            state.reservations.insert(r.id, r.clone());
        }
        if let Some(address) = address {
            state.addresses.insert(order.id, address.clone());
        }
        Ok(())
    }

    async fn lock_order(
        &mut self,
        tenant_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self
            .state()?
            .orders
            .get(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn lock_order_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self.state()?.order_by_reference(reference).cloned())
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let order = self
            .state()?
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::Corrupt(format!("order {order_id} vanished")))?;
        order.status = status;
        order.updated_at = at;
        match status {
            OrderStatus::Paid => order.paid_at = Some(at),
            OrderStatus::Complete => order.completed_at = Some(at),
            OrderStatus::Cancelled => order.cancelled_at = Some(at),
            OrderStatus::Pending => {}
        }
        Ok(())
    }

    async fn set_staff_notes(
        &mut self,
        order_id: Uuid,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(order) = self.state()?.orders.get_mut(&order_id) {
            order.staff_notes = Some(notes.to_string());
            order.updated_at = at;
        }
        Ok(())
    }

    async fn lock_order_reservations(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.state()?.reservations_of(order_id))
    }

    async fn lock_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.state()?.reservations.get(&reservation_id).cloned())
    }

    async fn finish_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self.state()?.reservations.get_mut(&reservation_id) {
            Some(r) if r.status == ReservationStatus::Active => {
                r.status = status;
                r.released_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_payment(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        Ok(self
            .state()?
            .payments
            .iter()
            .find(|p| p.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> Result<bool, StoreError> {
        let state = self.state()?;
        if state
            .payments
            .iter()
            .any(|p| p.idempotency_key == payment.idempotency_key)
        {
            return Ok(false);
        }
        state.payments.push(payment.clone());
        Ok(true)
    }

    async fn insert_reconciliation_case(
        &mut self,
        case: &ReconciliationCase,
    ) -> Result<(), StoreError> {
        self.state()?.cases.push(case.clone());
        Ok(())
    }

    async fn append_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        self.state()?.outbox.push(event.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionClosed)?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard.take().ok_or(StoreError::TransactionClosed)?;
        Ok(())
    }
}
