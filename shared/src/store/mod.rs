//! Transactional ledger for orders, reservations and payment records.
//!
//! Services open a [`LedgerTx`] with [`Ledger::begin`], perform their reads and
//! writes through it and finish with `commit` or `rollback`. Row locks taken inside a
//! transaction (`lock_*`) are held until it finishes, which is what serializes
//! concurrent checkouts on the same product and concurrent webhook/sweeper work on the
//! same order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    DeliveryAddress, Order, OrderDetails, OrderItem, OrderStatus, OutboxEvent, PaymentTransaction,
    ProductStock, ReconciliationCase, Reservation, ReservationStatus, StoreError,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Unlocked read used for the availability read-through.
    async fn product_stock(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<ProductStock>, StoreError>;

    async fn order_details(
        &self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<OrderDetails>, StoreError>;

    async fn order_tenant(&self, reference: &str) -> Result<Option<Uuid>, StoreError>;

    async fn payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError>;

    /// Ids of `active` reservations whose `expires_at` is before `now`.
    async fn expired_reservation_ids(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn open_reconciliation_cases(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ReconciliationCase>, StoreError>;

    async fn unprocessed_outbox_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_outbox_processed(&self, event_id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Locks the tenant's product rows in ascending id order and returns them with their
    /// current reserved/allocated sums. Unknown ids are absent from the result.
    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductStock>, StoreError>;

    async fn reference_exists(&mut self, reference: &str) -> Result<bool, StoreError>;

    async fn insert_order(
        &mut self,
        order: &Order,
        items: &[OrderItem],
        reservations: &[Reservation],
        address: Option<&DeliveryAddress>,
    ) -> Result<(), StoreError>;

    async fn lock_order(&mut self, tenant_id: Uuid, order_id: Uuid)
        -> Result<Option<Order>, StoreError>;

    async fn lock_order_by_reference(&mut self, reference: &str)
        -> Result<Option<Order>, StoreError>;

    /// Sets the status and the matching `paid_at`/`completed_at`/`cancelled_at` stamp.
    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_staff_notes(
        &mut self,
        order_id: Uuid,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Locks and returns every reservation of the order.
    async fn lock_order_reservations(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Locks one reservation. `None` when it does not exist or another transaction
    /// already holds it.
    async fn lock_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Moves an `active` reservation to `status`. Returns `false` if it was no longer
    /// active, in which case nothing is written.
    async fn finish_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn find_payment(&mut self, idempotency_key: &str)
        -> Result<Option<PaymentTransaction>, StoreError>;

    /// Returns `false` when a row with the same idempotency key already exists.
    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> Result<bool, StoreError>;

    async fn insert_reconciliation_case(&mut self, case: &ReconciliationCase)
        -> Result<(), StoreError>;

    async fn append_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
