use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::sum;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use super::{Ledger, LedgerTx};
use crate::models::*;
use crate::schema::*;
use crate::{
    DeliveryAddress, Order, OrderDetails, OrderItem, OrderStatus, OutboxEvent, PaymentTransaction,
    Product, ProductStock, ReconciliationCase, Reservation, ReservationStatus, StoreError,
};

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let mut conn = diesel::PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    Ok(())
}

pub async fn connect(database_url: &str, max_size: u32) -> Result<DbPool, StoreError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(config)
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))
}

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

/// Sums of `active` and `converted` reservation quantities per product.
async fn held_quantities(
    conn: &mut AsyncPgConnection,
    product_ids: &[Uuid],
) -> Result<HashMap<Uuid, (i64, i64)>, StoreError> {
    let rows: Vec<(Uuid, String, Option<i64>)> = inventory_reservations::table
        .filter(inventory_reservations::product_id.eq_any(product_ids.to_vec()))
        .filter(inventory_reservations::status.eq_any(vec![
            ReservationStatus::Active.as_str(),
            ReservationStatus::Converted.as_str(),
        ]))
        .group_by((inventory_reservations::product_id, inventory_reservations::status))
        .select((
            inventory_reservations::product_id,
            inventory_reservations::status,
            sum(inventory_reservations::quantity),
        ))
        .load(conn)
        .await?;

    let mut held: HashMap<Uuid, (i64, i64)> = HashMap::new();
    for (product_id, status, quantity) in rows {
        let entry = held.entry(product_id).or_default();
        match status.parse::<ReservationStatus>()? {
            ReservationStatus::Active => entry.0 += quantity.unwrap_or(0),
            ReservationStatus::Converted => entry.1 += quantity.unwrap_or(0),
            _ => {}
        }
    }
    Ok(held)
}

fn to_stock(row: ProductRow, held: &HashMap<Uuid, (i64, i64)>) -> Result<ProductStock, StoreError> {
    let (reserved, allocated) = held.get(&row.id).copied().unwrap_or((0, 0));
    let product = Product::try_from(row)?;
    Ok(ProductStock {
        product_id: product.id,
        tenant_id: product.tenant_id,
        name: product.name,
        sku: product.sku,
        unit_price: product.unit_price,
        total_quantity: product.total_quantity,
        reserved_quantity: reserved,
        allocated_quantity: allocated,
    })
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::begin_transaction(
            &mut *conn,
        )
        .await?;
        Ok(Box::new(PgTx { conn, open: true }))
    }

    async fn product_stock(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<ProductStock>, StoreError> {
        let mut conn = self.conn().await?;
        let row = products::table
            .filter(products::tenant_id.eq(tenant_id))
            .filter(products::id.eq(product_id))
            .filter(products::is_active.eq(true))
            .select(ProductRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let held = held_quantities(&mut conn, &[product_id]).await?;
        to_stock(row, &held).map(Some)
    }

    async fn order_details(
        &self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<OrderDetails>, StoreError> {
        let mut conn = self.conn().await?;
        let row = orders::table
            .filter(orders::tenant_id.eq(tenant_id))
            .filter(orders::reference.eq(reference))
            .select(OrderRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order = Order::try_from(row)?;

        let items = order_items::table
            .filter(order_items::order_id.eq(order.id))
            .order(order_items::position.asc())
            .select(OrderItemRow::as_select())
            .load(&mut conn)
            .await?
            .into_iter()
            .map(OrderItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let reservations = inventory_reservations::table
            .filter(inventory_reservations::order_id.eq(order.id))
            .order(inventory_reservations::product_id.asc())
            .select(ReservationRow::as_select())
            .load(&mut conn)
            .await?
            .into_iter()
            .map(Reservation::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let address = delivery_addresses::table
            .filter(delivery_addresses::order_id.eq(order.id))
            .select(DeliveryAddressRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(DeliveryAddress::try_from)
            .transpose()?;

        Ok(Some(OrderDetails {
            order,
            items,
            reservations,
            address,
        }))
    }

    async fn order_tenant(&self, reference: &str) -> Result<Option<Uuid>, StoreError> {
        let mut conn = self.conn().await?;
        let tenant = orders::table
            .filter(orders::reference.eq(reference))
            .select(orders::tenant_id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        Ok(tenant)
    }

    async fn payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let mut conn = self.conn().await?;
        let row = payment_transactions::table
            .filter(payment_transactions::idempotency_key.eq(key))
            .select(PaymentTransactionRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(PaymentTransaction::from))
    }

    async fn expired_reservation_ids(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.conn().await?;
        let ids = inventory_reservations::table
            .filter(inventory_reservations::status.eq(ReservationStatus::Active.as_str()))
            .filter(inventory_reservations::expires_at.lt(now))
            .order(inventory_reservations::expires_at.asc())
            .limit(limit)
            .select(inventory_reservations::id)
            .load::<Uuid>(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn open_reconciliation_cases(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ReconciliationCase>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = reconciliation_cases::table
            .filter(reconciliation_cases::tenant_id.eq(tenant_id))
            .filter(reconciliation_cases::status.eq("open"))
            .order(reconciliation_cases::created_at.asc())
            .select(ReconciliationCaseRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(ReconciliationCase::from).collect())
    }

    async fn unprocessed_outbox_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.conn().await?;
        let events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .select(DbOutboxEvent::as_select())
            .load(&mut conn)
            .await?;
        Ok(events.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_outbox_processed(&self, event_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(event_id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct PgTx {
    conn: PooledConnection<'static, AsyncPgConnection>,
    open: bool,
}

impl PgTx {
    fn conn(&mut self) -> Result<&mut AsyncPgConnection, StoreError> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        Ok(&mut *self.conn)
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if self.open {
            // The pool discards connections that come back mid-transaction.
            warn!("ledger transaction dropped without commit or rollback");
        }
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductStock>, StoreError> {
        let mut ids = product_ids.to_vec();
        ids.sort();
        ids.dedup();

        let conn = self.conn()?;
        let rows = products::table
            .filter(products::tenant_id.eq(tenant_id))
            .filter(products::id.eq_any(ids.clone()))
            .filter(products::is_active.eq(true))
            .order(products::id.asc())
            .select(ProductRow::as_select())
            .for_update()
            .load(conn)
            .await?;
        let held = held_quantities(conn, &ids).await?;
        rows.into_iter().map(|row| to_stock(row, &held)).collect()
    }

    async fn reference_exists(&mut self, reference: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let count: i64 = orders::table
            .filter(orders::reference.eq(reference))
            .count()
            .get_result(conn)
            .await?;
        Ok(count > 0)
    }

    async fn insert_order(
        &mut self,
        order: &Order,
        items: &[OrderItem],
        reservations: &[Reservation],
        address: Option<&DeliveryAddress>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        diesel::insert_into(orders::table)
            .values(OrderRow::from(order))
            .execute(conn)
            .await?;

        let item_rows: Vec<OrderItemRow> = items.iter().map(OrderItemRow::from).collect();
        diesel::insert_into(order_items::table)
            .values(&item_rows)
            .execute(conn)
            .await?;

        let reservation_rows: Vec<ReservationRow> =
            reservations.iter().map(ReservationRow::from).collect();
        diesel::insert_into(inventory_reservations::table)
            .values(&reservation_rows)
            .execute(conn)
            .await?;

        if let Some(address) = address {
            diesel::insert_into(delivery_addresses::table)
                .values(DeliveryAddressRow::from(address))
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    async fn lock_order(
        &mut self,
        tenant_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<Order>, StoreError> {
        let conn = self.conn()?;
        let row = orders::table
            .filter(orders::id.eq(order_id))
            .filter(orders::tenant_id.eq(tenant_id))
            .select(OrderRow::as_select())
            .for_update()
            .first(conn)
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn lock_order_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<Order>, StoreError> {
        let conn = self.conn()?;
        let row = orders::table
            .filter(orders::reference.eq(reference))
            .select(OrderRow::as_select())
            .for_update()
            .first(conn)
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let target = orders::table.filter(orders::id.eq(order_id));
        let common = (orders::status.eq(status.as_str()), orders::updated_at.eq(at));
        match status {
            OrderStatus::Paid => {
                diesel::update(target)
                    .set((common, orders::paid_at.eq(Some(at))))
                    .execute(conn)
                    .await?
            }
            OrderStatus::Complete => {
                diesel::update(target)
                    .set((common, orders::completed_at.eq(Some(at))))
                    .execute(conn)
                    .await?
            }
            OrderStatus::Cancelled => {
                diesel::update(target)
                    .set((common, orders::cancelled_at.eq(Some(at))))
                    .execute(conn)
                    .await?
            }
            OrderStatus::Pending => diesel::update(target).set(common).execute(conn).await?,
        };
        Ok(())
    }

    async fn set_staff_notes(
        &mut self,
        order_id: Uuid,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        diesel::update(orders::table.filter(orders::id.eq(order_id)))
            .set((orders::staff_notes.eq(Some(notes)), orders::updated_at.eq(at)))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn lock_order_reservations(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError> {
        let conn = self.conn()?;
        let rows = inventory_reservations::table
            .filter(inventory_reservations::order_id.eq(order_id))
            .order(inventory_reservations::product_id.asc())
            .select(ReservationRow::as_select())
            .for_update()
            .load(conn)
            .await?;
        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn lock_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, StoreError> {
        let conn = self.conn()?;
        let row = inventory_reservations::table
            .filter(inventory_reservations::id.eq(reservation_id))
            .select(ReservationRow::as_select())
            .for_update()
            .skip_locked()
            .first(conn)
            .await
            .optional()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn finish_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let updated = diesel::update(
            inventory_reservations::table
                .filter(inventory_reservations::id.eq(reservation_id))
                .filter(inventory_reservations::status.eq(ReservationStatus::Active.as_str())),
        )
        .set((
            inventory_reservations::status.eq(status.as_str()),
            inventory_reservations::released_at.eq(Some(at)),
        ))
        .execute(conn)
        .await?;
        Ok(updated == 1)
    }

    async fn find_payment(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let conn = self.conn()?;
        let row = payment_transactions::table
            .filter(payment_transactions::idempotency_key.eq(idempotency_key))
            .select(PaymentTransactionRow::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(row.map(PaymentTransaction::from))
    }

    async fn insert_payment(&mut self, payment: &PaymentTransaction) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let inserted = diesel::insert_into(payment_transactions::table)
            .values(PaymentTransactionRow::from(payment))
            .on_conflict(payment_transactions::idempotency_key)
            .do_nothing()
            .execute(conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn insert_reconciliation_case(
        &mut self,
        case: &ReconciliationCase,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        diesel::insert_into(reconciliation_cases::table)
            .values(ReconciliationCaseRow::from(case))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn append_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        let conn = self.conn()?;
        diesel::insert_into(outbox_events::table)
            .values(DbOutboxEvent::from(event))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result =
            <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(
                conn,
            )
            .await;
        self.open = false;
        result.map_err(StoreError::from)
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(
            conn,
        )
        .await;
        self.open = false;
        result.map_err(StoreError::from)
    }
}
