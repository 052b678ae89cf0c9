//! Fast "how many can I still sell" counters.
//!
//! The counters are an optimization over the ledger and are never consulted for the
//! final accept/reject decision at checkout. Every mutation is an atomic
//! increment/decrement in the backing store; a counter that has expired or was never
//! seeded is left alone and re-seeded from the ledger on the next read.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use shared::store::Ledger;
use shared::{DomainError, Reservation, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait AvailabilityCache: Send + Sync {
    async fn get(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError>;

    async fn set(&self, tenant_id: Uuid, product_id: Uuid, quantity: i64) -> Result<(), StoreError>;

    /// Adds `delta` to an existing counter and returns the new value. Missing counters
    /// are not created.
    async fn adjust(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
        delta: i64,
    ) -> Result<Option<i64>, StoreError>;

    async fn invalidate(&self, tenant_id: Uuid, product_id: Uuid) -> Result<(), StoreError>;
}

const ADJUST_IF_PRESENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

fn cache_err(e: RedisError) -> StoreError {
    StoreError::Cache(e.to_string())
}

/// Key format: `{prefix}:avail:{tenant}:{product}`
pub struct RedisAvailabilityCache {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    adjust: Script,
}

impl RedisAvailabilityCache {
    pub async fn new(url: &str, key_prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(cache_err)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_err)?;

        info!(url = %url, "Connected to Redis for availability counters");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            ttl,
            adjust: Script::new(ADJUST_IF_PRESENT),
        })
    }

    fn key(&self, tenant_id: Uuid, product_id: Uuid) -> String {
        format!("{}:avail:{}:{}", self.key_prefix, tenant_id, product_id)
    }
}

#[async_trait]
impl AvailabilityCache for RedisAvailabilityCache {
    async fn get(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(self.key(tenant_id, product_id))
            .await
            .map_err(cache_err)?;
        Ok(value)
    }

    async fn set(&self, tenant_id: Uuid, product_id: Uuid, quantity: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.key(tenant_id, product_id), quantity, self.ttl.as_secs())
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn adjust(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self
            .adjust
            .key(self.key(tenant_id, product_id))
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(value)
    }

    async fn invalidate(&self, tenant_id: Uuid, product_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.key(tenant_id, product_id))
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAvailabilityCache {
    counters: DashMap<(Uuid, Uuid), i64>,
}

impl MemoryAvailabilityCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AvailabilityCache for MemoryAvailabilityCache {
    async fn get(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError> {
        Ok(self.counters.get(&(tenant_id, product_id)).map(|v| *v))
    }

    async fn set(&self, tenant_id: Uuid, product_id: Uuid, quantity: i64) -> Result<(), StoreError> {
        self.counters.insert((tenant_id, product_id), quantity);
        Ok(())
    }

    async fn adjust(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .counters
            .get_mut(&(tenant_id, product_id))
            .map(|mut v| {
                *v += delta;
                *v
            }))
    }

    async fn invalidate(&self, tenant_id: Uuid, product_id: Uuid) -> Result<(), StoreError> {
        self.counters.remove(&(tenant_id, product_id));
        Ok(())
    }
}

/// Read-through view over the cache and the ledger. Cache failures are logged and
/// never fail the caller.
#[derive(Clone)]
pub struct Availability {
    cache: Arc<dyn AvailabilityCache>,
    ledger: Arc<dyn Ledger>,
}

impl Availability {
    pub fn new(cache: Arc<dyn AvailabilityCache>, ledger: Arc<dyn Ledger>) -> Self {
        Self { cache, ledger }
    }

    pub async fn available(&self, tenant_id: Uuid, product_id: Uuid) -> Result<i64, DomainError> {
        match self.cache.get(tenant_id, product_id).await {
            Ok(Some(quantity)) => return Ok(quantity.max(0)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, %product_id, "Availability cache read failed"),
        }

        let stock = self
            .ledger
            .product_stock(tenant_id, product_id)
            .await?
            .ok_or(DomainError::ProductNotFound(product_id))?;
        let available = stock.available();
        debug!(%product_id, available, "Seeding availability counter from ledger");
        if let Err(e) = self.cache.set(tenant_id, product_id, available).await {
            warn!(error = %e, %product_id, "Failed to seed availability counter");
        }
        Ok(available)
    }

    pub async fn record_reserved(&self, tenant_id: Uuid, product_id: Uuid, quantity: i64) {
        self.adjust(tenant_id, product_id, -quantity).await;
    }

    pub async fn record_released(&self, tenant_id: Uuid, product_id: Uuid, quantity: i64) {
        self.adjust(tenant_id, product_id, quantity).await;
    }

    /// Gives committed releases back to the counters.
    pub async fn restock(&self, released: &[Reservation]) {
        for r in released {
            self.record_released(r.tenant_id, r.product_id, i64::from(r.quantity))
                .await;
        }
    }

    async fn adjust(&self, tenant_id: Uuid, product_id: Uuid, delta: i64) {
        if let Err(e) = self.cache.adjust(tenant_id, product_id, delta).await {
            // A stale counter is worse than none: drop it so the next read re-seeds.
            warn!(error = %e, %product_id, delta, "Availability adjust failed, invalidating");
            if let Err(e) = self.cache.invalidate(tenant_id, product_id).await {
                warn!(error = %e, %product_id, "Availability invalidate failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::store::MemoryLedger;
    use shared::Product;

    async fn setup(total: i64) -> (Availability, Arc<MemoryAvailabilityCache>, Uuid, Uuid) {
        let ledger = Arc::new(MemoryLedger::new());
        let tenant = Uuid::new_v4();
        let product = Uuid::new_v4();
        ledger
            .upsert_product(Product {
                id: product,
                tenant_id: tenant,
                name: "Nasi Goreng".into(),
                sku: "NG-01".into(),
                unit_price: 25000,
                total_quantity: total,
            })
            .await;
        let cache = Arc::new(MemoryAvailabilityCache::new());
        (
            Availability::new(cache.clone(), ledger),
            cache,
            tenant,
            product,
        )
    }

    #[tokio::test]
    async fn miss_seeds_from_ledger() {
        let (availability, cache, tenant, product) = setup(7).await;

        assert_eq!(availability.available(tenant, product).await.unwrap(), 7);
        assert_eq!(cache.get(tenant, product).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn adjustments_only_touch_seeded_counters() {
        let (availability, cache, tenant, product) = setup(7).await;

        availability.record_reserved(tenant, product, 2).await;
        assert_eq!(cache.get(tenant, product).await.unwrap(), None);

        availability.available(tenant, product).await.unwrap();
        availability.record_reserved(tenant, product, 2).await;
        availability.record_released(tenant, product, 1).await;
        assert_eq!(availability.available(tenant, product).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn negative_counter_reads_as_zero() {
        let (availability, cache, tenant, product) = setup(1).await;
        cache.set(tenant, product, -3).await.unwrap();

        assert_eq!(availability.available(tenant, product).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let (availability, _, tenant, _) = setup(1).await;
        let missing = Uuid::new_v4();

        let err = availability.available(tenant, missing).await.unwrap_err();
        assert!(matches!(err, DomainError::ProductNotFound(id) if id == missing));
    }
}
