//! Guest session carts. Ephemeral: every mutation rewrites the whole cart and resets
//! its TTL, and nothing here is authoritative about stock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use inventory_service::Availability;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use serde::{Deserialize, Serialize};
use shared::clock::Clock;
use shared::{DomainError, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub tenant_id: Uuid,
    pub session_id: String,
    pub items: BTreeMap<Uuid, i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(tenant_id: Uuid, session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            session_id: session_id.to_string(),
            items: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn quantity_of(&self, product_id: Uuid) -> i32 {
        self.items.get(&product_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AddOutcome {
    Added,
    /// Less than requested was available; `applied` is what the cart now holds for
    /// this request.
    Adjusted { requested: i32, applied: i32 },
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn load(&self, tenant_id: Uuid, session_id: &str) -> Result<Option<Cart>, StoreError>;

    /// Replaces the stored cart and restarts its TTL.
    async fn save(&self, cart: &Cart, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, tenant_id: Uuid, session_id: &str) -> Result<(), StoreError>;
}

fn cache_err(e: RedisError) -> StoreError {
    StoreError::Cache(e.to_string())
}

pub struct RedisCartStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisCartStore {
    pub async fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(cache_err)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_err)?;

        info!(url = %url, "Connected to Redis for session carts");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, tenant_id: Uuid, session_id: &str) -> String {
        format!("{}:cart:{}:{}", self.key_prefix, tenant_id, session_id)
    }
}

#[async_trait]
impl CartStore for RedisCartStore {
    async fn load(&self, tenant_id: Uuid, session_id: &str) -> Result<Option<Cart>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.key(tenant_id, session_id))
            .await
            .map_err(cache_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, cart: &Cart, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(cart)?;
        let _: () = conn
            .set_ex(self.key(cart.tenant_id, &cart.session_id), json, ttl.as_secs())
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.key(tenant_id, session_id))
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

/// Expiry is evaluated lazily against the injected clock.
pub struct MemoryCartStore {
    carts: DashMap<(Uuid, String), (Cart, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl MemoryCartStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            carts: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl CartStore for MemoryCartStore {
    async fn load(&self, tenant_id: Uuid, session_id: &str) -> Result<Option<Cart>, StoreError> {
        let key = (tenant_id, session_id.to_string());
        let now = self.clock.now();
        let expired = match self.carts.get(&key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.carts.remove(&key);
        }
        Ok(None)
    }

    async fn save(&self, cart: &Cart, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Cache(format!("invalid cart ttl: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        self.carts.insert(
            (cart.tenant_id, cart.session_id.clone()),
            (cart.clone(), expires_at),
        );
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, session_id: &str) -> Result<(), StoreError> {
        self.carts.remove(&(tenant_id, session_id.to_string()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn CartStore>,
    availability: Availability,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CartService {
    pub fn new(
        store: Arc<dyn CartStore>,
        availability: Availability,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            availability,
            clock,
            ttl,
        }
    }

    pub async fn get_cart(&self, tenant_id: Uuid, session_id: &str) -> Result<Cart, DomainError> {
        Ok(self
            .store
            .load(tenant_id, session_id)
            .await?
            .unwrap_or_else(|| Cart::new(tenant_id, session_id, self.clock.now())))
    }

    /// Adds up to `requested` units, clamped to what is currently available for sale.
    pub async fn add_item(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        product_id: Uuid,
        requested: i32,
    ) -> Result<(Cart, AddOutcome), DomainError> {
        if requested <= 0 {
            return Err(DomainError::InvalidRequest(
                "quantity must be positive".to_string(),
            ));
        }

        let available = self.availability.available(tenant_id, product_id).await?;
        if available == 0 {
            return Err(DomainError::OutOfStock {
                product_id,
                available,
            });
        }

        // The line is capped at what is available; a full line reports `applied: 0`.
        let mut cart = self.get_cart(tenant_id, session_id).await?;
        let existing = cart.quantity_of(product_id);
        let room = (available - i64::from(existing)).max(0);
        let applied = i32::try_from(room.min(i64::from(requested))).unwrap_or(requested);
        if applied > 0 {
            cart.items.insert(product_id, existing + applied);
            self.save(&mut cart).await?;
        }

        let outcome = if applied < requested {
            debug!(%product_id, requested, applied, "Clamped cart add to availability");
            AddOutcome::Adjusted { requested, applied }
        } else {
            AddOutcome::Added
        };
        Ok((cart, outcome))
    }

    /// Sets a line to `quantity`; zero removes it.
    pub async fn update_item(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(Cart, AddOutcome), DomainError> {
        if quantity < 0 {
            return Err(DomainError::InvalidRequest(
                "quantity must not be negative".to_string(),
            ));
        }
        if quantity == 0 {
            let cart = self.remove_item(tenant_id, session_id, product_id).await?;
            return Ok((cart, AddOutcome::Added));
        }

        let available = self.availability.available(tenant_id, product_id).await?;
        if available <= 0 {
            return Err(DomainError::OutOfStock {
                product_id,
                available,
            });
        }

        let mut cart = self.get_cart(tenant_id, session_id).await?;
        let applied = i32::try_from(available.min(i64::from(quantity))).unwrap_or(quantity);
        cart.items.insert(product_id, applied);
        self.save(&mut cart).await?;

        let outcome = if applied < quantity {
            AddOutcome::Adjusted {
                requested: quantity,
                applied,
            }
        } else {
            AddOutcome::Added
        };
        Ok((cart, outcome))
    }

    pub async fn remove_item(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        product_id: Uuid,
    ) -> Result<Cart, DomainError> {
        let mut cart = self.get_cart(tenant_id, session_id).await?;
        if cart.items.remove(&product_id).is_some() {
            self.save(&mut cart).await?;
        }
        Ok(cart)
    }

    pub async fn clear_cart(&self, tenant_id: Uuid, session_id: &str) -> Result<(), DomainError> {
        self.store.delete(tenant_id, session_id).await?;
        Ok(())
    }

    async fn save(&self, cart: &mut Cart) -> Result<(), DomainError> {
        cart.updated_at = self.clock.now();
        self.store.save(cart, self.ttl).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_service::MemoryAvailabilityCache;
    use shared::clock::ManualClock;
    use shared::store::MemoryLedger;
    use shared::Product;

    struct Fixture {
        carts: CartService,
        clock: ManualClock,
        tenant: Uuid,
        product: Uuid,
    }

    async fn fixture(stock: i64) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = ManualClock::new(Utc::now());
        let tenant = Uuid::new_v4();
        let product = Uuid::new_v4();
        ledger
            .upsert_product(Product {
                id: product,
                tenant_id: tenant,
                name: "Mie Ayam".into(),
                sku: "MA-01".into(),
                unit_price: 20000,
                total_quantity: stock,
            })
            .await;
        let availability = Availability::new(Arc::new(MemoryAvailabilityCache::new()), ledger);
        let carts = CartService::new(
            Arc::new(MemoryCartStore::new(Arc::new(clock.clone()))),
            availability,
            Arc::new(clock.clone()),
            Duration::from_secs(24 * 60 * 60),
        );
        Fixture {
            carts,
            clock,
            tenant,
            product,
        }
    }

    #[tokio::test]
    async fn add_within_stock() {
        let f = fixture(10).await;

        let (cart, outcome) = f.carts.add_item(f.tenant, "s1", f.product, 3).await.unwrap();

        assert_eq!(outcome, AddOutcome::Added);
        assert_eq!(cart.quantity_of(f.product), 3);
    }

    #[tokio::test]
    async fn add_clamps_to_available() {
        let f = fixture(4).await;

        let (cart, outcome) = f.carts.add_item(f.tenant, "s1", f.product, 9).await.unwrap();

        assert_eq!(
            outcome,
            AddOutcome::Adjusted {
                requested: 9,
                applied: 4
            }
        );
        assert_eq!(cart.quantity_of(f.product), 4);
    }

    #[tokio::test]
    async fn add_counts_existing_line() {
        let f = fixture(4).await;
        f.carts.add_item(f.tenant, "s1", f.product, 3).await.unwrap();

        let (cart, outcome) = f.carts.add_item(f.tenant, "s1", f.product, 3).await.unwrap();
        assert_eq!(
            outcome,
            AddOutcome::Adjusted {
                requested: 3,
                applied: 1
            }
        );
        assert_eq!(cart.quantity_of(f.product), 4);

        let (cart, outcome) = f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap();
        assert_eq!(
            outcome,
            AddOutcome::Adjusted {
                requested: 1,
                applied: 0
            }
        );
        assert_eq!(cart.quantity_of(f.product), 4);
    }

    #[tokio::test]
    async fn full_line_is_adjusted_not_out_of_stock() {
        let f = fixture(5).await;
        f.carts.add_item(f.tenant, "s1", f.product, 5).await.unwrap();

        let (cart, outcome) = f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap();

        assert_eq!(
            outcome,
            AddOutcome::Adjusted {
                requested: 1,
                applied: 0
            }
        );
        assert_eq!(cart.quantity_of(f.product), 5);
    }

    #[tokio::test]
    async fn removing_from_missing_cart_does_not_create_one() {
        let f = fixture(5).await;

        let cart = f.carts.remove_item(f.tenant, "ghost", f.product).await.unwrap();

        assert!(cart.is_empty());
        assert!(f.carts.store.load(f.tenant, "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_stock_rejects_without_touching_cart() {
        let f = fixture(0).await;

        let err = f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap_err();

        assert!(matches!(err, DomainError::OutOfStock { available: 0, .. }));
        assert!(f.carts.get_cart(f.tenant, "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_to_zero_removes_line() {
        let f = fixture(5).await;
        f.carts.add_item(f.tenant, "s1", f.product, 2).await.unwrap();

        let (cart, _) = f.carts.update_item(f.tenant, "s1", f.product, 0).await.unwrap();

        assert!(cart.is_empty());
    }

    #[tokio::test]
    async fn carts_expire_after_ttl_and_mutations_reset_it() {
        let f = fixture(5).await;
        f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap();

        f.clock.advance(chrono::Duration::hours(23));
        f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap();
        f.clock.advance(chrono::Duration::hours(23));
        assert_eq!(
            f.carts.get_cart(f.tenant, "s1").await.unwrap().quantity_of(f.product),
            2
        );

        f.clock.advance(chrono::Duration::hours(2));
        assert!(f.carts.get_cart(f.tenant, "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_and_tenants_are_isolated() {
        let f = fixture(5).await;
        f.carts.add_item(f.tenant, "s1", f.product, 1).await.unwrap();

        assert!(f.carts.get_cart(f.tenant, "s2").await.unwrap().is_empty());
        assert!(f.carts.get_cart(Uuid::new_v4(), "s1").await.unwrap().is_empty());
    }
}
