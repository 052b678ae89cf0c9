use std::time::Duration;

pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(15 * 60);
pub const MIN_RESERVATION_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CART_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_BATCH: i64 = 500;

/// Timing knobs shared by checkout, the cart store and the sweeper.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub reservation_ttl: Duration,
    /// Tenant overrides below this floor are raised to it.
    pub min_reservation_ttl: Duration,
    pub cart_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            min_reservation_ttl: MIN_RESERVATION_TTL,
            cart_ttl: DEFAULT_CART_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_batch_size: DEFAULT_SWEEP_BATCH,
        }
    }
}

impl CheckoutConfig {
    pub fn reservation_ttl_for(&self, tenant_override: Option<Duration>) -> Duration {
        tenant_override
            .unwrap_or(self.reservation_ttl)
            .max(self.min_reservation_ttl)
    }
}
