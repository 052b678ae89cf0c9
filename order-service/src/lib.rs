pub mod api;
pub mod cart;
pub mod checkout;
pub mod delivery;
pub mod orders;
pub mod outbox;
pub mod tenant;

pub use api::{create_router, AppState};
pub use cart::{AddOutcome, Cart, CartService, CartStore, MemoryCartStore, RedisCartStore};
pub use checkout::{CheckoutReceipt, CheckoutService, CreatedOrder, DeliveryInfo};
pub use delivery::{DeliveryQuote, Geocoder, PricingConfig, StaticGeocoder};
pub use orders::{OrderService, OrderView};
pub use outbox::{EventPublisher, KafkaPublisher, OutboxProcessor};
pub use tenant::{StaticTenantDirectory, TenantDirectory, TenantSettings};
