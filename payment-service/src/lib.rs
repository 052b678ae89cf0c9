pub mod api;
pub mod gateway;
pub mod notification;
pub mod signature;
pub mod webhook;

pub use gateway::{
    GatewayConfig, IntentItem, PaymentGateway, PaymentIntent, PaymentIntentRequest,
    PlatformKeysOnly, SnapGateway, TenantKeys,
};
pub use notification::{GatewayKind, GatewayStatus, Notification, PaymentAction};
pub use webhook::{NotificationOutcome, NotificationProcessor};
