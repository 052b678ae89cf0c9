#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use inventory_service::{Availability, ExpirySweeper, MemoryAvailabilityCache, ReservationLedger};
use order_service::delivery::DistanceTier;
use order_service::{
    CartService, CheckoutService, DeliveryInfo, MemoryCartStore, OrderService, PricingConfig,
    StaticGeocoder, StaticTenantDirectory, TenantSettings,
};
use payment_service::signature::midtrans_signature;
use payment_service::{
    GatewayConfig, NotificationProcessor, PaymentGateway, PaymentIntent, PaymentIntentRequest,
};
use serde_json::json;
use shared::cipher::PlaintextCipher;
use shared::clock::ManualClock;
use shared::config::CheckoutConfig;
use shared::store::{Ledger, MemoryLedger};
use shared::{Coordinates, DeliveryType, DomainError, OrderDetails, Product};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SERVER_KEY: &str = "SB-Mid-server-test";
pub const WEBHOOK_SECRET: &str = "whsec-test";
pub const UNIT_PRICE: i64 = 25000;

pub const NEAR_ADDRESS: &str = "Jl. Braga No. 10, Bandung";
pub const FAR_ADDRESS: &str = "Jl. Malioboro No. 1, Yogyakarta";

#[derive(Default)]
pub struct FakeGateway {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn name(&self) -> &'static str {
        "midtrans"
    }

    async fn create_transaction(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, DomainError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DomainError::Gateway("connection refused".to_string()));
        }
        Ok(PaymentIntent {
            token: format!("tok-{n}"),
            redirect_url: format!("https://pay.test/{}/{n}", request.order_reference),
        })
    }
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub clock: ManualClock,
    pub gateway: Arc<FakeGateway>,
    pub carts: CartService,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub webhook: Arc<NotificationProcessor>,
    pub sweeper: ExpirySweeper,
    pub tenant: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = ManualClock::new(Utc::now());
        let cache = Arc::new(MemoryAvailabilityCache::new());
        let availability = Availability::new(cache, ledger.clone());
        let tenant = Uuid::new_v4();

        // Origin in central Bandung; delivery within 10 km.
        let tenants = Arc::new(StaticTenantDirectory::new().with_tenant(
            tenant,
            TenantSettings {
                pricing: PricingConfig::DistanceTiered {
                    origin: Coordinates {
                        lat: -6.9175,
                        lng: 107.6191,
                    },
                    tiers: vec![
                        DistanceTier {
                            up_to_km: 3.0,
                            fee: 8000,
                        },
                        DistanceTier {
                            up_to_km: 10.0,
                            fee: 15000,
                        },
                    ],
                },
                reservation_ttl_secs: None,
                gateway_server_key: None,
            },
        ));
        let geocoder = Arc::new(
            StaticGeocoder::new()
                .with(
                    NEAR_ADDRESS,
                    Coordinates {
                        lat: -6.9147,
                        lng: 107.6098,
                    },
                )
                .with(
                    FAR_ADDRESS,
                    Coordinates {
                        lat: -7.7926,
                        lng: 110.3658,
                    },
                ),
        );

        let config = CheckoutConfig::default();
        let carts = CartService::new(
            Arc::new(MemoryCartStore::new(Arc::new(clock.clone()))),
            availability.clone(),
            Arc::new(clock.clone()),
            config.cart_ttl,
        );
        let gateway = Arc::new(FakeGateway::default());
        let cipher = Arc::new(PlaintextCipher);

        let checkout = Arc::new(CheckoutService::new(
            ledger.clone(),
            availability.clone(),
            carts.clone(),
            gateway.clone(),
            geocoder,
            tenants.clone(),
            cipher.clone(),
            Arc::new(clock.clone()),
            config.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            ledger.clone(),
            availability.clone(),
            cipher,
            Arc::new(clock.clone()),
        ));
        let webhook = Arc::new(NotificationProcessor::new(
            ledger.clone(),
            availability.clone(),
            Arc::new(clock.clone()),
            GatewayConfig {
                base_url: "http://gateway.invalid".into(),
                server_key: SERVER_KEY.into(),
                webhook_secret: WEBHOOK_SECRET.into(),
                timeout: Duration::from_secs(5),
            },
            tenants,
        ));
        let reservations =
            ReservationLedger::new(ledger.clone(), availability, Arc::new(clock.clone()));
        let sweeper = ExpirySweeper::new(
            ledger.clone(),
            reservations,
            Arc::new(clock.clone()),
            config.sweep_interval,
            config.sweep_batch_size,
        );

        Self {
            ledger,
            clock,
            gateway,
            carts,
            checkout,
            orders,
            webhook,
            sweeper,
            tenant,
        }
    }

    pub async fn product(&self, name: &str, stock: i64) -> Uuid {
        self.priced_product(name, stock, UNIT_PRICE).await
    }

    pub async fn priced_product(&self, name: &str, stock: i64, unit_price: i64) -> Uuid {
        let id = Uuid::new_v4();
        self.ledger
            .upsert_product(Product {
                id,
                tenant_id: self.tenant,
                name: name.to_string(),
                sku: name.to_uppercase().replace(' ', "-"),
                unit_price,
                total_quantity: stock,
            })
            .await;
        id
    }

    pub async fn details(&self, reference: &str) -> OrderDetails {
        self.ledger
            .order_details(self.tenant, reference)
            .await
            .unwrap()
            .unwrap()
    }

    pub fn pass_minutes(&self, minutes: i64) {
        self.clock.advance(ChronoDuration::minutes(minutes));
    }
}

pub fn pickup(name: &str) -> DeliveryInfo {
    DeliveryInfo {
        customer_name: name.to_string(),
        customer_phone: "081234567890".to_string(),
        delivery_type: DeliveryType::Pickup,
        table_number: None,
        notes: None,
        address: None,
    }
}

pub fn delivery_to(name: &str, address: &str) -> DeliveryInfo {
    DeliveryInfo {
        delivery_type: DeliveryType::Delivery,
        address: Some(address.to_string()),
        ..pickup(name)
    }
}

/// A Midtrans-style notification signed with the platform server key.
pub fn midtrans_body(transaction_id: &str, reference: &str, status: &str, total: i64) -> Vec<u8> {
    let gross_amount = format!("{total}.00");
    json!({
        "transaction_id": transaction_id,
        "order_id": reference,
        "gross_amount": gross_amount,
        "transaction_status": status,
        "status_code": "200",
        "payment_type": "qris",
        "signature_key": midtrans_signature(reference, "200", &gross_amount, SERVER_KEY),
    })
    .to_string()
    .into_bytes()
}
