//! Outbound payment-intent creation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::DomainError;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::notification::GatewayKind;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub server_key: String,
    /// Shared secret for body-HMAC notifications.
    pub webhook_secret: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Secret a notification from `gateway` must be signed with. A tenant's own server
    /// key wins over the platform key.
    pub fn notification_secret(&self, gateway: GatewayKind, tenant_key: Option<String>) -> String {
        match gateway {
            GatewayKind::Midtrans => tenant_key.unwrap_or_else(|| self.server_key.clone()),
            GatewayKind::Generic => self.webhook_secret.clone(),
        }
    }
}

/// Per-tenant gateway credentials.
pub trait TenantKeys: Send + Sync {
    fn server_key(&self, tenant_id: Uuid) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformKeysOnly;

impl TenantKeys for PlatformKeysOnly {
    fn server_key(&self, _tenant_id: Uuid) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentItem {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct PaymentIntentRequest {
    pub tenant_id: Uuid,
    pub order_reference: String,
    pub gross_amount: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub items: Vec<IntentItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub token: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_transaction(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, DomainError>;
}

pub struct SnapGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    keys: std::sync::Arc<dyn TenantKeys>,
}

impl SnapGateway {
    pub fn new(
        config: GatewayConfig,
        keys: std::sync::Arc<dyn TenantKeys>,
    ) -> Result<Self, DomainError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DomainError::Gateway(e.to_string()))?;
        Ok(Self {
            client,
            config,
            keys,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SnapResponse {
    token: String,
    redirect_url: String,
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    fn name(&self) -> &'static str {
        GatewayKind::Midtrans.as_str()
    }

    async fn create_transaction(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, DomainError> {
        let server_key = self
            .keys
            .server_key(request.tenant_id)
            .unwrap_or_else(|| self.config.server_key.clone());
        let url = format!(
            "{}/snap/v1/transactions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "transaction_details": {
                "order_id": request.order_reference,
                "gross_amount": request.gross_amount,
            },
            "customer_details": {
                "first_name": request.customer_name,
                "phone": request.customer_phone,
            },
            "item_details": request.items,
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&server_key, None::<&str>)
            .json(&body)
            .send()
            .await
            .map_err(|e| DomainError::Gateway(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(
                order_reference = %request.order_reference,
                status = %status,
                body = %text,
                "Payment intent creation rejected"
            );
            return Err(DomainError::Gateway(format!(
                "gateway returned {status}"
            )));
        }

        let snap: SnapResponse = response
            .json()
            .await
            .map_err(|e| DomainError::Gateway(e.to_string()))?;

        info!(order_reference = %request.order_reference, "Payment intent created");

        Ok(PaymentIntent {
            token: snap.token,
            redirect_url: snap.redirect_url,
        })
    }
}
