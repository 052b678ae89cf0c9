use payment_service::TenantKeys;
use serde::Deserialize;
use shared::DomainError;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::delivery::PricingConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub pricing: PricingConfig,
    pub reservation_ttl_secs: Option<u64>,
    pub gateway_server_key: Option<String>,
}

impl TenantSettings {
    pub fn reservation_ttl(&self) -> Option<Duration> {
        self.reservation_ttl_secs.map(Duration::from_secs)
    }
}

/// Per-tenant configuration owned by tenant management.
pub trait TenantDirectory: Send + Sync {
    /// Unknown tenants get the defaults.
    fn settings(&self, tenant_id: Uuid) -> TenantSettings;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: HashMap<Uuid, TenantSettings>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: Uuid, settings: TenantSettings) -> Self {
        self.tenants.insert(tenant_id, settings);
        self
    }

    /// Loads a JSON object of `tenant id -> settings`.
    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        let tenants: HashMap<Uuid, TenantSettings> = serde_json::from_str(json)
            .map_err(|e| DomainError::InvalidRequest(format!("invalid tenant settings: {e}")))?;
        for settings in tenants.values() {
            settings.pricing.validate()?;
        }
        Ok(Self { tenants })
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

impl TenantDirectory for StaticTenantDirectory {
    fn settings(&self, tenant_id: Uuid) -> TenantSettings {
        self.tenants.get(&tenant_id).cloned().unwrap_or_default()
    }
}

impl TenantKeys for StaticTenantDirectory {
    fn server_key(&self, tenant_id: Uuid) -> Option<String> {
        self.tenants
            .get(&tenant_id)
            .and_then(|s| s.gateway_server_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_settings_from_json() {
        let tenant = Uuid::new_v4();
        let json = format!(
            r#"{{"{tenant}": {{
                "pricing": {{"strategy": "flat", "fee": 5000}},
                "reservation_ttl_secs": 600,
                "gateway_server_key": "tenant-key"
            }}}}"#
        );

        let directory = StaticTenantDirectory::from_json(&json).unwrap();
        let settings = directory.settings(tenant);

        assert_eq!(settings.pricing, PricingConfig::Flat { fee: 5000 });
        assert_eq!(settings.reservation_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(directory.server_key(tenant).as_deref(), Some("tenant-key"));
    }

    #[test]
    fn unknown_tenant_gets_defaults() {
        let directory = StaticTenantDirectory::new();
        let settings = directory.settings(Uuid::new_v4());

        assert_eq!(settings.pricing, PricingConfig::Disabled);
        assert!(settings.reservation_ttl().is_none());
    }

    #[test]
    fn invalid_pricing_is_rejected() {
        let json = format!(
            r#"{{"{}": {{"pricing": {{"strategy": "flat", "fee": -1}}}}}}"#,
            Uuid::new_v4()
        );
        assert!(StaticTenantDirectory::from_json(&json).is_err());
    }
}
