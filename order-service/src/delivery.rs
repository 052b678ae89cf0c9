//! Delivery fee and service-area evaluation. Pure; coordinates come from a
//! [`Geocoder`] earlier in checkout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{Coordinates, DomainError};
use std::collections::HashMap;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceTier {
    /// Inclusive upper bound of this tier.
    pub up_to_km: f64,
    pub fee: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryZone {
    pub name: String,
    pub polygon: Vec<Coordinates>,
    pub fee: i64,
}

/// Per-tenant pricing strategy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PricingConfig {
    /// Fee collected out-of-band; every address is accepted.
    #[default]
    Disabled,
    Flat { fee: i64 },
    /// Graduated fee by great-circle distance from `origin`. Beyond the last tier is
    /// out of area.
    DistanceTiered {
        origin: Coordinates,
        tiers: Vec<DistanceTier>,
    },
    /// First zone containing the point wins.
    Zones { zones: Vec<DeliveryZone> },
}

impl PricingConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |msg: &str| Err(DomainError::InvalidRequest(msg.to_string()));
        match self {
            PricingConfig::Disabled => Ok(()),
            PricingConfig::Flat { fee } if *fee < 0 => invalid("flat fee must not be negative"),
            PricingConfig::Flat { .. } => Ok(()),
            PricingConfig::DistanceTiered { tiers, .. } => {
                if tiers.is_empty() {
                    return invalid("distance pricing needs at least one tier");
                }
                if tiers.iter().any(|t| t.fee < 0 || t.up_to_km <= 0.0) {
                    return invalid("tiers need a positive bound and non-negative fee");
                }
                if tiers.windows(2).any(|w| w[0].up_to_km >= w[1].up_to_km) {
                    return invalid("tiers must be sorted by distance");
                }
                Ok(())
            }
            PricingConfig::Zones { zones } => {
                if zones.iter().any(|z| z.polygon.len() < 3 || z.fee < 0) {
                    return invalid("zones need at least three vertices and a non-negative fee");
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryQuote {
    pub serviceable: bool,
    pub fee: i64,
    pub zone: Option<String>,
    pub distance_km: Option<f64>,
}

impl DeliveryQuote {
    fn unserviceable(zone: Option<String>, distance_km: Option<f64>) -> Self {
        Self {
            serviceable: false,
            fee: 0,
            zone,
            distance_km,
        }
    }
}

pub fn evaluate(config: &PricingConfig, point: Coordinates) -> DeliveryQuote {
    match config {
        PricingConfig::Disabled => DeliveryQuote {
            serviceable: true,
            fee: 0,
            zone: None,
            distance_km: None,
        },
        PricingConfig::Flat { fee } => DeliveryQuote {
            serviceable: true,
            fee: *fee,
            zone: None,
            distance_km: None,
        },
        PricingConfig::DistanceTiered { origin, tiers } => {
            let distance = haversine_km(*origin, point);
            match tiers.iter().find(|t| distance <= t.up_to_km) {
                Some(tier) => DeliveryQuote {
                    serviceable: true,
                    fee: tier.fee,
                    zone: None,
                    distance_km: Some(distance),
                },
                None => DeliveryQuote::unserviceable(None, Some(distance)),
            }
        }
        PricingConfig::Zones { zones } => {
            match zones.iter().find(|z| point_in_polygon(point, &z.polygon)) {
                Some(zone) => DeliveryQuote {
                    serviceable: true,
                    fee: zone.fee,
                    zone: Some(zone.name.clone()),
                    distance_km: None,
                },
                None => DeliveryQuote::unserviceable(None, None),
            }
        }
    }
}

pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Even-odd ray casting, treating lng as x and lat as y.
pub fn point_in_polygon(point: Coordinates, polygon: &[Coordinates]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (x, y) = (point.lng, point.lat);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].lng, polygon[i].lat);
        let (xj, yj) = (polygon[j].lng, polygon[j].lat);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `None` when the address cannot be resolved.
    async fn resolve(&self, address: &str) -> Result<Option<Coordinates>, DomainError>;
}

/// Fixed lookup table, keyed by the trimmed, lowercased address.
#[derive(Debug, Clone, Default)]
pub struct StaticGeocoder {
    known: HashMap<String, Coordinates>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, coordinates: Coordinates) -> Self {
        self.known.insert(normalize(address), coordinates);
        self
    }

    /// Reads a JSON object of `address -> {"lat", "lng"}`.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let entries: HashMap<String, Coordinates> = serde_json::from_str(&json)?;
        Ok(entries
            .into_iter()
            .fold(Self::new(), |geocoder, (address, point)| {
                geocoder.with(&address, point)
            }))
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn resolve(&self, address: &str) -> Result<Option<Coordinates>, DomainError> {
        Ok(self.known.get(&normalize(address)).copied())
    }
}
