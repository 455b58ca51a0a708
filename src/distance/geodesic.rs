//! Great-circle distance
//!
//! Last link of the resolver chain. Needs no network and only fails on
//! malformed coordinates.

use anyhow::Result;
use async_trait::async_trait;

use super::DistanceProvider;
use crate::models::{Coordinate, ProviderTag};

/// Mean Earth radius (IUGG), kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Haversine distance between two points in kilometers.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GreatCircleProvider;

#[async_trait]
impl DistanceProvider for GreatCircleProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::GeometricFallback
    }

    async fn distance_km(&self, from: Coordinate, to: Coordinate) -> Result<f64> {
        if !from.is_valid() || !to.is_valid() {
            anyhow::bail!("malformed coordinates {:?} -> {:?}", from, to);
        }
        Ok(haversine_km(from, to))
    }
}
