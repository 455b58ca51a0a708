//! Distance Resolution
//!
//! An ordered chain of `DistanceProvider` strategies. Each is tried once, under
//! its own timeout, until one produces a usable distance.

mod geodesic;
mod routing;

pub use geodesic::{haversine_km, GreatCircleProvider, EARTH_RADIUS_KM};
pub use routing::{OpenRouteServiceProvider, OsrmProvider};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::models::{Coordinate, ProviderTag};

pub use crate::models::ProviderFailure;

/// One way of measuring the distance between two points.
#[async_trait]
pub trait DistanceProvider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    /// Budget for a single call. `None` means the call is not network bound.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Distance in kilometers, unrounded.
    async fn distance_km(&self, from: Coordinate, to: Coordinate) -> Result<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub distance_km: Option<f64>,
    pub provider: ProviderTag,
    /// Providers that were tried and failed, in chain order
    pub failures: Vec<ProviderFailure>,
}

impl Resolution {
    fn failed(failures: Vec<ProviderFailure>) -> Self {
        Self {
            distance_km: None,
            provider: ProviderTag::Failed,
            failures,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.distance_km.is_some()
    }
}

pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct DistanceResolver {
    providers: Vec<Arc<dyn DistanceProvider>>,
}

impl DistanceResolver {
    pub fn new(providers: Vec<Arc<dyn DistanceProvider>>) -> Self {
        Self { providers }
    }

    /// Resolver with only the great-circle fallback.
    pub fn geometric_only() -> Self {
        Self::new(vec![Arc::new(GreatCircleProvider)])
    }

    /// ORS, then OSRM, then great-circle.
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.routing_timeout)
            .build()
            .context("Failed to build routing HTTP client")?;

        Ok(Self::new(vec![
            Arc::new(OpenRouteServiceProvider::new(
                client.clone(),
                config.ors_base_url.clone(),
                config.ors_api_key.clone(),
                config.routing_timeout,
            )),
            Arc::new(OsrmProvider::new(client, config.osrm_base_url.clone(), config.routing_timeout)),
            Arc::new(GreatCircleProvider),
        ]))
    }

    pub fn provider_tags(&self) -> Vec<ProviderTag> {
        self.providers.iter().map(|p| p.tag()).collect()
    }

    pub async fn resolve(&self, from: Coordinate, to: Coordinate) -> Resolution {
        if !from.is_valid() || !to.is_valid() {
            warn!(?from, ?to, "Malformed coordinates, skipping distance providers");
            return Resolution::failed(vec![ProviderFailure {
                provider: ProviderTag::Failed,
                error: "malformed coordinates".to_string(),
            }]);
        }

        let mut failures = Vec::new();

        for provider in &self.providers {
            let tag = provider.tag();
            let call = provider.distance_km(from, to);
            let outcome = match provider.timeout() {
                Some(budget) => match tokio::time::timeout(budget, call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", budget)),
                },
                None => call.await,
            };

            match outcome {
                Ok(km) if km.is_finite() && km >= 0.0 => {
                    let km = round_km(km);
                    debug!(provider = %tag, distance_km = km, "Distance resolved");
                    return Resolution {
                        distance_km: Some(km),
                        provider: tag,
                        failures,
                    };
                }
                Ok(km) => {
                    warn!(provider = %tag, distance_km = km, "Provider returned an unusable distance");
                    failures.push(ProviderFailure {
                        provider: tag,
                        error: format!("unusable distance {}", km),
                    });
                }
                Err(e) => {
                    warn!(provider = %tag, error = %e, "Distance provider failed, trying next");
                    failures.push(ProviderFailure {
                        provider: tag,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Resolution::failed(failures)
    }
}
