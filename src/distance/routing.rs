//! Road-network routing providers
//!
//! OpenRouteService is tried first, the public OSRM demo server second. Both
//! report meters; we convert to kilometers and leave rounding to the resolver.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::DistanceProvider;
use crate::models::{Coordinate, ProviderTag};

const MAX_ERROR_BODY: usize = 200;

/// Reads a failed response into an error, keeping a short body excerpt.
async fn status_error(provider: &str, res: reqwest::Response) -> anyhow::Error {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    anyhow::anyhow!("{} returned {}: {}", provider, status, excerpt)
}

pub struct OpenRouteServiceProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenRouteServiceProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            timeout,
        }
    }
}

#[async_trait]
impl DistanceProvider for OpenRouteServiceProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::PrimaryRouting
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn distance_km(&self, from: Coordinate, to: Coordinate) -> Result<f64> {
        let key = self.api_key.as_deref().context("ORS_API_KEY is not configured")?;
        let url = format!("{}/v2/directions/driving-car", self.base_url.trim_end_matches('/'));
        // ORS expects [lon, lat]
        let body = json!({ "coordinates": [[from.lon, from.lat], [to.lon, to.lat]] });

        let res = self.client
            .post(&url)
            .header("Authorization", key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .context("ORS request failed")?;

        debug!(status = %res.status(), "ORS responded");
        if !res.status().is_success() {
            return Err(status_error("ORS", res).await);
        }

        let data: Value = res.json().await.context("ORS response is not JSON")?;
        let meters = data["features"][0]["properties"]["segments"][0]["distance"]
            .as_f64()
            .context("ORS response has no segment distance")?;

        Ok(meters / 1000.0)
    }
}

pub struct OsrmProvider {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OsrmProvider {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DistanceProvider for OsrmProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::SecondaryRouting
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn distance_km(&self, from: Coordinate, to: Coordinate) -> Result<f64> {
        let url = format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false",
            self.base_url.trim_end_matches('/'),
            from.lon, from.lat, to.lon, to.lat
        );

        let res = self.client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .context("OSRM request failed")?;

        debug!(status = %res.status(), "OSRM responded");
        if !res.status().is_success() {
            return Err(status_error("OSRM", res).await);
        }

        let data: Value = res.json().await.context("OSRM response is not JSON")?;
        let meters = data["routes"][0]["distance"]
            .as_f64()
            .context("OSRM response has no route distance")?;

        Ok(meters / 1000.0)
    }
}
