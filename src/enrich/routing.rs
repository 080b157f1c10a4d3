//! Driving distance/time via a routing engine.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::error::EnrichmentError;
use crate::models::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub distance_km: f64,
    pub duration_min: f64,
}

#[async_trait]
pub trait RoutingEngine: Send + Sync {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<Route, EnrichmentError>;
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    /// metres
    distance: f64,
    /// seconds
    duration: f64,
}

/// Parse an OSRM `route` response body
pub fn parse_osrm(body: &str) -> Result<Route, EnrichmentError> {
    let response: OsrmResponse =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Parse(e.to_string()))?;
    if response.code != "Ok" {
        return Err(EnrichmentError::NoRoute);
    }
    let route = response.routes.first().ok_or(EnrichmentError::NoRoute)?;
    Ok(Route {
        distance_km: route.distance / 1000.0,
        duration_min: route.duration / 60.0,
    })
}

/// OSRM HTTP client (`/route/v1/driving`)
pub struct OsrmClient {
    client: Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn route_url(&self, from: GeoPoint, to: GeoPoint) -> Result<Url, EnrichmentError> {
        let mut url = Url::parse(&format!(
            "{}/route/v1/driving/{:.6},{:.6};{:.6},{:.6}",
            self.base_url, from.lon, from.lat, to.lon, to.lat
        ))
        .map_err(|e| EnrichmentError::Parse(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("overview", "false")
            .append_pair("alternatives", "false");
        Ok(url)
    }
}

#[async_trait]
impl RoutingEngine for OsrmClient {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<Route, EnrichmentError> {
        let response = self.client.get(self.route_url(from, to)?).send().await?;
        if !response.status().is_success() {
            return Err(EnrichmentError::from_status(response.status()));
        }
        let body = response.text().await?;
        parse_osrm(&body)
    }
}
