//! Elevation fallback chain.
//!
//! Providers are tried in order for the records still missing an elevation.
//! A failed batch counts as "no data" for that batch only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Credentials, ElevationConfig};
use crate::error::EnrichmentError;
use crate::models::{ElevationSource, GeoPoint, PlaceRecord};

/// One elevation data provider
#[async_trait]
pub trait ElevationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Static reporting confidence (0-100)
    fn confidence(&self) -> u8;

    /// Largest batch the provider accepts
    fn max_batch(&self) -> usize {
        100
    }

    /// One answer per input coordinate, `None` where the provider has no data
    async fn query(&self, coords: &[GeoPoint]) -> Result<Vec<Option<f64>>, EnrichmentError>;
}

fn pipe_locations(coords: &[GeoPoint]) -> String {
    coords
        .iter()
        .map(|c| format!("{:.6},{:.6}", c.lat, c.lon))
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    results: Vec<LookupResult>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    elevation: Option<f64>,
}

async fn send_lookup(request: reqwest::RequestBuilder) -> Result<LookupResponse, EnrichmentError> {
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(EnrichmentError::from_status(response.status()));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| EnrichmentError::Parse(e.to_string()))
}

/// OpenTopoData (ASTER 30m dataset by default)
pub struct OpenTopoData {
    client: Client,
    url: String,
}

impl OpenTopoData {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ElevationProvider for OpenTopoData {
    fn name(&self) -> &str {
        "opentopo"
    }

    fn confidence(&self) -> u8 {
        90
    }

    async fn query(&self, coords: &[GeoPoint]) -> Result<Vec<Option<f64>>, EnrichmentError> {
        let mut url = Url::parse(&self.url).map_err(|e| EnrichmentError::Parse(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("locations", &pipe_locations(coords));
        let response = send_lookup(self.client.get(url)).await?;
        if let Some(status) = response.status.as_deref() {
            if status != "OK" {
                return Err(EnrichmentError::Parse(format!("opentopo status {}", status)));
            }
        }
        Ok(response.results.into_iter().map(|r| r.elevation).collect())
    }
}

/// Google Maps Elevation API; needs a key
pub struct GoogleElevation {
    client: Client,
    url: String,
    api_key: String,
}

impl GoogleElevation {
    pub fn new(client: Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ElevationProvider for GoogleElevation {
    fn name(&self) -> &str {
        "google"
    }

    fn confidence(&self) -> u8 {
        95
    }

    fn max_batch(&self) -> usize {
        256
    }

    async fn query(&self, coords: &[GeoPoint]) -> Result<Vec<Option<f64>>, EnrichmentError> {
        let mut url = Url::parse(&self.url).map_err(|e| EnrichmentError::Parse(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("locations", &pipe_locations(coords))
            .append_pair("key", &self.api_key);
        let response = send_lookup(self.client.get(url)).await?;
        match response.status.as_deref() {
            Some("OK") | None => {}
            Some("OVER_QUERY_LIMIT") => return Err(EnrichmentError::RateLimited),
            Some(other) => return Err(EnrichmentError::Parse(format!("google status {}", other))),
        }
        Ok(response.results.into_iter().map(|r| r.elevation).collect())
    }
}

#[derive(Debug, Serialize)]
struct Location {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Serialize)]
struct OpenElevationRequest {
    locations: Vec<Location>,
}

/// Open-Elevation (SRTM-derived)
pub struct OpenElevation {
    client: Client,
    url: String,
}

impl OpenElevation {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ElevationProvider for OpenElevation {
    fn name(&self) -> &str {
        "open_elevation"
    }

    fn confidence(&self) -> u8 {
        85
    }

    async fn query(&self, coords: &[GeoPoint]) -> Result<Vec<Option<f64>>, EnrichmentError> {
        let request = OpenElevationRequest {
            locations: coords
                .iter()
                .map(|c| Location {
                    latitude: c.lat,
                    longitude: c.lon,
                })
                .collect(),
        };
        let response = send_lookup(self.client.post(&self.url).json(&request)).await?;
        Ok(response.results.into_iter().map(|r| r.elevation).collect())
    }
}

/// Build the configured provider chain; Google is left out without a key
pub fn providers_from_config(
    client: &Client,
    config: &ElevationConfig,
    credentials: &Credentials,
) -> Vec<Box<dyn ElevationProvider>> {
    let mut providers: Vec<Box<dyn ElevationProvider>> = Vec::new();
    for name in &config.providers {
        match name.as_str() {
            "opentopo" => providers.push(Box::new(OpenTopoData::new(
                client.clone(),
                &config.opentopo_url,
            ))),
            "google" => match credentials.google_api_key.as_deref() {
                Some(key) => providers.push(Box::new(GoogleElevation::new(
                    client.clone(),
                    &config.google_url,
                    key,
                ))),
                None => info!("No Google API key, skipping google elevation provider"),
            },
            "open_elevation" => providers.push(Box::new(OpenElevation::new(
                client.clone(),
                &config.open_elevation_url,
            ))),
            other => warn!("Unknown elevation provider '{}' ignored", other),
        }
    }
    providers
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ElevationReport {
    pub missing_before: usize,
    /// (provider, records filled)
    pub filled_by: Vec<(String, usize)>,
    pub failed_batches: usize,
    pub still_missing: usize,
}

pub struct ElevationEnricher {
    providers: Vec<Box<dyn ElevationProvider>>,
    batch_size: usize,
    pause: Duration,
}

impl ElevationEnricher {
    pub fn new(providers: Vec<Box<dyn ElevationProvider>>, batch_size: usize, pause: Duration) -> Self {
        Self {
            providers,
            batch_size: batch_size.max(1),
            pause,
        }
    }

    /// Fill missing elevations; never fails the pipeline
    pub async fn enrich(&self, records: &mut [PlaceRecord]) -> ElevationReport {
        let mut missing: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.elevation_m.is_none())
            .map(|(i, _)| i)
            .collect();

        let mut report = ElevationReport {
            missing_before: missing.len(),
            ..ElevationReport::default()
        };
        info!("Elevation: {} records missing elevation", missing.len());

        for provider in &self.providers {
            if missing.is_empty() {
                break;
            }
            let batch_size = self.batch_size.min(provider.max_batch()).max(1);
            let mut filled = 0usize;

            let batches: Vec<Vec<usize>> = missing.chunks(batch_size).map(<[usize]>::to_vec).collect();
            for (n, batch) in batches.iter().enumerate() {
                let coords: Vec<GeoPoint> = batch.iter().map(|&i| records[i].point()).collect();

                match provider.query(&coords).await {
                    Ok(values) if values.len() == coords.len() => {
                        for (&i, value) in batch.iter().zip(values) {
                            if let Some(ele) = value.filter(|v| v.is_finite()) {
                                let record = &mut records[i];
                                record.elevation_m = Some(ele);
                                record.elevation_source =
                                    Some(ElevationSource::Provider(provider.name().to_string()));
                                record.elevation_confidence = Some(provider.confidence());
                                filled += 1;
                            }
                        }
                    }
                    Ok(values) => {
                        warn!(
                            "{} returned {} values for {} coordinates; ignoring batch",
                            provider.name(),
                            values.len(),
                            coords.len()
                        );
                        report.failed_batches += 1;
                    }
                    Err(e) => {
                        warn!("{} batch failed: {}", provider.name(), e);
                        report.failed_batches += 1;
                    }
                }

                if n + 1 < batches.len() && !self.pause.is_zero() {
                    tokio::time::sleep(self.pause).await;
                }
            }

            debug!("{} filled {} elevations", provider.name(), filled);
            report.filled_by.push((provider.name().to_string(), filled));
            missing.retain(|&i| records[i].elevation_m.is_none());
        }

        report.still_missing = missing.len();
        info!(
            "Elevation: filled {:?}, {} still missing",
            report.filled_by, report.still_missing
        );
        report
    }
}
