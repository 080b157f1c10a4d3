//! GeoNames `searchJSON` client for populated places.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{EnrichmentError, PipelineError, PipelineResult};
use crate::models::{ElevationSource, PlaceRecord, RecordSource};

const PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    total_results_count: u64,
    #[serde(default)]
    geonames: Vec<GeoNameRow>,
    /// Present when the account is throttled or invalid
    status: Option<GeoNamesStatus>,
}

#[derive(Debug, Deserialize)]
struct GeoNamesStatus {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoNameRow {
    name: Option<String>,
    toponym_name: Option<String>,
    country_code: Option<String>,
    lat: Option<String>,
    lng: Option<String>,
    population: Option<serde_json::Value>,
    elevation: Option<serde_json::Value>,
}

impl GeoNameRow {
    /// Rows without a name, country or parseable coordinates are skipped
    fn into_record(self) -> Option<PlaceRecord> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .or(self.toponym_name)?;
        let country = self.country_code.filter(|c| !c.trim().is_empty())?;
        let lat: f64 = self.lat?.trim().parse().ok()?;
        let lon: f64 = self.lng?.trim().parse().ok()?;
        let population = self.population.as_ref().and_then(value_as_u64);
        let elevation = self.elevation.as_ref().and_then(value_as_f64);

        Some(
            PlaceRecord::new(name, lat, lon, RecordSource::Geonames)
                .with_country(Some(&country))
                .with_population(population)
                .with_elevation(elevation, ElevationSource::Geonames),
        )
    }
}

fn value_as_u64(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Paginated GeoNames fetcher
pub struct GeoNamesClient {
    client: Client,
    base_url: String,
    username: String,
    page_pause: Duration,
}

impl GeoNamesClient {
    /// A missing username is a configuration error: GeoNames is the required source
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        username: Option<&str>,
        page_pause: Duration,
    ) -> PipelineResult<Self> {
        let username = username
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PipelineError::config(
                    "GeoNames username missing: set credentials.geonames_username or GEONAMES_USERNAME",
                )
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            username: username.to_string(),
            page_pause,
        })
    }

    fn page_url(&self, country: &str, min_population: u64, start_row: u64) -> PipelineResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PipelineError::config(format!("bad GeoNames URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("featureClass", "P")
            .append_pair("country", country)
            .append_pair("orderby", "population")
            .append_pair("maxRows", &PAGE_SIZE.to_string())
            .append_pair("startRow", &start_row.to_string())
            .append_pair("minPopulation", &min_population.to_string())
            .append_pair("username", &self.username);
        Ok(url)
    }

    async fn fetch_page(&self, url: Url) -> Result<SearchResponse, EnrichmentError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(EnrichmentError::from_status(response.status()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| EnrichmentError::Parse(e.to_string()))
    }

    /// All populated places of one country, largest first
    pub async fn fetch_country(
        &self,
        country: &str,
        min_population: u64,
    ) -> Result<Vec<PlaceRecord>, EnrichmentError> {
        let mut records = Vec::new();
        let mut start_row = 0u64;
        let mut skipped = 0usize;

        loop {
            let url = self
                .page_url(country, min_population, start_row)
                .map_err(|e| EnrichmentError::Parse(e.to_string()))?;
            let page = self.fetch_page(url).await?;

            if let Some(status) = page.status {
                return Err(EnrichmentError::Parse(format!(
                    "GeoNames: {}",
                    status.message
                )));
            }

            let rows = page.geonames.len();
            for row in page.geonames {
                match row.into_record() {
                    Some(r) => records.push(r),
                    None => skipped += 1,
                }
            }
            debug!(
                "GeoNames {}: page at {} returned {} rows (total {})",
                country, start_row, rows, page.total_results_count
            );

            start_row += PAGE_SIZE as u64;
            if rows == 0 || start_row >= page.total_results_count {
                break;
            }
            tokio::time::sleep(self.page_pause).await;
        }

        if skipped > 0 {
            warn!("GeoNames {}: skipped {} malformed rows", country, skipped);
        }
        Ok(records)
    }

    /// Fetch every country; fails only when no country could be fetched at all
    pub async fn fetch_all(
        &self,
        countries: &[String],
        min_population: u64,
    ) -> PipelineResult<Vec<PlaceRecord>> {
        let mut all = Vec::new();
        let mut failures = Vec::new();

        for country in countries {
            match self.fetch_country(country, min_population).await {
                Ok(records) => {
                    info!("GeoNames {}: {} places", country, records.len());
                    all.extend(records);
                }
                Err(e) => {
                    warn!("GeoNames {} failed: {}", country, e);
                    failures.push(format!("{}: {}", country, e));
                }
            }
        }

        if !countries.is_empty() && failures.len() == countries.len() {
            return Err(PipelineError::unavailable("geonames", failures.join("; ")));
        }
        Ok(all)
    }
}
