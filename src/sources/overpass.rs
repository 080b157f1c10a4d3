//! Overpass API client with mirror fallback and bbox tiling.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Feature, FeatureKind, FeatureSource, OsmType, SearchArea};
use crate::error::EnrichmentError;
use crate::perimeter::BBox;

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<RawElement>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawElement {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    Way {
        id: i64,
        center: Option<RawPosition>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    Relation {
        id: i64,
        center: Option<RawPosition>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawPosition {
    lat: f64,
    lon: f64,
}

impl RawElement {
    fn into_feature(self) -> Option<Feature> {
        let (osm_type, id, lat, lon, tags) = match self {
            RawElement::Node { id, lat, lon, tags } => (OsmType::Node, id, lat, lon, tags),
            RawElement::Way { id, center, tags } => {
                let c = center?;
                (OsmType::Way, id, c.lat, c.lon, tags)
            }
            RawElement::Relation { id, center, tags } => {
                let c = center?;
                (OsmType::Relation, id, c.lat, c.lon, tags)
            }
            RawElement::Other => return None,
        };
        Some(Feature {
            osm_type,
            id,
            lat,
            lon,
            tags,
        })
    }
}

/// Parse an Overpass JSON body into point features
pub fn parse_response(body: &str) -> Result<Vec<Feature>, EnrichmentError> {
    let response: OverpassResponse =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Parse(e.to_string()))?;
    Ok(response
        .elements
        .into_iter()
        .filter_map(RawElement::into_feature)
        .collect())
}

/// Overpass QL for one kind of feature in one area
pub fn build_query(kind: FeatureKind, area: &SearchArea) -> String {
    let filter = match area {
        SearchArea::Bounds(b) => format!("({},{},{},{})", b.south, b.west, b.north, b.east),
        SearchArea::Around { center, radius_km } => format!(
            "(around:{:.0},{},{})",
            radius_km * 1000.0,
            center.lat,
            center.lon
        ),
    };

    match kind {
        FeatureKind::Settlement {
            include_villages,
            require_population,
        } => {
            let places = if include_villages {
                "city|town|village"
            } else {
                "city|town"
            };
            let pop = if require_population {
                "[\"population\"]"
            } else {
                ""
            };
            format!(
                "[out:json][timeout:90];(node[\"place\"~\"^({p})$\"]{pop}{f};way[\"place\"~\"^({p})$\"]{pop}{f};relation[\"place\"~\"^({p})$\"]{pop}{f};);out center;",
                p = places,
                pop = pop,
                f = filter
            )
        }
        FeatureKind::Hospital => format!(
            "[out:json][timeout:60];(nwr[\"amenity\"=\"hospital\"]{f};nwr[\"healthcare\"=\"hospital\"]{f};);out center;",
            f = filter
        ),
        FeatureKind::Peak => format!(
            "[out:json][timeout:90];node[\"natural\"=\"peak\"][\"ele\"]{f};out;",
            f = filter
        ),
    }
}

/// Overpass client trying each mirror endpoint in order
pub struct OverpassClient {
    client: Client,
    endpoints: Vec<String>,
    retries_per_endpoint: u32,
    tile_deg: f64,
    tile_pause: Duration,
}

impl OverpassClient {
    pub fn new(client: Client, endpoints: Vec<String>, retries_per_endpoint: u32) -> Self {
        Self {
            client,
            endpoints,
            retries_per_endpoint: retries_per_endpoint.max(1),
            tile_deg: 1.0,
            tile_pause: Duration::from_millis(500),
        }
    }

    pub fn with_tile_deg(mut self, tile_deg: f64) -> Self {
        if tile_deg > 0.0 {
            self.tile_deg = tile_deg;
        }
        self
    }

    /// Run one query, falling back across mirrors
    async fn query(&self, query: &str) -> Result<Vec<Feature>, EnrichmentError> {
        let mut last_error = EnrichmentError::Status(0);

        for endpoint in &self.endpoints {
            let mut attempts = 0;
            while attempts < self.retries_per_endpoint {
                attempts += 1;
                match self.post(endpoint, query).await {
                    Ok(features) => return Ok(features),
                    Err(e) => {
                        warn!(
                            "Overpass {} failed (attempt {}/{}): {}",
                            endpoint, attempts, self.retries_per_endpoint, e
                        );
                        last_error = e;
                        if attempts < self.retries_per_endpoint {
                            tokio::time::sleep(Duration::from_millis(1500 * attempts as u64))
                                .await;
                        }
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn post(&self, endpoint: &str, query: &str) -> Result<Vec<Feature>, EnrichmentError> {
        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(encode_form_data(query))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EnrichmentError::from_status(response.status()));
        }
        let body = response.text().await?;
        parse_response(&body)
    }

    /// Tiled fetch over a bounding box; failing tiles are skipped
    async fn fetch_tiled(
        &self,
        kind: FeatureKind,
        bbox: &BBox,
    ) -> Result<Vec<Feature>, EnrichmentError> {
        let tiles = bbox.tiles(self.tile_deg);
        info!("Overpass: fetching {:?} over {} tiles", kind, tiles.len());

        let mut seen: HashSet<(String, i64, i64)> = HashSet::new();
        let mut features = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;

        for (i, tile) in tiles.iter().enumerate() {
            let query = build_query(kind, &SearchArea::Bounds(*tile));
            match self.query(&query).await {
                Ok(chunk) => {
                    debug!("Tile {}/{}: {} features", i + 1, tiles.len(), chunk.len());
                    for f in chunk {
                        if seen.insert(dedup_key(&f)) {
                            features.push(f);
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping Overpass tile {}/{}: {}", i + 1, tiles.len(), e);
                    failed += 1;
                    last_error = Some(e);
                }
            }
            if i + 1 < tiles.len() {
                tokio::time::sleep(self.tile_pause).await;
            }
        }

        if failed == tiles.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        info!(
            "Overpass: {} features ({} of {} tiles failed)",
            features.len(),
            failed,
            tiles.len()
        );
        Ok(features)
    }
}

/// Cross-tile identity: name plus coordinates rounded to 4 decimals
fn dedup_key(f: &Feature) -> (String, i64, i64) {
    (
        f.tags.get("name").cloned().unwrap_or_default(),
        (f.lat * 10_000.0).round() as i64,
        (f.lon * 10_000.0).round() as i64,
    )
}

fn encode_form_data(query: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("data", query)
        .finish()
}

#[async_trait]
impl FeatureSource for OverpassClient {
    fn name(&self) -> &str {
        "overpass"
    }

    async fn fetch(
        &self,
        kind: FeatureKind,
        area: &SearchArea,
    ) -> Result<Vec<Feature>, EnrichmentError> {
        match area {
            SearchArea::Bounds(bbox) => self.fetch_tiled(kind, bbox).await,
            SearchArea::Around { .. } => self.query(&build_query(kind, area)).await,
        }
    }
}
