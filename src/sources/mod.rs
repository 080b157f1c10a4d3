//! Source fetchers.
//!
//! Each fetcher talks to one external provider and normalizes its rows to
//! `PlaceRecord` or to tagged point `Feature`s. Fetchers are independent.

pub mod geonames;
pub mod ourairports;
pub mod overpass;
pub mod pbf;

pub use geonames::GeoNamesClient;
pub use ourairports::{load_airports, AirportIndex};
pub use overpass::OverpassClient;
pub use pbf::PbfFeatureSource;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EnrichmentError;
use crate::models::{ElevationSource, GeoPoint, PlaceRecord, RecordSource};
use crate::perimeter::BBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsmType {
    Node,
    Way,
    Relation,
}

/// What to look for in the spatial data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Settlement {
        include_villages: bool,
        require_population: bool,
    },
    Hospital,
    Peak,
}

impl FeatureKind {
    /// Tag test shared by the offline extract reader
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            FeatureKind::Settlement {
                include_villages,
                require_population,
            } => {
                let place_ok = match tags.get("place").map(String::as_str) {
                    Some("city") | Some("town") => true,
                    Some("village") => *include_villages,
                    _ => false,
                };
                place_ok && (!require_population || tags.contains_key("population"))
            }
            FeatureKind::Hospital => {
                tags.get("amenity").map(String::as_str) == Some("hospital")
                    || tags.get("healthcare").map(String::as_str) == Some("hospital")
            }
            FeatureKind::Peak => {
                tags.get("natural").map(String::as_str) == Some("peak") && tags.contains_key("ele")
            }
        }
    }
}

/// Area of a spatial fetch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchArea {
    Around { center: GeoPoint, radius_km: f64 },
    Bounds(BBox),
}

impl SearchArea {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self {
            SearchArea::Around { center, radius_km } => {
                center.distance_km(&GeoPoint::new(lat, lon)) <= *radius_km
            }
            SearchArea::Bounds(b) => b.contains(lat, lon),
        }
    }
}

/// Tagged point feature (ways and relations reduced to their centre)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub osm_type: OsmType,
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub tags: BTreeMap<String, String>,
}

impl Feature {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    pub fn name(&self) -> Option<&str> {
        self.tags
            .get("name")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn population(&self) -> Option<u64> {
        self.tags.get("population").and_then(|v| parse_population(v))
    }

    /// `ele`, falling back to `height`
    pub fn elevation_m(&self) -> Option<f64> {
        self.tags
            .get("ele")
            .and_then(|v| parse_elevation(v))
            .or_else(|| self.tags.get("height").and_then(|v| parse_elevation(v)))
    }

    pub fn country(&self) -> Option<&str> {
        ["addr:country", "is_in:country_code", "ISO3166-1"]
            .iter()
            .find_map(|k| self.tags.get(*k))
            .map(String::as_str)
    }

    /// Normalize a settlement feature; features without a name are dropped
    pub fn to_place_record(&self) -> Option<PlaceRecord> {
        let name = self.name()?;
        Some(
            PlaceRecord::new(name, self.lat, self.lon, RecordSource::Osm)
                .with_country(self.country())
                .with_population(self.population())
                .with_elevation(self.elevation_m(), ElevationSource::Osm),
        )
    }
}

/// "12 345" and "12,345" both parse as 12345
pub fn parse_population(raw: &str) -> Option<u64> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '\'')
        .collect();
    digits.parse().ok()
}

/// Accepts "1035", "1035.5" and "1035 m"
pub fn parse_elevation(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.trim_end_matches('m').replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Spatial data source for settlements, hospitals and peaks
#[async_trait]
pub trait FeatureSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        kind: FeatureKind,
        area: &SearchArea,
    ) -> Result<Vec<Feature>, EnrichmentError>;
}
