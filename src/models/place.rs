//! Place record flowing through the reconciliation and enrichment pipeline.

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which upstream provider a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Geonames,
    Osm,
    /// Survivor of a duplicate cluster with more than one member
    Merged,
}

impl RecordSource {
    /// Rank used by dedup winner selection (lower wins)
    pub fn priority(&self) -> u8 {
        match self {
            RecordSource::Geonames => 0,
            RecordSource::Merged => 1,
            RecordSource::Osm => 2,
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::Geonames => write!(f, "geonames"),
            RecordSource::Osm => write!(f, "osm"),
            RecordSource::Merged => write!(f, "merged"),
        }
    }
}

/// Where an elevation value came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationSource {
    /// `ele` tag on the OSM feature
    Osm,
    /// GeoNames `elevation` attribute
    Geonames,
    /// Named elevation provider from the fallback chain
    Provider(String),
}

impl fmt::Display for ElevationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElevationSource::Osm => write!(f, "osm"),
            ElevationSource::Geonames => write!(f, "geonames"),
            ElevationSource::Provider(name) => write!(f, "{}", name),
        }
    }
}

/// Geographic point (lat/lon, WGS84 degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn to_point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        Haversine.distance(self.to_point(), other.to_point()) / 1000.0
    }
}

/// Which strategy produced a hospital or airport answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMethod {
    Offline,
    WebSearch,
}

impl fmt::Display for EnrichmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentMethod::Offline => write!(f, "offline"),
            EnrichmentMethod::WebSearch => write!(f, "web_search"),
        }
    }
}

/// Nearest-hospital attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HospitalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_city: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_city_or_nearby: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driving_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driving_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<EnrichmentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HospitalInfo {
    /// A previous run produced an answer without error
    pub fn is_complete(&self) -> bool {
        self.in_city.is_some() && self.error.is_none()
    }
}

/// Nearest-international-airport attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AirportInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_iata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_icao: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crow_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driving_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driving_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<EnrichmentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AirportInfo {
    pub fn is_complete(&self) -> bool {
        self.nearest_name.is_some() && self.error.is_none()
    }

    /// Explicit failure: every airport field null plus an error string
    pub fn failed(error: impl Into<String>, method: EnrichmentMethod) -> Self {
        Self {
            method: Some(method),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A peak that rises sufficiently above a city
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPeak {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
    pub distance_km: f64,
}

/// Nearby-higher-peaks attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeaksInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Names ordered by elevation, highest first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peaks: Option<Vec<NearbyPeak>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Canonical unit of the pipeline.
///
/// Coordinates are fixed at construction and only readable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub name: String,

    /// ISO 3166-1 alpha-2, upper case
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    /// Set when country inference could not pick a single country
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub country_unresolved: bool,

    latitude: f64,
    longitude: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub population: Option<u64>,

    pub source: RecordSource,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_source: Option<ElevationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_confidence: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_perimeter_km: Option<f64>,

    /// Only set when regions are combined after their pipelines complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default)]
    pub hospital: HospitalInfo,
    #[serde(default)]
    pub airport: AirportInfo,
    #[serde(default)]
    pub peaks: PeaksInfo,
}

impl PlaceRecord {
    /// Create a new record with minimal required fields
    pub fn new(name: impl Into<String>, lat: f64, lon: f64, source: RecordSource) -> Self {
        Self {
            name: name.into(),
            country: None,
            country_unresolved: false,
            latitude: lat,
            longitude: lon,
            population: None,
            source,
            elevation_m: None,
            elevation_source: None,
            elevation_confidence: None,
            distance_to_perimeter_km: None,
            region: None,
            hospital: HospitalInfo::default(),
            airport: AirportInfo::default(),
            peaks: PeaksInfo::default(),
        }
    }

    pub fn lat(&self) -> f64 {
        self.latitude
    }

    pub fn lon(&self) -> f64 {
        self.longitude
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Set country from a raw provider value, ignoring blanks
    pub fn with_country(mut self, code: Option<&str>) -> Self {
        self.country = code
            .map(|c| c.trim().to_uppercase())
            .filter(|c| c.len() == 2);
        self
    }

    pub fn with_population(mut self, population: Option<u64>) -> Self {
        self.population = population;
        self
    }

    /// Attach a source-provided elevation with its static confidence
    pub fn with_elevation(mut self, elevation_m: Option<f64>, source: ElevationSource) -> Self {
        if let Some(ele) = elevation_m {
            self.elevation_m = Some(ele);
            self.elevation_source = Some(source);
            self.elevation_confidence = Some(100);
        }
        self
    }

    pub fn elevation_ft(&self) -> Option<f64> {
        self.elevation_m.map(|m| (m * 3.28084 * 10.0).round() / 10.0)
    }
}
