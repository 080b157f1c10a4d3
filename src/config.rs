//! TOML run configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub elevation: ElevationConfig,
    #[serde(default)]
    pub hospitals: HospitalConfig,
    #[serde(default)]
    pub peaks: PeaksConfig,
    #[serde(default)]
    pub airports: AirportConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub credentials: Credentials,
    /// ISO code -> [west, south, east, north]
    #[serde(default)]
    pub country_boxes: BTreeMap<String, [f64; 4]>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub discord_webhook: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from("data/cache"),
            output_dir: PathBuf::from("data/output"),
            user_agent: format!("cordillera/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 60,
            discord_webhook: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegionConfig {
    pub name: String,
    pub slug: String,
    pub countries: Vec<String>,
    #[serde(default)]
    pub excluded_countries: Vec<String>,
    #[serde(default)]
    pub perimeter_geojson: Option<PathBuf>,
    #[serde(default = "default_min_population")]
    pub min_population: u64,
    /// Drop OSM settlements without a population tag at fetch time
    #[serde(default)]
    pub require_osm_population: bool,
    /// Also fetch `place=village`
    #[serde(default)]
    pub include_villages: bool,
    #[serde(default = "default_tile_deg")]
    pub overpass_tile_deg: f64,
}

fn default_min_population() -> u64 {
    5000
}

fn default_tile_deg() -> f64 {
    1.0
}

impl RegionConfig {
    /// Built-in region definitions
    pub fn builtin(slug: &str) -> Option<Self> {
        let (name, countries, excluded): (&str, &[&str], &[&str]) = match slug {
            "alps" => ("Alps", &["AT", "FR", "IT", "DE", "CH"], &["SI", "LI"]),
            "pyrenees" => ("Pyrenees", &["FR", "ES", "AD"], &[]),
            "rockies" => ("Rocky Mountains", &["US", "CA"], &[]),
            "sierra_nevada" => ("Sierra Nevada", &["US", "MX"], &[]),
            "cascade_range" => ("Cascade Range", &["US", "CA"], &[]),
            "coast_mountains" => ("Coast Mountains", &["US", "CA"], &[]),
            _ => return None,
        };
        let to_vec = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Some(Self {
            name: name.to_string(),
            slug: slug.to_string(),
            countries: to_vec(countries),
            excluded_countries: to_vec(excluded),
            perimeter_geojson: None,
            min_population: default_min_population(),
            require_osm_population: false,
            include_villages: false,
            overpass_tile_deg: default_tile_deg(),
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    /// GeoNames is the required primary source when enabled
    pub use_geonames: bool,
    pub use_overpass: bool,
    pub geonames_url: String,
    pub geonames_page_pause_ms: u64,
    pub overpass_endpoints: Vec<String>,
    pub overpass_retries: u32,
    /// Local OSM extract used instead of Overpass for settlements, hospitals and peaks
    pub pbf_path: Option<PathBuf>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            use_geonames: true,
            use_overpass: true,
            geonames_url: "http://api.geonames.org/searchJSON".to_string(),
            geonames_page_pause_ms: 1000,
            overpass_endpoints: vec![
                "https://overpass-api.de/api/interpreter".to_string(),
                "https://overpass.kumi.systems/api/interpreter".to_string(),
                "https://overpass.openstreetmap.ru/api/interpreter".to_string(),
                "https://overpass.nchc.org.tw/api/interpreter".to_string(),
            ],
            overpass_retries: 2,
            pbf_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DedupeConfig {
    pub proximity_km: f64,
    /// Jaro-Winkler similarity for fuzzy name matches
    pub fuzzy_threshold: f64,
    pub fuzzy_proximity_km: f64,
    /// Keep survivors whose population stayed unknown after merging
    pub keep_unknown_population: bool,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            proximity_km: 5.0,
            fuzzy_threshold: 0.92,
            fuzzy_proximity_km: 2.0,
            keep_unknown_population: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ElevationConfig {
    pub skip: bool,
    pub batch_size: usize,
    /// Provider order; unknown names are ignored with a warning
    pub providers: Vec<String>,
    pub opentopo_url: String,
    pub google_url: String,
    pub open_elevation_url: String,
    pub pause_ms: u64,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            skip: false,
            batch_size: 100,
            providers: vec![
                "opentopo".to_string(),
                "google".to_string(),
                "open_elevation".to_string(),
            ],
            opentopo_url: "https://api.opentopodata.org/v1/aster30m".to_string(),
            google_url: "https://maps.googleapis.com/maps/api/elevation/json".to_string(),
            open_elevation_url: "https://api.open-elevation.com/api/v1/lookup".to_string(),
            pause_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HospitalMode {
    Offline,
    WebSearch,
    Hybrid,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HospitalConfig {
    pub enabled: bool,
    pub mode: HospitalMode,
    pub search_radius_km: f64,
    pub in_city_radius_km: f64,
    pub nearby_radius_km: f64,
    pub use_routing: bool,
    pub concurrency: usize,
}

impl Default for HospitalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: HospitalMode::Offline,
            search_radius_km: 50.0,
            in_city_radius_km: 5.0,
            nearby_radius_km: 25.0,
            use_routing: false,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PeaksConfig {
    pub enabled: bool,
    pub radius_km: f64,
    pub min_height_diff_m: f64,
}

impl Default for PeaksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius_km: 30.0,
            min_height_diff_m: 1200.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AirportMode {
    Offline,
    WebSearch,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AirportConfig {
    pub enabled: bool,
    pub mode: AirportMode,
    pub top_k: usize,
    pub max_radius_km: f64,
    pub dataset_url: String,
    /// Local CSV (optionally gzipped); downloaded from `dataset_url` when absent
    pub dataset_path: Option<PathBuf>,
    pub concurrency: usize,
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub backoff_multiplier: f64,
    pub jitter_secs: f64,
}

impl Default for AirportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AirportMode::Offline,
            top_k: 3,
            max_radius_km: 400.0,
            dataset_url: "https://davidmegginson.github.io/ourairports-data/airports.csv"
                .to_string(),
            dataset_path: None,
            concurrency: 4,
            max_retries: 2,
            initial_backoff_secs: 2.0,
            backoff_multiplier: 2.0,
            jitter_secs: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RoutingConfig {
    pub osrm_url: String,
    pub timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            osrm_url: "https://router.project-osrm.org".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebSearchConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Source links appended to reasoning
    pub max_links: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/responses".to_string(),
            model: "gpt-5".to_string(),
            timeout_secs: 60,
            max_links: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Credentials {
    pub geonames_username: Option<String>,
    pub google_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Credentials {
    /// Fill unset credentials from the environment
    pub fn apply_env(&mut self) {
        fn from_env(slot: &mut Option<String>, var: &str) {
            if slot.as_deref().map_or(true, str::is_empty) {
                *slot = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
            }
        }
        from_env(&mut self.geonames_username, "GEONAMES_USERNAME");
        from_env(&mut self.google_api_key, "GOOGLE_API_KEY");
        from_env(&mut self.openai_api_key, "OPENAI_API_KEY");
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Config with only built-in regions and defaults everywhere else
    pub fn with_builtin_regions(slugs: &[&str]) -> Self {
        Self {
            global: GlobalConfig::default(),
            regions: slugs.iter().filter_map(|s| RegionConfig::builtin(s)).collect(),
            sources: SourcesConfig::default(),
            dedupe: DedupeConfig::default(),
            elevation: ElevationConfig::default(),
            hospitals: HospitalConfig::default(),
            peaks: PeaksConfig::default(),
            airports: AirportConfig::default(),
            routing: RoutingConfig::default(),
            web_search: WebSearchConfig::default(),
            credentials: Credentials::default(),
            country_boxes: BTreeMap::new(),
        }
    }

    pub fn region(&self, slug: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.slug == slug)
    }

    /// Hash of the settings that shape a region's stage artifacts
    pub fn fingerprint(&self, region: &RegionConfig) -> u64 {
        #[derive(Serialize)]
        struct Effective<'a> {
            region: &'a RegionConfig,
            sources: &'a SourcesConfig,
            dedupe: &'a DedupeConfig,
            country_boxes: &'a BTreeMap<String, [f64; 4]>,
        }
        let effective = Effective {
            region,
            sources: &self.sources,
            dedupe: &self.dedupe,
            country_boxes: &self.country_boxes,
        };
        let bytes = serde_json::to_vec(&effective).unwrap_or_default();
        xxh64(&bytes, 0)
    }
}
