//! OurAirports dataset loader and read-only spatial index.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::Client;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::Deserialize;
use tracing::{info, warn};

use crate::models::{AirportCandidate, AirportSize, GeoPoint};

#[derive(Debug, Deserialize)]
struct AirportRow {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    latitude_deg: Option<f64>,
    longitude_deg: Option<f64>,
    #[serde(default)]
    scheduled_service: String,
    #[serde(default)]
    iata_code: String,
    #[serde(default)]
    icao_code: String,
    #[serde(default)]
    gps_code: String,
    #[serde(default)]
    ident: String,
}

impl AirportRow {
    fn into_candidate(self) -> Option<AirportCandidate> {
        let lat = self.latitude_deg?;
        let lon = self.longitude_deg?;
        let non_empty = |s: String| {
            let s = s.trim().to_string();
            (!s.is_empty()).then_some(s)
        };
        let icao = non_empty(self.icao_code)
            .or_else(|| non_empty(self.gps_code))
            .or_else(|| non_empty(self.ident).filter(|s| s.len() == 4));
        Some(AirportCandidate {
            name: self.name,
            iata: non_empty(self.iata_code),
            icao,
            lat,
            lon,
            size: AirportSize::parse(&self.kind),
            scheduled_service: self.scheduled_service.trim().eq_ignore_ascii_case("yes"),
        })
    }
}

/// Parse the CSV, keeping only eligible airports
pub fn parse_airports<R: Read>(reader: R) -> Result<Vec<AirportCandidate>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut airports = Vec::new();
    let mut bad_rows = 0usize;

    for row in csv_reader.deserialize::<AirportRow>() {
        match row {
            Ok(row) => {
                if let Some(candidate) = row.into_candidate().filter(|c| c.is_eligible()) {
                    airports.push(candidate);
                }
            }
            Err(_) => bad_rows += 1,
        }
    }

    if bad_rows > 0 {
        warn!("Skipped {} unreadable airport rows", bad_rows);
    }
    Ok(airports)
}

/// Load from a local CSV or `.csv.gz`, downloading it first when absent
pub async fn load_airports(client: &Client, path: &Path, url: &str) -> Result<Vec<AirportCandidate>> {
    if !path.exists() {
        info!("Downloading airport dataset from {}", url);
        let response = client
            .get(url)
            .send()
            .await
            .context("Failed to download airport dataset")?
            .error_for_status()
            .context("Airport dataset download failed")?;
        let bytes = response.bytes().await?;
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || persist_download(&target, &bytes))
            .await
            .context("Airport dataset write task failed")??;
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open airport dataset {}", path.display()))?;
    let reader = BufReader::new(file);

    let airports = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        parse_airports(GzDecoder::new(reader))?
    } else {
        parse_airports(reader)?
    };

    info!(
        "Loaded {} scheduled-service large/medium airports",
        airports.len()
    );
    Ok(airports)
}

/// Write through a sibling temp file; `path` only ever holds a complete download
fn persist_download(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

type IndexedAirport = GeomWithData<[f64; 2], usize>;

/// Read-only airport handle shared by every matching call
#[derive(Clone)]
pub struct AirportIndex {
    airports: Arc<Vec<AirportCandidate>>,
    tree: Arc<RTree<IndexedAirport>>,
}

impl AirportIndex {
    pub fn build(airports: Vec<AirportCandidate>) -> Self {
        let airports: Vec<AirportCandidate> =
            airports.into_iter().filter(|a| a.is_eligible()).collect();
        let tree = RTree::bulk_load(
            airports
                .iter()
                .enumerate()
                .map(|(i, a)| GeomWithData::new([a.lon, a.lat], i))
                .collect(),
        );
        Self {
            airports: Arc::new(airports),
            tree: Arc::new(tree),
        }
    }

    pub fn len(&self) -> usize {
        self.airports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.airports.is_empty()
    }

    /// Up to `k` nearest airports within `max_km`, sorted by crow-flies distance
    pub fn nearest_within(
        &self,
        origin: GeoPoint,
        max_km: f64,
        k: usize,
    ) -> Vec<(&AirportCandidate, f64)> {
        let dlat = max_km / 110.0;
        let dlon = max_km / (110.0 * origin.lat.to_radians().cos().abs().max(0.01));
        let envelope = AABB::from_corners(
            [origin.lon - dlon, origin.lat - dlat],
            [origin.lon + dlon, origin.lat + dlat],
        );

        let mut hits: Vec<(&AirportCandidate, f64)> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|item| {
                let airport = &self.airports[item.data];
                (airport, origin.distance_km(&airport.point()))
            })
            .filter(|(_, d)| *d <= max_km)
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.name.cmp(&b.0.name)));
        hits.truncate(k);
        hits
    }
}
