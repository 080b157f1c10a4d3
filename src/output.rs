//! Record set writers: JSON (reloadable), flattened CSV and GeoJSON.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::PipelineResult;
use crate::models::{EnrichmentMethod, PlaceRecord};

pub const JSON_FILE: &str = "cities.json";
pub const CSV_FILE: &str = "cities.csv";
pub const GEOJSON_FILE: &str = "cities.geojson";

/// One flat CSV row per record
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    name: &'a str,
    country: Option<&'a str>,
    country_unresolved: bool,
    latitude: f64,
    longitude: f64,
    population: Option<u64>,
    source: String,
    elevation_m: Option<f64>,
    elevation_ft: Option<f64>,
    elevation_source: Option<String>,
    elevation_confidence: Option<u8>,
    distance_to_perimeter_km: Option<f64>,
    region: Option<&'a str>,
    hospital_in_city: Option<bool>,
    hospital_in_city_or_nearby: Option<bool>,
    hospital_nearest_name: Option<&'a str>,
    hospital_nearest_lat: Option<f64>,
    hospital_nearest_lon: Option<f64>,
    hospital_nearest_km: Option<f64>,
    hospital_driving_km: Option<f64>,
    hospital_driving_minutes: Option<f64>,
    hospital_confidence_pct: Option<u8>,
    hospital_reasoning: Option<&'a str>,
    hospital_method: Option<EnrichmentMethod>,
    hospital_error: Option<&'a str>,
    airport_nearest_name: Option<&'a str>,
    airport_nearest_iata: Option<&'a str>,
    airport_nearest_icao: Option<&'a str>,
    airport_nearest_lat: Option<f64>,
    airport_nearest_lon: Option<f64>,
    airport_crow_km: Option<f64>,
    airport_driving_km: Option<f64>,
    airport_driving_minutes: Option<f64>,
    airport_confidence_pct: Option<u8>,
    airport_reasoning: Option<&'a str>,
    airport_method: Option<EnrichmentMethod>,
    airport_error: Option<&'a str>,
    peaks_count: Option<usize>,
    peaks_names: Option<String>,
    peaks_error: Option<&'a str>,
}

impl<'a> CsvRow<'a> {
    fn from_record(r: &'a PlaceRecord) -> Self {
        let h = &r.hospital;
        let a = &r.airport;
        Self {
            name: &r.name,
            country: r.country.as_deref(),
            country_unresolved: r.country_unresolved,
            latitude: r.lat(),
            longitude: r.lon(),
            population: r.population,
            source: r.source.to_string(),
            elevation_m: r.elevation_m,
            elevation_ft: r.elevation_ft(),
            elevation_source: r.elevation_source.as_ref().map(ToString::to_string),
            elevation_confidence: r.elevation_confidence,
            distance_to_perimeter_km: r.distance_to_perimeter_km,
            region: r.region.as_deref(),
            hospital_in_city: h.in_city,
            hospital_in_city_or_nearby: h.in_city_or_nearby,
            hospital_nearest_name: h.nearest_name.as_deref(),
            hospital_nearest_lat: h.nearest_location.map(|p| p.lat),
            hospital_nearest_lon: h.nearest_location.map(|p| p.lon),
            hospital_nearest_km: h.nearest_km,
            hospital_driving_km: h.driving_km,
            hospital_driving_minutes: h.driving_minutes,
            hospital_confidence_pct: h.confidence_pct,
            hospital_reasoning: h.reasoning.as_deref(),
            hospital_method: h.method,
            hospital_error: h.error.as_deref(),
            airport_nearest_name: a.nearest_name.as_deref(),
            airport_nearest_iata: a.nearest_iata.as_deref(),
            airport_nearest_icao: a.nearest_icao.as_deref(),
            airport_nearest_lat: a.nearest_location.map(|p| p.lat),
            airport_nearest_lon: a.nearest_location.map(|p| p.lon),
            airport_crow_km: a.crow_km,
            airport_driving_km: a.driving_km,
            airport_driving_minutes: a.driving_minutes,
            airport_confidence_pct: a.confidence_pct,
            airport_reasoning: a.reasoning.as_deref(),
            airport_method: a.method,
            airport_error: a.error.as_deref(),
            peaks_count: r.peaks.count,
            peaks_names: r.peaks.names.as_ref().map(|n| n.join("; ")),
            peaks_error: r.peaks.error.as_deref(),
        }
    }
}

pub fn write_json(records: &[PlaceRecord], path: &Path) -> PipelineResult<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, records)?;
    Ok(())
}

pub fn read_json(path: &Path) -> PipelineResult<Vec<PlaceRecord>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn write_csv(records: &[PlaceRecord], path: &Path) -> PipelineResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(CsvRow::from_record(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Point FeatureCollection; properties are the record minus its coordinates
pub fn to_geojson(records: &[PlaceRecord]) -> PipelineResult<Value> {
    let mut features = Vec::with_capacity(records.len());
    for record in records {
        let mut properties = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut properties {
            map.remove("latitude");
            map.remove("longitude");
            if let Some(ft) = record.elevation_ft() {
                map.insert("elevation_ft".to_string(), json!(ft));
            }
        }
        features.push(json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [record.lon(), record.lat()]},
            "properties": properties,
        }));
    }
    Ok(json!({"type": "FeatureCollection", "features": features}))
}

pub fn write_geojson(records: &[PlaceRecord], path: &Path) -> PipelineResult<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, &to_geojson(records)?)?;
    Ok(())
}

/// Write all three formats into `dir`, returning the written paths
pub fn write_all(records: &[PlaceRecord], dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let json_path = dir.join(JSON_FILE);
    let csv_path = dir.join(CSV_FILE);
    let geojson_path = dir.join(GEOJSON_FILE);

    write_json(records, &json_path)?;
    write_csv(records, &csv_path)?;
    write_geojson(records, &geojson_path)?;

    info!("Wrote {} records to {}", records.len(), dir.display());
    Ok(vec![json_path, csv_path, geojson_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ElevationSource, GeoPoint, RecordSource};

    fn sample() -> Vec<PlaceRecord> {
        let mut innsbruck = PlaceRecord::new("Innsbruck", 47.2627, 11.3945, RecordSource::Merged)
            .with_country(Some("at"))
            .with_population(Some(132_493))
            .with_elevation(Some(574.0), ElevationSource::Geonames);
        innsbruck.hospital.in_city = Some(true);
        innsbruck.hospital.nearest_location = Some(GeoPoint::new(47.263, 11.386));
        innsbruck.peaks.count = Some(2);
        innsbruck.peaks.names = Some(vec!["Nockspitze".to_string(), "Patscherkofel".to_string()]);
        let bare = PlaceRecord::new("Lienz", 46.8297, 12.7693, RecordSource::Osm);
        vec![innsbruck, bare]
    }

    #[test]
    fn test_json_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JSON_FILE);
        let records = sample();
        write_json(&records, &path).unwrap();
        assert_eq!(read_json(&path).unwrap(), records);
    }

    #[test]
    fn test_csv_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CSV_FILE);
        write_csv(&sample(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);

        let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
        assert_eq!(&rows[0][col("country")], "AT");
        assert_eq!(&rows[0][col("elevation_ft")], "1883.2");
        assert_eq!(&rows[0][col("hospital_in_city")], "true");
        assert_eq!(&rows[0][col("hospital_nearest_lat")], "47.263");
        assert_eq!(&rows[0][col("peaks_names")], "Nockspitze; Patscherkofel");
        assert_eq!(&rows[1][col("population")], "");
        assert_eq!(&rows[1][col("source")], "osm");
    }

    #[test]
    fn test_geojson_points_are_lon_lat() {
        let collection = to_geojson(&sample()).unwrap();
        let first = &collection["features"][0];
        assert_eq!(first["geometry"]["coordinates"][0], 11.3945);
        assert_eq!(first["geometry"]["coordinates"][1], 47.2627);
        assert_eq!(first["properties"]["name"], "Innsbruck");
        assert!(first["properties"].get("latitude").is_none());
    }

    #[test]
    fn test_write_all_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("alps");
        let paths = write_all(&sample(), &out).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.exists()));
    }
}
