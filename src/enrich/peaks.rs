//! Peaks that rise well above a city, within a radius of its centroid.

use std::fmt;

use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use tracing::{info, warn};

use crate::config::PeaksConfig;
use crate::error::EnrichmentError;
use crate::models::{GeoPoint, NearbyPeak, PeaksInfo, PlaceRecord};
use crate::perimeter::BBox;
use crate::sources::{Feature, FeatureKind, FeatureSource, SearchArea};

#[derive(Debug, Clone)]
struct Peak {
    name: String,
    point: GeoPoint,
    elevation_m: f64,
}

/// Peaks of one region, fetched once and shared by every record
pub struct PeakIndex {
    peaks: Vec<Peak>,
    tree: RTree<GeomWithData<[f64; 2], usize>>,
}

impl PeakIndex {
    /// Peaks without a usable elevation are dropped
    pub fn from_features(features: Vec<Feature>) -> Self {
        let peaks: Vec<Peak> = features
            .into_iter()
            .filter_map(|f| {
                let elevation_m = f.elevation_m()?;
                Some(Peak {
                    name: f.name().unwrap_or("unnamed peak").to_string(),
                    point: f.point(),
                    elevation_m,
                })
            })
            .collect();
        let tree = RTree::bulk_load(
            peaks
                .iter()
                .enumerate()
                .map(|(i, p)| GeomWithData::new([p.point.lon, p.point.lat], i))
                .collect(),
        );
        Self { peaks, tree }
    }

    /// Fetch every peak in the region bounds widened by the search radius
    pub async fn fetch(
        source: &dyn FeatureSource,
        bounds: BBox,
        radius_km: f64,
    ) -> Result<Self, EnrichmentError> {
        let area = SearchArea::Bounds(bounds.expand_km(radius_km));
        let features = source.fetch(FeatureKind::Peak, &area).await?;
        let index = Self::from_features(features);
        info!("Peaks: indexed {} peaks from {}", index.len(), source.name());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Peaks within `radius_km` at least `min_diff_m` above `city_elevation_m`,
    /// highest first
    pub fn higher_peaks(
        &self,
        origin: GeoPoint,
        city_elevation_m: f64,
        radius_km: f64,
        min_diff_m: f64,
    ) -> Vec<NearbyPeak> {
        let dlat = radius_km / 110.0;
        let dlon = radius_km / (110.0 * origin.lat.to_radians().cos().abs().max(0.01));
        let envelope = AABB::from_corners(
            [origin.lon - dlon, origin.lat - dlat],
            [origin.lon + dlon, origin.lat + dlat],
        );

        let mut found: Vec<NearbyPeak> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|item| &self.peaks[item.data])
            .filter(|p| p.elevation_m - city_elevation_m >= min_diff_m)
            .filter_map(|p| {
                let distance_km = origin.distance_km(&p.point);
                (distance_km <= radius_km).then(|| NearbyPeak {
                    name: p.name.clone(),
                    lat: p.point.lat,
                    lon: p.point.lon,
                    elevation_m: p.elevation_m,
                    distance_km,
                })
            })
            .collect();

        found.sort_by(|a, b| {
            b.elevation_m
                .total_cmp(&a.elevation_m)
                .then_with(|| a.distance_km.total_cmp(&b.distance_km))
                .then_with(|| a.name.cmp(&b.name))
        });
        found
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeakReport {
    pub skipped: usize,
    pub evaluated: usize,
    pub with_peaks: usize,
    pub unknown_elevation: usize,
}

pub fn enrich_peaks(records: &mut [PlaceRecord], index: &PeakIndex, config: &PeaksConfig) -> PeakReport {
    let mut report = PeakReport::default();

    for record in records.iter_mut() {
        if record.peaks.count.is_some() {
            report.skipped += 1;
            continue;
        }
        let Some(city_elevation) = record.elevation_m else {
            record.peaks = PeaksInfo {
                error: Some("city elevation unknown".to_string()),
                ..PeaksInfo::default()
            };
            report.unknown_elevation += 1;
            continue;
        };

        let peaks = index.higher_peaks(
            record.point(),
            city_elevation,
            config.radius_km,
            config.min_height_diff_m,
        );
        report.evaluated += 1;
        if !peaks.is_empty() {
            report.with_peaks += 1;
        }
        record.peaks = PeaksInfo {
            count: Some(peaks.len()),
            names: Some(peaks.iter().map(|p| p.name.clone()).collect()),
            peaks: Some(peaks),
            error: None,
        };
    }

    info!(
        "Peaks: {} evaluated ({} with higher peaks), {} without elevation, {} already done",
        report.evaluated, report.with_peaks, report.unknown_elevation, report.skipped
    );
    report
}

/// Peak data could not be fetched: flag every record still lacking an answer
pub fn mark_peaks_unavailable(records: &mut [PlaceRecord], error: impl fmt::Display) {
    warn!("Peak fetch failed, peaks left empty: {}", error);
    for record in records.iter_mut().filter(|r| r.peaks.count.is_none()) {
        record.peaks.error = Some(format!("peak data unavailable: {}", error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ElevationSource, RecordSource};
    use crate::sources::{OsmType, PbfFeatureSource};

    fn peak(id: i64, name: &str, lat: f64, lon: f64, ele: &str) -> Feature {
        Feature {
            osm_type: OsmType::Node,
            id,
            lat,
            lon,
            tags: [("natural", "peak"), ("name", name), ("ele", ele)]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// 1 degree of latitude is ~111.2 km
    fn km_north(origin: GeoPoint, km: f64) -> (f64, f64) {
        (origin.lat + km / 111.195, origin.lon)
    }

    fn city(elevation: Option<f64>) -> PlaceRecord {
        PlaceRecord::new("Testville", 46.0, 7.0, RecordSource::Geonames)
            .with_elevation(elevation, ElevationSource::Geonames)
    }

    fn scenario_index() -> PeakIndex {
        let origin = GeoPoint::new(46.0, 7.0);
        let (lat_a, lon_a) = km_north(origin, 25.0);
        let (lat_b, lon_b) = km_north(origin, 10.0);
        let (lat_c, lon_c) = km_north(origin, 35.0);
        PeakIndex::from_features(vec![
            peak(1, "Counts", lat_a, lon_a, "1800"),
            peak(2, "Too Low", lat_b, lon_b, "1600"),
            peak(3, "Too Far", lat_c, lon_c, "2000"),
        ])
    }

    #[test]
    fn test_radius_and_height_difference() {
        let mut records = vec![city(Some(500.0))];
        let report = enrich_peaks(&mut records, &scenario_index(), &PeaksConfig::default());

        assert_eq!(report.evaluated, 1);
        let peaks = &records[0].peaks;
        assert_eq!(peaks.count, Some(1));
        assert_eq!(peaks.names.as_deref(), Some(&["Counts".to_string()][..]));
        let listed = &peaks.peaks.as_ref().unwrap()[0];
        assert_eq!(listed.elevation_m, 1800.0);
        assert!((listed.distance_km - 25.0).abs() < 0.1);
    }

    #[test]
    fn test_exact_threshold_counts() {
        let index = scenario_index();
        let origin = GeoPoint::new(46.0, 7.0);
        // 1600 - 400 == 1200
        let peaks = index.higher_peaks(origin, 400.0, 30.0, 1200.0);
        assert_eq!(
            peaks.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["Counts", "Too Low"]
        );
    }

    #[test]
    fn test_unknown_elevation_is_flagged_not_zeroed() {
        let mut records = vec![city(None)];
        let report = enrich_peaks(&mut records, &scenario_index(), &PeaksConfig::default());
        assert_eq!(report.unknown_elevation, 1);
        assert_eq!(records[0].peaks.count, None);
        assert!(records[0].peaks.error.is_some());
    }

    #[test]
    fn test_done_records_are_skipped() {
        let mut done = city(Some(500.0));
        done.peaks.count = Some(7);
        let mut records = vec![done];
        let report = enrich_peaks(&mut records, &scenario_index(), &PeaksConfig::default());
        assert_eq!(report.skipped, 1);
        assert_eq!(records[0].peaks.count, Some(7));
    }

    #[tokio::test]
    async fn test_fetch_from_source_drops_unknown_elevation() {
        let mut features = vec![
            peak(1, "Dom", 46.094, 7.859, "4545"),
            peak(2, "Weisshorn", 46.101, 7.716, "4506"),
        ];
        features.push(Feature {
            osm_type: OsmType::Node,
            id: 3,
            lat: 46.05,
            lon: 7.8,
            tags: [("natural", "peak"), ("ele", "unknown")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        let source = PbfFeatureSource::from_features(features);
        let index = PeakIndex::fetch(&source, BBox::new(7.5, 45.9, 8.0, 46.2), 30.0)
            .await
            .unwrap();
        assert_eq!(index.len(), 2);

        let zermatt = GeoPoint::new(46.0207, 7.7491);
        let peaks = index.higher_peaks(zermatt, 1608.0, 30.0, 1200.0);
        assert_eq!(peaks[0].name, "Dom");
        assert_eq!(peaks[1].name, "Weisshorn");
    }
}
