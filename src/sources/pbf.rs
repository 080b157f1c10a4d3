//! Offline OSM extract as a feature source (tagged nodes only).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use osmpbfreader::{OsmObj, OsmPbfReader};
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use tracing::info;

use super::{Feature, FeatureKind, FeatureSource, OsmType, SearchArea};
use crate::error::EnrichmentError;

type IndexedFeature = GeomWithData<[f64; 2], usize>;

/// Every kind the extract is scanned for
const SCAN_KINDS: [FeatureKind; 3] = [
    FeatureKind::Settlement {
        include_villages: true,
        require_population: false,
    },
    FeatureKind::Hospital,
    FeatureKind::Peak,
];

pub struct PbfFeatureSource {
    features: Vec<Feature>,
    tree: RTree<IndexedFeature>,
}

impl PbfFeatureSource {
    /// Scan a PBF file once, keeping settlement, hospital and peak nodes
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open OSM extract {}", path.display()))?;
        let mut reader = OsmPbfReader::new(BufReader::new(file));

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} nodes scanned ({per_sec})")?,
        );

        let mut features = Vec::new();
        for obj in reader.iter() {
            let obj = obj.context("Failed to read OSM extract")?;
            if let OsmObj::Node(node) = obj {
                pb.inc(1);
                if node.tags.is_empty() {
                    continue;
                }
                let tags: BTreeMap<String, String> = node
                    .tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                if SCAN_KINDS.iter().any(|k| k.matches(&tags)) {
                    features.push(Feature {
                        osm_type: OsmType::Node,
                        id: node.id.0,
                        lat: node.lat(),
                        lon: node.lon(),
                        tags,
                    });
                }
            }
        }
        pb.finish_and_clear();

        info!(
            "OSM extract {}: {} relevant nodes",
            path.display(),
            features.len()
        );
        Ok(Self::from_features(features))
    }

    pub fn from_features(features: Vec<Feature>) -> Self {
        let tree = RTree::bulk_load(
            features
                .iter()
                .enumerate()
                .map(|(i, f)| GeomWithData::new([f.lon, f.lat], i))
                .collect(),
        );
        Self { features, tree }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    fn envelope(area: &SearchArea) -> AABB<[f64; 2]> {
        match area {
            SearchArea::Bounds(b) => AABB::from_corners([b.west, b.south], [b.east, b.north]),
            SearchArea::Around { center, radius_km } => {
                let dlat = radius_km / 110.0;
                let dlon = radius_km / (110.0 * center.lat.to_radians().cos().abs().max(0.01));
                AABB::from_corners(
                    [center.lon - dlon, center.lat - dlat],
                    [center.lon + dlon, center.lat + dlat],
                )
            }
        }
    }
}

#[async_trait]
impl FeatureSource for PbfFeatureSource {
    fn name(&self) -> &str {
        "pbf"
    }

    async fn fetch(
        &self,
        kind: FeatureKind,
        area: &SearchArea,
    ) -> Result<Vec<Feature>, EnrichmentError> {
        let envelope = Self::envelope(area);
        let mut out: Vec<Feature> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|item| &self.features[item.data])
            .filter(|f| kind.matches(&f.tags) && area.contains(f.lat, f.lon))
            .cloned()
            .collect();
        out.sort_by_key(|f| f.id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoPoint;
    use crate::perimeter::BBox;

    fn node(id: i64, lat: f64, lon: f64, tags: &[(&str, &str)]) -> Feature {
        Feature {
            osm_type: OsmType::Node,
            id,
            lat,
            lon,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_kind_and_area() {
        let source = PbfFeatureSource::from_features(vec![
            node(1, 45.92, 6.87, &[("name", "Chamonix"), ("place", "town")]),
            node(2, 45.83, 6.86, &[("name", "Mont Blanc"), ("natural", "peak"), ("ele", "4808")]),
            node(3, 45.91, 6.88, &[("name", "Hôpital"), ("amenity", "hospital")]),
            node(4, 47.0, 11.0, &[("name", "Far Peak"), ("natural", "peak"), ("ele", "3000")]),
        ]);

        let around = SearchArea::Around {
            center: GeoPoint::new(45.92, 6.87),
            radius_km: 30.0,
        };
        let peaks = source.fetch(FeatureKind::Peak, &around).await.unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].name(), Some("Mont Blanc"));

        let hospitals = source.fetch(FeatureKind::Hospital, &around).await.unwrap();
        assert_eq!(hospitals.len(), 1);

        let everywhere = SearchArea::Bounds(BBox::new(5.0, 44.0, 12.0, 48.0));
        let all_peaks = source.fetch(FeatureKind::Peak, &everywhere).await.unwrap();
        assert_eq!(all_peaks.len(), 2);
    }
}
