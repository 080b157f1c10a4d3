//! Name + proximity duplicate clustering and survivor selection.

use std::cmp::Ordering;

use hashbrown::HashMap;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use strsim::jaro_winkler;
use tracing::{debug, info};

use super::normalize::normalize_name;
use crate::config::DedupeConfig;
use crate::models::{PlaceRecord, RecordSource};

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Disjoint-set over record indices
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Whether two records denote the same settlement
fn same_place(
    a: &PlaceRecord,
    b: &PlaceRecord,
    name_a: &str,
    name_b: &str,
    config: &DedupeConfig,
) -> bool {
    if let (Some(ca), Some(cb)) = (&a.country, &b.country) {
        if ca != cb {
            return false;
        }
    }

    let distance = a.point().distance_km(&b.point());
    if name_a == name_b {
        return distance <= config.proximity_km;
    }
    distance <= config.fuzzy_proximity_km && jaro_winkler(name_a, name_b) >= config.fuzzy_threshold
}

/// Survivor priority: population present, then GeoNames over merged over OSM,
/// then elevation present, then larger population. Name and coordinates break
/// any remaining tie so the order is total.
pub fn survivor_order(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    a.population
        .is_none()
        .cmp(&b.population.is_none())
        .then_with(|| a.source.priority().cmp(&b.source.priority()))
        .then_with(|| a.elevation_m.is_none().cmp(&b.elevation_m.is_none()))
        .then_with(|| b.population.cmp(&a.population))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.lat().total_cmp(&b.lat()))
        .then_with(|| a.lon().total_cmp(&b.lon()))
}

/// Fill the winner's empty fields from the loser. Fields already present
/// on the winner are never replaced.
pub fn merge_fields(winner: PlaceRecord, loser: &PlaceRecord) -> PlaceRecord {
    let mut merged = winner;

    if merged.country.is_none() && loser.country.is_some() {
        merged.country = loser.country.clone();
        merged.country_unresolved = false;
    }
    if merged.population.is_none() {
        merged.population = loser.population;
    }
    if merged.elevation_m.is_none() && loser.elevation_m.is_some() {
        merged.elevation_m = loser.elevation_m;
        merged.elevation_source = loser.elevation_source.clone();
        merged.elevation_confidence = loser.elevation_confidence;
    }
    if merged.distance_to_perimeter_km.is_none() {
        merged.distance_to_perimeter_km = loser.distance_to_perimeter_km;
    }
    if merged.region.is_none() {
        merged.region = loser.region.clone();
    }
    if !merged.hospital.is_complete() && loser.hospital.is_complete() {
        merged.hospital = loser.hospital.clone();
    }
    if !merged.airport.is_complete() && loser.airport.is_complete() {
        merged.airport = loser.airport.clone();
    }
    if merged.peaks.count.is_none() && loser.peaks.count.is_some() {
        merged.peaks = loser.peaks.clone();
    }

    merged
}

/// Collapse duplicate clusters into one survivor each.
///
/// Clusters are connected components of the pairwise match relation, so
/// chains of matches collapse transitively. Output is sorted by population
/// (descending) then name, independent of input order.
pub fn dedupe(records: Vec<PlaceRecord>, config: &DedupeConfig) -> Vec<PlaceRecord> {
    let n = records.len();
    if n == 0 {
        return records;
    }

    let names: Vec<String> = records.iter().map(|r| normalize_name(&r.name)).collect();
    let tree: RTree<IndexedPoint> = RTree::bulk_load(
        records
            .iter()
            .enumerate()
            .map(|(i, r)| GeomWithData::new([r.lon(), r.lat()], i))
            .collect(),
    );

    let search_km = config.proximity_km.max(config.fuzzy_proximity_km);
    let mut uf = UnionFind::new(n);

    for (i, record) in records.iter().enumerate() {
        let envelope = search_envelope(record.lat(), record.lon(), search_km);
        for candidate in tree.locate_in_envelope(&envelope) {
            let j = candidate.data;
            if j <= i {
                continue;
            }
            if same_place(record, &records[j], &names[i], &names[j], config) {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }

    let mut slots: Vec<Option<PlaceRecord>> = records.into_iter().map(Some).collect();
    let mut survivors = Vec::with_capacity(clusters.len());
    let mut merged_clusters = 0usize;

    for members in clusters.into_values() {
        let mut members: Vec<PlaceRecord> =
            members.into_iter().filter_map(|i| slots[i].take()).collect();
        members.sort_by(survivor_order);

        let size = members.len();
        let mut iter = members.into_iter();
        let Some(winner) = iter.next() else {
            continue;
        };
        let losers: Vec<PlaceRecord> = iter.collect();

        let mut survivor = losers.iter().fold(winner, merge_fields);
        if size > 1 {
            merged_clusters += 1;
            survivor.source = RecordSource::Merged;
            debug!(
                "Merged {} records into '{}' ({:.4}, {:.4})",
                size,
                survivor.name,
                survivor.lat(),
                survivor.lon()
            );
        }
        survivors.push(survivor);
    }

    survivors.sort_by(|a, b| {
        b.population
            .cmp(&a.population)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.lat().total_cmp(&b.lat()))
            .then_with(|| a.lon().total_cmp(&b.lon()))
    });

    info!(
        "Dedup: {} records -> {} ({} clusters merged)",
        n,
        survivors.len(),
        merged_clusters
    );
    survivors
}

/// Degree envelope that contains every point within `km` of the centre
fn search_envelope(lat: f64, lon: f64, km: f64) -> AABB<[f64; 2]> {
    let dlat = km / 110.0;
    let dlon = km / (110.0 * lat.to_radians().cos().abs().max(0.01));
    AABB::from_corners([lon - dlon, lat - dlat], [lon + dlon, lat + dlat])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ElevationSource;

    fn place(name: &str, lat: f64, lon: f64, pop: Option<u64>, source: RecordSource) -> PlaceRecord {
        PlaceRecord::new(name, lat, lon, source).with_population(pop)
    }

    #[test]
    fn test_grenoble_scenario() {
        let geonames = place("Grenoble", 45.1885, 5.7245, Some(158_000), RecordSource::Geonames);
        let osm = place("Grenoble", 45.1887, 5.7248, None, RecordSource::Osm)
            .with_elevation(Some(212.0), ElevationSource::Osm);

        let out = dedupe(vec![osm, geonames], &DedupeConfig::default());
        assert_eq!(out.len(), 1);
        let g = &out[0];
        assert_eq!(g.name, "Grenoble");
        assert_eq!(g.population, Some(158_000));
        assert_eq!(g.elevation_m, Some(212.0));
        assert_eq!(g.elevation_source, Some(ElevationSource::Osm));
        assert_eq!(g.source, RecordSource::Merged);
        assert_eq!(g.lat(), 45.1885);
    }

    #[test]
    fn test_transitive_cluster_collapses() {
        // A-B and B-C are within 5 km, A-C is not
        let a = place("Brig", 46.3000, 8.0000, Some(13_000), RecordSource::Geonames);
        let b = place("Brig", 46.3300, 8.0000, None, RecordSource::Osm);
        let c = place("Brig", 46.3600, 8.0000, None, RecordSource::Osm);
        assert!(a.point().distance_km(&c.point()) > 5.0);

        let out = dedupe(vec![c, a, b], &DedupeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].population, Some(13_000));
    }

    #[test]
    fn test_same_coordinates_different_names_stay_apart() {
        let a = place("Bolzano", 46.4983, 11.3548, Some(107_000), RecordSource::Geonames);
        let b = place("Bozen", 46.4983, 11.3548, Some(107_000), RecordSource::Osm);
        let out = dedupe(vec![a, b], &DedupeConfig::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_far_apart_same_name_stay_apart() {
        let a = place("Saint-Martin", 45.0, 6.0, Some(6_000), RecordSource::Geonames);
        let b = place("Saint-Martin", 45.5, 6.0, Some(7_000), RecordSource::Geonames);
        assert_eq!(dedupe(vec![a, b], &DedupeConfig::default()).len(), 2);
    }

    #[test]
    fn test_conflicting_countries_stay_apart() {
        let a = place("Pontresina", 46.49, 9.90, Some(6_000), RecordSource::Geonames)
            .with_country(Some("CH"));
        let b = place("Pontresina", 46.49, 9.90, None, RecordSource::Osm).with_country(Some("IT"));
        assert_eq!(dedupe(vec![a, b], &DedupeConfig::default()).len(), 2);
    }

    #[test]
    fn test_fuzzy_match_needs_tighter_distance() {
        let config = DedupeConfig::default();
        let a = place("Garmisch-Partenkirchen", 47.4917, 11.0955, Some(27_000), RecordSource::Geonames);
        let near = place("Garmisch Partenkirchen", 47.4920, 11.0960, None, RecordSource::Osm);
        assert_eq!(dedupe(vec![a.clone(), near], &config).len(), 1);

        // ~3.3 km apart: inside exact radius, outside fuzzy radius
        let far = place("Garmisch Partenkirchen", 47.5217, 11.0955, None, RecordSource::Osm);
        assert_eq!(dedupe(vec![a, far], &config).len(), 2);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let config = DedupeConfig::default();
        let input = vec![
            place("Innsbruck", 47.2692, 11.4041, Some(132_000), RecordSource::Geonames),
            place("Innsbruck", 47.2680, 11.3930, None, RecordSource::Osm),
            place("Hall in Tirol", 47.2833, 11.5000, Some(14_000), RecordSource::Geonames),
            place("Hall in Tirol", 47.2830, 11.5080, Some(13_900), RecordSource::Osm),
            place("Telfs", 47.3070, 11.0720, Some(16_000), RecordSource::Osm),
        ];
        let once = dedupe(input, &config);
        assert_eq!(once.len(), 3);
        let twice = dedupe(once.clone(), &config);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_output_independent_of_input_order() {
        let config = DedupeConfig::default();
        let records = vec![
            place("Annecy", 45.8992, 6.1294, Some(130_000), RecordSource::Osm),
            place("Annecy", 45.9000, 6.1300, Some(128_000), RecordSource::Geonames),
            place("Chambéry", 45.5646, 5.9178, Some(59_000), RecordSource::Geonames),
            place("Chambery", 45.5650, 5.9200, None, RecordSource::Osm),
        ];
        let mut reversed = records.clone();
        reversed.reverse();
        assert_eq!(dedupe(records, &config), dedupe(reversed, &config));
    }

    #[test]
    fn test_survivor_priority() {
        let gn = place("Aosta", 45.737, 7.315, Some(34_000), RecordSource::Geonames);
        let osm = place("Aosta", 45.737, 7.315, Some(34_500), RecordSource::Osm);
        let no_pop = place("Aosta", 45.737, 7.315, None, RecordSource::Geonames);

        assert_eq!(survivor_order(&gn, &osm), Ordering::Less);
        assert_eq!(survivor_order(&osm, &no_pop), Ordering::Less);

        let osm_ele = place("Aosta", 45.737, 7.315, Some(34_000), RecordSource::Osm)
            .with_elevation(Some(583.0), ElevationSource::Osm);
        let osm_bare = place("Aosta", 45.737, 7.315, Some(40_000), RecordSource::Osm);
        assert_eq!(survivor_order(&osm_ele, &osm_bare), Ordering::Less);
    }

    #[test]
    fn test_merge_fields_never_overwrites() {
        let winner = place("Sion", 46.233, 7.36, Some(34_000), RecordSource::Geonames)
            .with_country(Some("CH"))
            .with_elevation(Some(512.0), ElevationSource::Geonames);
        let loser = place("Sion", 46.234, 7.361, Some(1), RecordSource::Osm)
            .with_country(Some("FR"))
            .with_elevation(Some(999.0), ElevationSource::Osm);

        let merged = merge_fields(winner.clone(), &loser);
        assert_eq!(merged, winner);
    }

    #[test]
    fn test_merge_fields_fills_gaps() {
        let winner = place("Sion", 46.233, 7.36, Some(34_000), RecordSource::Geonames);
        let loser = place("Sion", 46.234, 7.361, None, RecordSource::Osm)
            .with_country(Some("CH"))
            .with_elevation(Some(512.0), ElevationSource::Osm);

        let merged = merge_fields(winner, &loser);
        assert_eq!(merged.country.as_deref(), Some("CH"));
        assert_eq!(merged.elevation_m, Some(512.0));
        assert_eq!(merged.elevation_source, Some(ElevationSource::Osm));
        assert_eq!(merged.elevation_confidence, Some(100));
        assert_eq!(merged.population, Some(34_000));
        assert_eq!(merged.lat(), 46.233);
    }
}
