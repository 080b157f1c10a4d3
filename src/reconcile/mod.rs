//! Reconciler: perimeter filter, country resolution, population filter
//! and cross-source deduplication.

mod dedupe;
mod normalize;

pub use dedupe::{dedupe, merge_fields, survivor_order};
pub use normalize::normalize_name;

use rayon::prelude::*;
use tracing::info;

use crate::config::{DedupeConfig, RegionConfig};
use crate::country::{is_excluded, CountryResolver};
use crate::models::PlaceRecord;
use crate::perimeter::Perimeter;

/// Everything the filter step needs about one region
pub struct FilterContext<'a> {
    pub perimeter: &'a Perimeter,
    pub resolver: &'a CountryResolver,
    pub region: &'a RegionConfig,
}

/// Counters for the run summary
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterReport {
    pub input: usize,
    pub outside_perimeter: usize,
    pub country_inferred: usize,
    pub country_unresolved: usize,
    pub excluded_country: usize,
    pub below_min_population: usize,
    pub kept: usize,
}

/// Perimeter filter, country inference, exclusion and population filter.
///
/// Records with unknown population pass through; the population gap may
/// be filled by a duplicate from another source during dedup.
pub fn filter_records(
    records: Vec<PlaceRecord>,
    ctx: &FilterContext<'_>,
) -> (Vec<PlaceRecord>, FilterReport) {
    let mut report = FilterReport {
        input: records.len(),
        ..FilterReport::default()
    };

    let mut kept = Vec::with_capacity(records.len());
    for mut record in records {
        if !ctx.perimeter.contains(record.lat(), record.lon()) {
            report.outside_perimeter += 1;
            continue;
        }

        if record.country.is_none() {
            match ctx
                .resolver
                .infer_country(record.lat(), record.lon(), &ctx.region.countries)
            {
                Some(code) => {
                    record.country = Some(code);
                    record.country_unresolved = false;
                    report.country_inferred += 1;
                }
                None => {
                    record.country_unresolved = true;
                    report.country_unresolved += 1;
                }
            }
        }

        if is_excluded(record.country.as_deref(), &ctx.region.excluded_countries) {
            report.excluded_country += 1;
            continue;
        }

        if record
            .population
            .is_some_and(|p| p < ctx.region.min_population)
        {
            report.below_min_population += 1;
            continue;
        }

        kept.push(record);
    }

    report.kept = kept.len();
    info!(
        "Filter: {} in, {} outside perimeter, {} excluded, {} below {} population, {} kept ({} countries inferred, {} unresolved)",
        report.input,
        report.outside_perimeter,
        report.excluded_country,
        report.below_min_population,
        ctx.region.min_population,
        report.kept,
        report.country_inferred,
        report.country_unresolved
    );
    (kept, report)
}

/// Dedup followed by the final population gate and perimeter distance
pub fn dedupe_records(
    records: Vec<PlaceRecord>,
    perimeter: &Perimeter,
    config: &DedupeConfig,
) -> Vec<PlaceRecord> {
    let mut survivors = dedupe(records, config);

    if !config.keep_unknown_population {
        let before = survivors.len();
        survivors.retain(|r| r.population.is_some());
        let dropped = before - survivors.len();
        if dropped > 0 {
            info!("Dropped {} survivors with unknown population", dropped);
        }
    }

    survivors.par_iter_mut().for_each(|r| {
        if r.distance_to_perimeter_km.is_none() {
            r.distance_to_perimeter_km = Some(perimeter.distance_to_boundary_km(r.lat(), r.lon()));
        }
    });

    survivors
}

/// Full reconciliation of one region's fetched records
pub fn reconcile(
    records: Vec<PlaceRecord>,
    ctx: &FilterContext<'_>,
    config: &DedupeConfig,
) -> Vec<PlaceRecord> {
    let (filtered, _) = filter_records(records, ctx);
    dedupe_records(filtered, ctx.perimeter, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ElevationSource, RecordSource};

    fn alps() -> RegionConfig {
        RegionConfig::builtin("alps").unwrap()
    }

    fn place(name: &str, lat: f64, lon: f64, pop: Option<u64>, source: RecordSource) -> PlaceRecord {
        PlaceRecord::new(name, lat, lon, source).with_population(pop)
    }

    #[test]
    fn test_outside_perimeter_is_dropped() {
        let perimeter = Perimeter::fallback_for_slug("alps").unwrap();
        let resolver = CountryResolver::default();
        let region = alps();
        let ctx = FilterContext {
            perimeter: &perimeter,
            resolver: &resolver,
            region: &region,
        };

        let records = vec![
            place("Innsbruck", 47.2692, 11.4041, Some(132_000), RecordSource::Geonames),
            // Milan sits south of the fallback box
            place("Milano", 45.4642, 9.19, Some(1_350_000), RecordSource::Geonames),
        ];
        let out = reconcile(records, &ctx, &DedupeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Innsbruck");
        assert!(out[0].distance_to_perimeter_km.unwrap() > 0.0);
    }

    #[test]
    fn test_unknown_population_survives_filter_until_merged() {
        let perimeter = Perimeter::fallback_for_slug("alps").unwrap();
        let resolver = CountryResolver::default();
        let region = alps();
        let ctx = FilterContext {
            perimeter: &perimeter,
            resolver: &resolver,
            region: &region,
        };

        let records = vec![
            place("Bludenz", 47.1547, 9.8222, Some(14_000), RecordSource::Geonames)
                .with_country(Some("AT")),
            place("Bludenz", 47.1550, 9.8230, None, RecordSource::Osm)
                .with_elevation(Some(588.0), ElevationSource::Osm),
            place("Hamlet", 47.0, 10.0, None, RecordSource::Osm),
            place("Village", 47.1, 10.1, Some(800), RecordSource::Geonames),
        ];
        let (filtered, report) = filter_records(records, &ctx);
        assert_eq!(report.below_min_population, 1);
        assert_eq!(filtered.len(), 3);

        let out = dedupe_records(filtered, &perimeter, &DedupeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].elevation_m, Some(588.0));
        assert_eq!(out[0].source, RecordSource::Merged);
    }

    #[test]
    fn test_country_inference_and_exclusion() {
        let perimeter = Perimeter::fallback_for_slug("alps").unwrap();
        let resolver = CountryResolver::default();
        let region = alps();
        let ctx = FilterContext {
            perimeter: &perimeter,
            resolver: &resolver,
            region: &region,
        };

        let records = vec![
            // Vienna-ish longitude, only inside the Austrian box
            place("Wiener Neustadt", 47.8, 15.5, Some(46_000), RecordSource::Osm),
            // Inside both the Swiss and French boxes
            place("Thonon", 46.3, 6.48, Some(35_000), RecordSource::Osm),
            place("Kranj", 46.24, 14.35, Some(37_000), RecordSource::Geonames)
                .with_country(Some("SI")),
        ];
        let (filtered, report) = filter_records(records, &ctx);
        assert_eq!(report.excluded_country, 1);
        assert_eq!(report.country_inferred, 1);
        assert_eq!(report.country_unresolved, 1);
        assert_eq!(filtered.len(), 2);

        let neustadt = filtered.iter().find(|r| r.name == "Wiener Neustadt").unwrap();
        assert_eq!(neustadt.country.as_deref(), Some("AT"));
        let thonon = filtered.iter().find(|r| r.name == "Thonon").unwrap();
        assert!(thonon.country.is_none());
        assert!(thonon.country_unresolved);
    }

    #[test]
    fn test_keep_unknown_population_option() {
        let perimeter = Perimeter::fallback_for_slug("alps").unwrap();
        let records = vec![place("Hamlet", 47.0, 10.0, None, RecordSource::Osm)];
        let config = DedupeConfig {
            keep_unknown_population: true,
            ..DedupeConfig::default()
        };
        assert_eq!(dedupe_records(records, &perimeter, &config).len(), 1);
    }
}
