//! Per-region stage runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};
use uuid::Uuid;

use super::cache::StageCache;
use super::Stage;
use crate::config::{AirportMode, Config, HospitalMode, RegionConfig};
use crate::country::CountryResolver;
use crate::enrich::{
    enrich_airports, enrich_hospitals, enrich_peaks, hospital::mark_hospitals_unavailable,
    peaks::mark_peaks_unavailable,
    providers_from_config, AirportMatcher, AirportStrategy, ElevationEnricher, HospitalMatcher,
    OpenAiWebSearch, OsrmClient, PeakIndex, RetryPolicy, RoutingEngine, WebSearch,
};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{AirportInfo, EnrichmentMethod, PlaceRecord};
use crate::output;
use crate::perimeter::Perimeter;
use crate::reconcile::{dedupe_records, filter_records, FilterContext};
use crate::sources::{
    load_airports, AirportIndex, FeatureKind, FeatureSource, GeoNamesClient, OverpassClient,
    PbfFeatureSource, SearchArea,
};

/// Which part of the stage sequence to execute
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Start here, loading the previous stage's artifact from the cache
    pub resume_from: Option<Stage>,
    /// Last stage to execute
    pub stop_after: Option<Stage>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub region: String,
    pub run_id: Uuid,
    pub stages: Vec<Stage>,
    pub total: usize,
    pub with_population: usize,
    pub with_elevation: usize,
    pub top_by_population: Vec<(String, u64)>,
    pub outputs: Vec<PathBuf>,
}

impl RunSummary {
    fn new(region: &RegionConfig, run_id: Uuid) -> Self {
        Self {
            region: region.slug.clone(),
            run_id,
            stages: Vec::new(),
            total: 0,
            with_population: 0,
            with_elevation: 0,
            top_by_population: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn tally(&mut self, records: &[PlaceRecord]) {
        self.total = records.len();
        self.with_population = records.iter().filter(|r| r.population.is_some()).count();
        self.with_elevation = records.iter().filter(|r| r.elevation_m.is_some()).count();

        let mut by_pop: Vec<(String, u64)> = records
            .iter()
            .filter_map(|r| r.population.map(|p| (r.name.clone(), p)))
            .collect();
        by_pop.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_pop.truncate(10);
        self.top_by_population = by_pop;
    }

    pub fn log(&self) {
        info!(
            "Region {} ({}): {} cities, {} with population, {} with elevation",
            self.region, self.run_id, self.total, self.with_population, self.with_elevation
        );
        for (i, (name, population)) in self.top_by_population.iter().enumerate() {
            info!("  {:>2}. {} ({})", i + 1, name, population);
        }
    }
}

/// One region's run over a shared HTTP client
pub struct RegionPipeline<'a> {
    config: &'a Config,
    region: &'a RegionConfig,
    client: Client,
    options: RunOptions,
    run_id: Uuid,
    features: Option<Arc<dyn FeatureSource>>,
}

impl<'a> RegionPipeline<'a> {
    pub fn new(config: &'a Config, region: &'a RegionConfig, client: Client, options: RunOptions) -> Self {
        Self {
            config,
            region,
            client,
            options,
            run_id: Uuid::new_v4(),
            features: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn run(&mut self) -> PipelineResult<RunSummary> {
        let cache = StageCache::open(
            &self.config.global.cache_dir.join(&self.region.slug),
            self.config.fingerprint(self.region),
        )?;
        self.run_with_cache(&cache).await
    }

    /// Run against an already-open stage cache
    pub async fn run_with_cache(&mut self, cache: &StageCache) -> PipelineResult<RunSummary> {
        let start = self.options.resume_from.unwrap_or(Stage::Fetch);
        let stop = self.options.stop_after.unwrap_or(Stage::Maps);
        if stop < start {
            return Err(PipelineError::config(format!(
                "stop-after stage {} comes before resume stage {}",
                stop, start
            )));
        }

        let perimeter = Perimeter::resolve(
            self.region.perimeter_geojson.as_deref(),
            &self.config.global.data_dir,
            &self.region.slug,
        )?;

        let mut records = match start.previous() {
            Some(prev) => {
                let artifact = cache.load(prev)?;
                info!(
                    "Resuming {} at {} with {} records cached {} (run {})",
                    self.region.slug,
                    start,
                    artifact.records.len(),
                    artifact.created_at.to_rfc3339(),
                    artifact.run_id
                );
                artifact.records
            }
            None => Vec::new(),
        };

        let mut summary = RunSummary::new(self.region, self.run_id);
        for stage in Stage::range(start, stop) {
            info!("[{}] stage {} starting", self.region.slug, stage);
            records = self.run_stage(stage, records, &perimeter, &mut summary).await?;
            cache.store(stage, self.run_id, &records)?;
            info!("[{}] stage {} done: {} records", self.region.slug, stage, records.len());
            summary.stages.push(stage);
        }

        summary.tally(&records);
        Ok(summary)
    }

    async fn run_stage(
        &mut self,
        stage: Stage,
        mut records: Vec<PlaceRecord>,
        perimeter: &Perimeter,
        summary: &mut RunSummary,
    ) -> PipelineResult<Vec<PlaceRecord>> {
        match stage {
            Stage::Fetch => return self.fetch(perimeter).await,
            Stage::Filter => {
                let resolver =
                    CountryResolver::default().with_overrides(self.config.country_boxes.iter());
                let ctx = FilterContext {
                    perimeter,
                    resolver: &resolver,
                    region: self.region,
                };
                let (kept, _) = filter_records(records, &ctx);
                return Ok(kept);
            }
            Stage::Dedupe => return Ok(dedupe_records(records, perimeter, &self.config.dedupe)),
            Stage::EnrichElevation => self.enrich_elevation(&mut records).await,
            Stage::EnrichHospitals => self.enrich_hospitals(&mut records).await?,
            Stage::EnrichPeaks => self.enrich_peaks(&mut records, perimeter).await?,
            Stage::EnrichAirports => self.enrich_airports(&mut records).await,
            Stage::Maps => {
                let dir = self.config.global.output_dir.join(&self.region.slug);
                summary.outputs = output::write_all(&records, &dir)?;
            }
        }
        Ok(records)
    }

    /// The required source aborts the run on total failure; the other degrades
    async fn fetch(&mut self, perimeter: &Perimeter) -> PipelineResult<Vec<PlaceRecord>> {
        let config = self.config;
        let sources = &config.sources;
        let mut records = Vec::new();

        if sources.use_geonames {
            let geonames = GeoNamesClient::new(
                self.client.clone(),
                &sources.geonames_url,
                config.credentials.geonames_username.as_deref(),
                Duration::from_millis(sources.geonames_page_pause_ms),
            )?;
            let places = geonames
                .fetch_all(&self.region.countries, self.region.min_population)
                .await?;
            info!("GeoNames: {} places for {}", places.len(), self.region.slug);
            records.extend(places);
        }

        if sources.use_overpass || sources.pbf_path.is_some() {
            let bounds = perimeter.bounds().ok_or_else(|| {
                PipelineError::config(format!("perimeter for {} has no extent", self.region.slug))
            })?;
            let kind = FeatureKind::Settlement {
                include_villages: self.region.include_villages,
                require_population: self.region.require_osm_population,
            };
            let features = self.feature_source()?;
            match features.fetch(kind, &SearchArea::Bounds(bounds)).await {
                Ok(found) => {
                    let osm: Vec<PlaceRecord> =
                        found.iter().filter_map(|f| f.to_place_record()).collect();
                    info!("{}: {} settlements for {}", features.name(), osm.len(), self.region.slug);
                    records.extend(osm);
                }
                Err(e) if !sources.use_geonames => {
                    return Err(PipelineError::unavailable(features.name(), e.to_string()));
                }
                Err(e) => warn!("{} settlements unavailable, continuing without: {}", features.name(), e),
            }
        }

        if !sources.use_geonames && !sources.use_overpass && sources.pbf_path.is_none() {
            return Err(PipelineError::config("no place source enabled"));
        }
        Ok(records)
    }

    /// Offline extract when configured, Overpass otherwise; built once per run
    fn feature_source(&mut self) -> PipelineResult<Arc<dyn FeatureSource>> {
        if let Some(features) = &self.features {
            return Ok(features.clone());
        }
        let config = self.config;
        let sources = &config.sources;
        let features: Arc<dyn FeatureSource> = match &sources.pbf_path {
            Some(path) => Arc::new(
                PbfFeatureSource::open(path)
                    .map_err(|e| PipelineError::unavailable("pbf", format!("{:#}", e)))?,
            ),
            None => Arc::new(
                OverpassClient::new(
                    self.client.clone(),
                    sources.overpass_endpoints.clone(),
                    sources.overpass_retries,
                )
                .with_tile_deg(self.region.overpass_tile_deg),
            ),
        };
        self.features = Some(features.clone());
        Ok(features)
    }

    fn routing(&self) -> Arc<dyn RoutingEngine> {
        Arc::new(OsrmClient::new(self.client.clone(), &self.config.routing.osrm_url))
    }

    fn web_search(&self) -> Option<Arc<dyn WebSearch>> {
        match OpenAiWebSearch::new(
            self.client.clone(),
            &self.config.web_search,
            self.config.credentials.openai_api_key.as_deref(),
        ) {
            Ok(provider) => Some(Arc::new(provider)),
            Err(e) => {
                warn!("Web search disabled: {}", e);
                None
            }
        }
    }

    async fn enrich_elevation(&self, records: &mut [PlaceRecord]) {
        let elevation = &self.config.elevation;
        if elevation.skip {
            info!("Elevation enrichment skipped");
            return;
        }
        let providers =
            providers_from_config(&self.client, elevation, &self.config.credentials);
        let enricher = ElevationEnricher::new(
            providers,
            elevation.batch_size,
            Duration::from_millis(elevation.pause_ms),
        );
        enricher.enrich(records).await;
    }

    async fn enrich_hospitals(&mut self, records: &mut [PlaceRecord]) -> PipelineResult<()> {
        let all = self.config;
        let config = &all.hospitals;
        if !config.enabled {
            info!("Hospital enrichment disabled");
            return Ok(());
        }

        let mut matcher = HospitalMatcher::new(config)
            .with_retry(RetryPolicy::from_config(&all.airports));
        if config.mode != HospitalMode::WebSearch {
            match self.feature_source() {
                Ok(features) => matcher = matcher.with_features(features),
                Err(e) => {
                    mark_hospitals_unavailable(records, &e);
                    return Ok(());
                }
            }
            if config.use_routing {
                matcher = matcher.with_routing(self.routing());
            }
        }
        if config.mode != HospitalMode::Offline {
            if let Some(provider) = self.web_search() {
                matcher = matcher.with_web_search(provider, all.web_search.max_links);
            }
        }

        enrich_hospitals(records, &matcher, config.concurrency).await;
        Ok(())
    }

    async fn enrich_peaks(
        &mut self,
        records: &mut [PlaceRecord],
        perimeter: &Perimeter,
    ) -> PipelineResult<()> {
        let all = self.config;
        let config = &all.peaks;
        if !config.enabled {
            info!("Peak enrichment disabled");
            return Ok(());
        }
        let Some(bounds) = perimeter.bounds() else {
            return Err(PipelineError::config("perimeter has no extent"));
        };

        let features = match self.feature_source() {
            Ok(features) => features,
            Err(e) => {
                mark_peaks_unavailable(records, &e);
                return Ok(());
            }
        };
        match PeakIndex::fetch(features.as_ref(), bounds, config.radius_km).await {
            Ok(index) => {
                enrich_peaks(records, &index, config);
            }
            Err(e) => mark_peaks_unavailable(records, &e),
        }
        Ok(())
    }

    async fn enrich_airports(&self, records: &mut [PlaceRecord]) {
        let config = &self.config.airports;
        if !config.enabled {
            info!("Airport enrichment disabled");
            return;
        }

        let strategy = match config.mode {
            AirportMode::Offline => {
                let path = config
                    .dataset_path
                    .clone()
                    .unwrap_or_else(|| self.config.global.data_dir.join("airports.csv"));
                match load_airports(&self.client, &path, &config.dataset_url).await {
                    Ok(airports) => AirportStrategy::Offline(AirportMatcher::new(
                        AirportIndex::build(airports),
                        self.routing(),
                        config,
                    )),
                    Err(e) => {
                        warn!("Airport dataset unavailable: {:#}", e);
                        mark_airports_failed(
                            records,
                            &format!("airport dataset unavailable: {}", e),
                            EnrichmentMethod::Offline,
                        );
                        return;
                    }
                }
            }
            AirportMode::WebSearch => match self.web_search() {
                Some(provider) => AirportStrategy::WebSearch {
                    provider,
                    routing: self.routing(),
                    retry: RetryPolicy::from_config(config),
                    max_links: self.config.web_search.max_links,
                },
                None => {
                    mark_airports_failed(
                        records,
                        "web search provider not configured",
                        EnrichmentMethod::WebSearch,
                    );
                    return;
                }
            },
        };

        enrich_airports(records, &strategy, config.concurrency).await;
    }
}

fn mark_airports_failed(records: &mut [PlaceRecord], error: &str, method: EnrichmentMethod) {
    for record in records.iter_mut().filter(|r| !r.airport.is_complete()) {
        record.airport = AirportInfo::failed(error, method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn offline_config(dir: &std::path::Path) -> Config {
        let mut config = Config::with_builtin_regions(&["alps"]);
        config.global.data_dir = dir.join("data");
        config.global.cache_dir = dir.join("cache");
        config.global.output_dir = dir.join("out");
        config.credentials = Credentials::default();
        config
    }

    fn seed(name: &str, lat: f64, lon: f64, pop: Option<u64>, ele: Option<f64>) -> PlaceRecord {
        PlaceRecord::new(name, lat, lon, crate::models::RecordSource::Geonames)
            .with_country(Some("AT"))
            .with_population(pop)
            .with_elevation(ele, crate::models::ElevationSource::Geonames)
    }

    #[tokio::test]
    async fn test_resume_without_cache_is_missing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let region = config.regions[0].clone();
        let options = RunOptions {
            resume_from: Some(Stage::Dedupe),
            stop_after: Some(Stage::Dedupe),
        };
        let mut pipeline = RegionPipeline::new(&config, &region, Client::new(), options);
        assert!(matches!(
            pipeline.run().await,
            Err(PipelineError::MissingCache(Stage::Filter))
        ));
    }

    #[tokio::test]
    async fn test_missing_geonames_username_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let region = config.regions[0].clone();
        let options = RunOptions {
            resume_from: None,
            stop_after: Some(Stage::Fetch),
        };
        let mut pipeline = RegionPipeline::new(&config, &region, Client::new(), options);
        assert!(matches!(
            pipeline.run().await,
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let region = config.regions[0].clone();
        let options = RunOptions {
            resume_from: Some(Stage::EnrichPeaks),
            stop_after: Some(Stage::Filter),
        };
        let mut pipeline = RegionPipeline::new(&config, &region, Client::new(), options);
        assert!(matches!(
            pipeline.run().await,
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_runs_offline_stages_and_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config(dir.path());
        config.elevation.skip = true;
        config.hospitals.enabled = false;
        config.peaks.enabled = false;
        config.airports.enabled = false;
        let region = config.regions[0].clone();

        let fetched = vec![
            seed("Innsbruck", 47.2627, 11.3945, Some(132_493), Some(574.0)),
            seed("Innsbruck", 47.2630, 11.3950, None, None),
            seed("Vienna", 48.2082, 16.3738, Some(1_900_000), None),
        ];
        let cache = StageCache::open(
            &config.global.cache_dir.join(&region.slug),
            config.fingerprint(&region),
        )
        .unwrap();
        cache.store(Stage::Fetch, Uuid::new_v4(), &fetched).unwrap();

        let options = RunOptions {
            resume_from: Some(Stage::Filter),
            stop_after: None,
        };
        let mut pipeline = RegionPipeline::new(&config, &region, Client::new(), options);
        let summary = pipeline.run_with_cache(&cache).await.unwrap();

        assert_eq!(summary.stages.first(), Some(&Stage::Filter));
        assert_eq!(summary.stages.last(), Some(&Stage::Maps));
        assert_eq!(summary.total, 1);
        assert_eq!(summary.top_by_population, vec![("Innsbruck".to_string(), 132_493)]);
        assert_eq!(summary.outputs.len(), 3);

        let written = output::read_json(&summary.outputs[0]).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].distance_to_perimeter_km.is_some());
        assert_eq!(cache.cached_stages().len(), Stage::ALL.len());
        assert_eq!(cache.load(Stage::Maps).unwrap().run_id, pipeline.run_id());
    }

    #[tokio::test]
    async fn test_unopenable_extract_degrades_hospitals_and_peaks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config(dir.path());
        config.sources.pbf_path = Some(dir.path().join("missing.osm.pbf"));
        config.airports.enabled = false;
        let region = config.regions[0].clone();

        let cache = StageCache::open(
            &config.global.cache_dir.join(&region.slug),
            config.fingerprint(&region),
        )
        .unwrap();
        let seeded = vec![seed("Innsbruck", 47.2627, 11.3945, Some(132_493), Some(574.0))];
        cache.store(Stage::EnrichElevation, Uuid::new_v4(), &seeded).unwrap();

        let options = RunOptions {
            resume_from: Some(Stage::EnrichHospitals),
            stop_after: Some(Stage::EnrichPeaks),
        };
        let mut pipeline = RegionPipeline::new(&config, &region, Client::new(), options);
        let summary = pipeline.run_with_cache(&cache).await.unwrap();
        assert_eq!(summary.stages, vec![Stage::EnrichHospitals, Stage::EnrichPeaks]);

        let records = cache.load(Stage::EnrichPeaks).unwrap().records;
        assert_eq!(records.len(), 1);
        assert!(records[0].hospital.in_city.is_none());
        assert!(records[0]
            .hospital
            .error
            .as_deref()
            .unwrap()
            .starts_with("hospital data unavailable"));
        assert!(records[0].peaks.count.is_none());
        assert!(records[0]
            .peaks
            .error
            .as_deref()
            .unwrap()
            .starts_with("peak data unavailable"));
    }
}
