//! Nearest international airport: great-circle narrowing over the offline
//! dataset, then driving-time refinement through the routing engine.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use super::record_progress;
use super::retry::RetryPolicy;
use super::routing::{Route, RoutingEngine};
use super::web_search::{airport_answer, airport_prompt, WebSearch};
use crate::config::AirportConfig;
use crate::models::{AirportCandidate, AirportInfo, EnrichmentMethod, GeoPoint, PlaceRecord};
use crate::sources::AirportIndex;

/// Offline matcher over a shared read-only airport index
pub struct AirportMatcher {
    index: AirportIndex,
    routing: Arc<dyn RoutingEngine>,
    top_k: usize,
    max_radius_km: f64,
    retry: RetryPolicy,
}

impl AirportMatcher {
    pub fn new(index: AirportIndex, routing: Arc<dyn RoutingEngine>, config: &AirportConfig) -> Self {
        Self {
            index,
            routing,
            top_k: config.top_k.max(1),
            max_radius_km: config.max_radius_km,
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn route_candidate(&self, origin: GeoPoint, airport: &AirportCandidate) -> Option<Route> {
        let label = format!("route to {}", airport.name);
        let destination = airport.point();
        match self
            .retry
            .run(&label, || self.routing.route(origin, destination))
            .await
        {
            Ok(route) => Some(route),
            Err(e) => {
                debug!("Routing to {} failed: {}", airport.name, e);
                None
            }
        }
    }

    /// Fastest-by-driving candidate among the top-K nearest, or an error
    pub async fn resolve(&self, origin: GeoPoint) -> AirportInfo {
        let candidates = self.index.nearest_within(origin, self.max_radius_km, self.top_k);
        if candidates.is_empty() {
            return AirportInfo::failed(
                format!(
                    "no scheduled-service airport within {:.0} km",
                    self.max_radius_km
                ),
                EnrichmentMethod::Offline,
            );
        }

        let routes = join_all(
            candidates
                .iter()
                .map(|(airport, _)| self.route_candidate(origin, airport)),
        )
        .await;

        // Candidates arrive sorted by crow-flies distance, so strict `<` keeps
        // the nearer airport on equal driving time
        let mut best: Option<(&AirportCandidate, f64, Route)> = None;
        for ((airport, crow_km), route) in candidates.iter().zip(routes) {
            let Some(route) = route else { continue };
            if best
                .as_ref()
                .map_or(true, |(_, _, b)| route.duration_min < b.duration_min)
            {
                best = Some((*airport, *crow_km, route));
            }
        }

        match best {
            Some((airport, crow_km, route)) => AirportInfo {
                nearest_name: Some(airport.name.clone()),
                nearest_iata: airport.iata.clone(),
                nearest_icao: airport.icao.clone(),
                nearest_location: Some(airport.point()),
                crow_km: Some(crow_km),
                driving_km: Some(route.distance_km),
                driving_minutes: Some(route.duration_min),
                confidence_pct: None,
                reasoning: None,
                method: Some(EnrichmentMethod::Offline),
                error: None,
            },
            None => AirportInfo::failed(
                format!("routing failed for all {} candidate airports", candidates.len()),
                EnrichmentMethod::Offline,
            ),
        }
    }
}

/// How airport fields are filled; both variants write the same fields
pub enum AirportStrategy {
    Offline(AirportMatcher),
    /// Answer from the model, then driving metrics to the named airport
    WebSearch {
        provider: Arc<dyn WebSearch>,
        routing: Arc<dyn RoutingEngine>,
        retry: RetryPolicy,
        max_links: usize,
    },
}

impl AirportStrategy {
    pub async fn resolve(&self, name: &str, country: &str, origin: GeoPoint) -> AirportInfo {
        match self {
            AirportStrategy::Offline(matcher) => matcher.resolve(origin).await,
            AirportStrategy::WebSearch {
                provider,
                routing,
                retry,
                max_links,
            } => {
                let prompt = airport_prompt(name, country, Some(origin));
                let label = format!("airport web search for {}", name);
                let mut info = match retry.run(&label, || provider.ask(&prompt)).await {
                    Ok(text) => airport_answer(&text, origin, *max_links),
                    Err(e) => return AirportInfo::failed(e.to_string(), EnrichmentMethod::WebSearch),
                };
                if let Some(destination) = info.nearest_location.filter(|_| info.error.is_none()) {
                    let label = format!("route from {} to answered airport", name);
                    match retry.run(&label, || routing.route(origin, destination)).await {
                        Ok(route) => {
                            info.driving_km = Some(route.distance_km);
                            info.driving_minutes = Some(route.duration_min);
                        }
                        Err(e) => debug!("Routing {} to web-search airport failed: {}", name, e),
                    }
                }
                info
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AirportReport {
    pub skipped: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// Fill airport fields for every record lacking a successful answer
pub async fn enrich_airports(
    records: &mut [PlaceRecord],
    strategy: &AirportStrategy,
    concurrency: usize,
) -> AirportReport {
    let mut report = AirportReport::default();
    let pending: Vec<(usize, String, String, GeoPoint)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.airport.is_complete())
        .map(|(i, r)| (i, r.name.clone(), r.country.clone().unwrap_or_default(), r.point()))
        .collect();
    report.skipped = records.len() - pending.len();

    let pb = record_progress(pending.len(), "airports");
    let results: Vec<(usize, AirportInfo)> = stream::iter(pending)
        .map(|(i, name, country, origin)| {
            let pb = &pb;
            async move {
                let info = strategy.resolve(&name, &country, origin).await;
                pb.inc(1);
                (i, info)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    pb.finish_and_clear();

    for (i, info) in results {
        if info.is_complete() {
            report.resolved += 1;
        } else {
            report.failed += 1;
            debug!(
                "Airport lookup for {} failed: {}",
                records[i].name,
                info.error.as_deref().unwrap_or("incomplete answer")
            );
        }
        records[i].airport = info;
    }

    info!(
        "Airports: {} resolved, {} failed, {} already complete",
        report.resolved, report.failed, report.skipped
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnrichmentError;
    use crate::models::{AirportSize, RecordSource};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn airport(name: &str, iata: &str, lat: f64, lon: f64) -> AirportCandidate {
        AirportCandidate {
            name: name.to_string(),
            iata: Some(iata.to_string()),
            icao: None,
            lat,
            lon,
            size: AirportSize::LargeAirport,
            scheduled_service: true,
        }
    }

    fn alps_index() -> AirportIndex {
        AirportIndex::build(vec![
            airport("Geneva", "GVA", 46.2381, 6.1090),
            airport("Chambery", "CMF", 45.6381, 5.8802),
            airport("Turin", "TRN", 45.2008, 7.6496),
            airport("Lyon", "LYS", 45.7256, 5.0811),
        ])
    }

    fn config(top_k: usize) -> AirportConfig {
        AirportConfig {
            top_k,
            ..AirportConfig::default()
        }
    }

    /// Routes keyed by destination latitude; unknown destinations fail
    struct FakeRouter {
        minutes_by_lat: HashMap<u64, f64>,
        fail_first: AtomicUsize,
    }

    impl FakeRouter {
        fn new(routes: &[(f64, f64)]) -> Self {
            Self {
                minutes_by_lat: routes.iter().map(|(lat, m)| (lat.to_bits(), *m)).collect(),
                fail_first: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RoutingEngine for FakeRouter {
        async fn route(&self, _from: GeoPoint, to: GeoPoint) -> Result<Route, EnrichmentError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EnrichmentError::Timeout);
            }
            match self.minutes_by_lat.get(&to.lat.to_bits()) {
                Some(minutes) => Ok(Route {
                    distance_km: minutes * 1.2,
                    duration_min: *minutes,
                }),
                None => Err(EnrichmentError::NoRoute),
            }
        }
    }

    fn matcher(router: FakeRouter, top_k: usize) -> AirportMatcher {
        AirportMatcher::new(alps_index(), Arc::new(router), &config(top_k))
            .with_retry(RetryPolicy { max_retries: 2, ..RetryPolicy::none() })
    }

    #[tokio::test]
    async fn test_picks_fastest_drive_not_nearest() {
        // Chamonix: Geneva is nearest and also fastest by road
        let router = FakeRouter::new(&[(46.2381, 75.0), (45.6381, 110.0), (45.2008, 150.0)]);
        let info = matcher(router, 3).resolve(GeoPoint::new(45.9237, 6.8694)).await;
        assert_eq!(info.nearest_iata.as_deref(), Some("GVA"));
        assert_eq!(info.driving_minutes, Some(75.0));
        assert_eq!(info.method, Some(EnrichmentMethod::Offline));

        // Annecy: Chambery is nearer by crow, but Geneva is the faster drive
        let router = FakeRouter::new(&[(46.2381, 45.0), (45.6381, 50.0), (45.2008, 160.0)]);
        let info = matcher(router, 3).resolve(GeoPoint::new(45.8992, 6.1294)).await;
        assert_eq!(info.nearest_iata.as_deref(), Some("GVA"));
        assert!(info.crow_km.unwrap() > 30.0);
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_unroutable_candidates_are_skipped() {
        let router = FakeRouter::new(&[(45.6381, 50.0)]);
        let info = matcher(router, 3).resolve(GeoPoint::new(45.8992, 6.1294)).await;
        assert_eq!(info.nearest_iata.as_deref(), Some("CMF"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let router = FakeRouter::new(&[(46.2381, 75.0)]);
        router.fail_first.store(1, Ordering::SeqCst);
        let info = matcher(router, 1).resolve(GeoPoint::new(45.9237, 6.8694)).await;
        assert_eq!(info.nearest_iata.as_deref(), Some("GVA"));
    }

    #[tokio::test]
    async fn test_all_routes_failing_is_error() {
        let info = matcher(FakeRouter::new(&[]), 3)
            .resolve(GeoPoint::new(45.9237, 6.8694))
            .await;
        assert!(info.nearest_name.is_none());
        assert!(info.error.unwrap().contains("routing failed"));
    }

    #[tokio::test]
    async fn test_no_candidate_within_radius() {
        // Middle of the North Atlantic
        let info = matcher(FakeRouter::new(&[]), 3)
            .resolve(GeoPoint::new(40.0, -30.0))
            .await;
        assert!(info.nearest_name.is_none());
        assert!(info.driving_minutes.is_none());
        assert_eq!(
            info.error.as_deref(),
            Some("no scheduled-service airport within 400 km")
        );
    }

    struct CannedSearch(&'static str);

    #[async_trait]
    impl WebSearch for CannedSearch {
        async fn ask(&self, _prompt: &str) -> Result<String, EnrichmentError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_enrich_skips_complete_and_retries_errors() {
        let mut done = PlaceRecord::new("Annecy", 45.8992, 6.1294, RecordSource::Geonames);
        done.airport.nearest_name = Some("Geneva".to_string());
        let mut errored = PlaceRecord::new("Chamonix", 45.9237, 6.8694, RecordSource::Geonames);
        errored.airport = AirportInfo::failed("timed out", EnrichmentMethod::WebSearch);
        let remote = PlaceRecord::new("Nowhere", 40.0, -30.0, RecordSource::Osm);
        let mut records = vec![done.clone(), errored, remote];

        let router = FakeRouter::new(&[(46.2381, 75.0)]);
        let strategy = AirportStrategy::Offline(matcher(router, 3));
        let report = enrich_airports(&mut records, &strategy, 4).await;

        assert_eq!(report, AirportReport { skipped: 1, resolved: 1, failed: 1 });
        assert_eq!(records[0], done);
        assert_eq!(records[1].airport.nearest_iata.as_deref(), Some("GVA"));
        assert!(records[2].airport.error.is_some());
    }

    fn web_strategy(answer: &'static str, router: FakeRouter) -> AirportStrategy {
        AirportStrategy::WebSearch {
            provider: Arc::new(CannedSearch(answer)),
            routing: Arc::new(router),
            retry: RetryPolicy::none(),
            max_links: 5,
        }
    }

    const GENEVA_ANSWER: &str = r#"{"airport_name": "Geneva Airport", "airport_iata": "GVA", "airport_latitude": 46.2381, "airport_longitude": 6.109, "confidence_pct": 90}"#;

    #[tokio::test]
    async fn test_web_search_strategy_fills_same_fields() {
        let strategy = web_strategy(GENEVA_ANSWER, FakeRouter::new(&[(46.2381, 75.0)]));
        let mut records = vec![PlaceRecord::new("Chamonix", 45.9237, 6.8694, RecordSource::Geonames)];
        let report = enrich_airports(&mut records, &strategy, 2).await;
        assert_eq!(report.resolved, 1);
        let airport = &records[0].airport;
        assert_eq!(airport.nearest_iata.as_deref(), Some("GVA"));
        assert_eq!(airport.method, Some(EnrichmentMethod::WebSearch));
        assert!(airport.crow_km.is_some());
        assert_eq!(airport.driving_minutes, Some(75.0));
        assert!((airport.driving_km.unwrap() - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_web_search_answer_survives_routing_failure() {
        let strategy = web_strategy(GENEVA_ANSWER, FakeRouter::new(&[]));
        let info = strategy
            .resolve("Chamonix", "FR", GeoPoint::new(45.9237, 6.8694))
            .await;
        assert!(info.is_complete());
        assert!(info.driving_minutes.is_none());
        assert!(info.driving_km.is_none());
    }
}
