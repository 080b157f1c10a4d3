//! Nearest-hospital lookup around each city centroid.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::record_progress;
use super::retry::RetryPolicy;
use super::routing::RoutingEngine;
use super::web_search::{hospital_answer, hospital_prompt, WebSearch};
use crate::config::{HospitalConfig, HospitalMode};
use crate::models::{EnrichmentMethod, GeoPoint, HospitalInfo, PlaceRecord};
use crate::sources::{FeatureKind, FeatureSource, SearchArea};

pub struct HospitalMatcher {
    mode: HospitalMode,
    features: Option<Arc<dyn FeatureSource>>,
    routing: Option<Arc<dyn RoutingEngine>>,
    web: Option<(Arc<dyn WebSearch>, usize)>,
    search_radius_km: f64,
    in_city_radius_km: f64,
    nearby_radius_km: f64,
    retry: RetryPolicy,
}

impl HospitalMatcher {
    pub fn new(config: &HospitalConfig) -> Self {
        Self {
            mode: config.mode,
            features: None,
            routing: None,
            web: None,
            search_radius_km: config.search_radius_km,
            in_city_radius_km: config.in_city_radius_km,
            nearby_radius_km: config.nearby_radius_km,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_features(mut self, features: Arc<dyn FeatureSource>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_routing(mut self, routing: Arc<dyn RoutingEngine>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_web_search(mut self, provider: Arc<dyn WebSearch>, max_links: usize) -> Self {
        self.web = Some((provider, max_links));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mode(&self) -> HospitalMode {
        self.mode
    }

    async fn ask_web(&self, name: &str, country: &str) -> HospitalInfo {
        let Some((provider, max_links)) = &self.web else {
            return HospitalInfo {
                method: Some(EnrichmentMethod::WebSearch),
                error: Some("web search provider not configured".to_string()),
                ..HospitalInfo::default()
            };
        };
        let prompt = hospital_prompt(name, country);
        let label = format!("hospital web search for {}", name);
        match self.retry.run(&label, || provider.ask(&prompt)).await {
            Ok(text) => hospital_answer(&text, *max_links),
            Err(e) => HospitalInfo {
                method: Some(EnrichmentMethod::WebSearch),
                error: Some(e.to_string()),
                ..HospitalInfo::default()
            },
        }
    }

    /// Spatial lookup; `None` means the fetch succeeded but found nothing
    async fn lookup_offline(&self, origin: GeoPoint) -> Option<HospitalInfo> {
        let offline_error = |error: String| HospitalInfo {
            method: Some(EnrichmentMethod::Offline),
            error: Some(error),
            ..HospitalInfo::default()
        };

        let Some(features) = &self.features else {
            return Some(offline_error("no spatial feature source configured".to_string()));
        };
        let area = SearchArea::Around {
            center: origin,
            radius_km: self.search_radius_km,
        };
        let hospitals = match features.fetch(FeatureKind::Hospital, &area).await {
            Ok(h) => h,
            Err(e) => return Some(offline_error(format!("{}: {}", features.name(), e))),
        };

        let (nearest, distance_km) = hospitals
            .iter()
            .map(|h| (h, origin.distance_km(&h.point())))
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)))?;

        let mut info = HospitalInfo {
            in_city: Some(distance_km <= self.in_city_radius_km),
            in_city_or_nearby: Some(distance_km <= self.nearby_radius_km),
            nearest_name: nearest.name().map(str::to_string),
            nearest_location: Some(nearest.point()),
            nearest_km: Some(distance_km),
            method: Some(EnrichmentMethod::Offline),
            ..HospitalInfo::default()
        };

        if let Some(routing) = &self.routing {
            let destination = nearest.point();
            match self
                .retry
                .run("hospital route", || routing.route(origin, destination))
                .await
            {
                Ok(route) => {
                    info.driving_km = Some(route.distance_km);
                    info.driving_minutes = Some(route.duration_min);
                }
                Err(e) => debug!("Hospital routing failed: {}", e),
            }
        }
        Some(info)
    }

    pub async fn resolve(&self, name: &str, country: &str, origin: GeoPoint) -> HospitalInfo {
        if self.mode == HospitalMode::WebSearch {
            return self.ask_web(name, country).await;
        }

        match self.lookup_offline(origin).await {
            Some(info) => info,
            None if self.mode == HospitalMode::Hybrid => self.ask_web(name, country).await,
            None => HospitalInfo {
                in_city: Some(false),
                in_city_or_nearby: Some(false),
                reasoning: Some(format!(
                    "no hospital within {:.0} km",
                    self.search_radius_km
                )),
                method: Some(EnrichmentMethod::Offline),
                ..HospitalInfo::default()
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HospitalReport {
    pub skipped: usize,
    pub in_city: usize,
    pub not_in_city: usize,
    pub failed: usize,
}

/// Fill hospital fields for every record without a prior answer
pub async fn enrich_hospitals(
    records: &mut [PlaceRecord],
    matcher: &HospitalMatcher,
    concurrency: usize,
) -> HospitalReport {
    let mut report = HospitalReport::default();
    let pending: Vec<(usize, String, String, GeoPoint)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.hospital.is_complete())
        .map(|(i, r)| (i, r.name.clone(), r.country.clone().unwrap_or_default(), r.point()))
        .collect();
    report.skipped = records.len() - pending.len();

    let pb = record_progress(pending.len(), "hospitals");
    let results: Vec<(usize, HospitalInfo)> = stream::iter(pending)
        .map(|(i, name, country, origin)| {
            let pb = &pb;
            async move {
                let info = matcher.resolve(&name, &country, origin).await;
                pb.inc(1);
                (i, info)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    pb.finish_and_clear();

    for (i, info) in results {
        match (info.in_city, &info.error) {
            (_, Some(e)) => {
                debug!("Hospital lookup for {} failed: {}", records[i].name, e);
                report.failed += 1;
            }
            (Some(true), None) => report.in_city += 1,
            _ => report.not_in_city += 1,
        }
        records[i].hospital = info;
    }

    info!(
        "Hospitals ({:?}): {} in city, {} not, {} failed, {} already answered",
        matcher.mode(),
        report.in_city,
        report.not_in_city,
        report.failed,
        report.skipped
    );
    report
}

/// The spatial source could not be opened; unanswered records carry the error
pub fn mark_hospitals_unavailable(records: &mut [PlaceRecord], error: impl fmt::Display) {
    warn!("Hospital data unavailable, hospitals left empty: {}", error);
    for record in records.iter_mut().filter(|r| !r.hospital.is_complete()) {
        record.hospital = HospitalInfo {
            method: Some(EnrichmentMethod::Offline),
            error: Some(format!("hospital data unavailable: {}", error)),
            ..HospitalInfo::default()
        };
    }
}
