//! Enrichment stages: each fills one attribute cluster on surviving records
//! and records a per-record error string instead of failing the run.

pub mod airport;
pub mod elevation;
pub mod hospital;
pub mod peaks;
pub mod retry;
pub mod routing;
pub mod web_search;

pub use airport::{enrich_airports, AirportMatcher, AirportReport, AirportStrategy};
pub use elevation::{providers_from_config, ElevationEnricher, ElevationProvider, ElevationReport};
pub use hospital::{enrich_hospitals, HospitalMatcher, HospitalReport};
pub use peaks::{enrich_peaks, PeakIndex, PeakReport};
pub use retry::RetryPolicy;
pub use routing::{OsrmClient, Route, RoutingEngine};
pub use web_search::{OpenAiWebSearch, WebSearch};

use indicatif::{ProgressBar, ProgressStyle};

/// Per-record progress bar for the concurrent enrichment stages
pub(crate) fn record_progress(len: usize, stage: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(stage.to_string());
    pb
}
