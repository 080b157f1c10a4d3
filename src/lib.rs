//! Cordillera - mountain-region city reconciliation and enrichment
//!
//! Fetches populated places from GeoNames and OpenStreetMap, reconciles them
//! into one deduplicated set per region, and enriches each city with
//! elevation, nearest hospital, nearby higher peaks and nearest airport.

pub mod config;
pub mod country;
pub mod discord;
pub mod enrich;
pub mod error;
pub mod models;
pub mod output;
pub mod perimeter;
pub mod pipeline;
pub mod reconcile;
pub mod sources;

pub use config::Config;
pub use error::{EnrichmentError, PipelineError, PipelineResult};
pub use models::{GeoPoint, PlaceRecord, RecordSource};
pub use pipeline::{RegionPipeline, RunOptions, Stage};
