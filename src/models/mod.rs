//! Core data models for the reconciliation pipeline.

pub mod airport;
pub mod place;

pub use airport::{AirportCandidate, AirportSize};
pub use place::{
    AirportInfo, ElevationSource, EnrichmentMethod, GeoPoint, HospitalInfo, NearbyPeak,
    PeaksInfo, PlaceRecord, RecordSource,
};
