//! Stage sequencing, the per-region stage cache and multi-region combination.

pub mod cache;
pub mod combine;
pub mod orchestrator;

pub use cache::{StageArtifact, StageCache};
pub use combine::{combine_regions, discover_region_outputs};
pub use orchestrator::{RegionPipeline, RunOptions, RunSummary};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stages in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Filter,
    Dedupe,
    EnrichElevation,
    EnrichHospitals,
    EnrichPeaks,
    EnrichAirports,
    Maps,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Fetch,
        Stage::Filter,
        Stage::Dedupe,
        Stage::EnrichElevation,
        Stage::EnrichHospitals,
        Stage::EnrichPeaks,
        Stage::EnrichAirports,
        Stage::Maps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Filter => "filter",
            Stage::Dedupe => "dedupe",
            Stage::EnrichElevation => "enrich_elevation",
            Stage::EnrichHospitals => "enrich_hospitals",
            Stage::EnrichPeaks => "enrich_peaks",
            Stage::EnrichAirports => "enrich_airports",
            Stage::Maps => "maps",
        }
    }

    /// The stage whose output this stage consumes
    pub fn previous(&self) -> Option<Stage> {
        let i = Stage::ALL.iter().position(|s| s == self)?;
        i.checked_sub(1).map(|p| Stage::ALL[p])
    }

    /// Stages from `from` through `to`, inclusive
    pub fn range(from: Stage, to: Stage) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| *s >= from && *s <= to)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
