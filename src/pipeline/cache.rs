//! Stage artifacts persisted in a per-region sled database.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::models::PlaceRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct StageArtifact {
    pub stage: Stage,
    pub fingerprint: u64,
    pub created_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub records: Vec<PlaceRecord>,
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    stage: Stage,
    fingerprint: u64,
    created_at: DateTime<Utc>,
    run_id: Uuid,
    records: &'a [PlaceRecord],
}

/// Artifacts are only valid for the settings fingerprint they were written under
pub struct StageCache {
    db: sled::Db,
    fingerprint: u64,
}

impl StageCache {
    pub fn open(dir: &Path, fingerprint: u64) -> PipelineResult<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir)?;
        Ok(Self { db, fingerprint })
    }

    pub fn store(&self, stage: Stage, run_id: Uuid, records: &[PlaceRecord]) -> PipelineResult<()> {
        let artifact = ArtifactRef {
            stage,
            fingerprint: self.fingerprint,
            created_at: Utc::now(),
            run_id,
            records,
        };
        let bytes = serde_json::to_vec(&artifact)?;
        self.db.insert(stage.as_str(), bytes)?;
        self.db.flush()?;
        debug!("Cached {} records for stage {}", records.len(), stage);
        Ok(())
    }

    /// Missing, unreadable or foreign-fingerprint artifacts are all `MissingCache`
    pub fn load(&self, stage: Stage) -> PipelineResult<StageArtifact> {
        let Some(bytes) = self.db.get(stage.as_str())? else {
            return Err(PipelineError::MissingCache(stage));
        };
        let artifact: StageArtifact = match serde_json::from_slice(&bytes) {
            Ok(a) => a,
            Err(e) => {
                warn!("Cached artifact for {} is unreadable: {}", stage, e);
                return Err(PipelineError::MissingCache(stage));
            }
        };
        if artifact.fingerprint != self.fingerprint {
            warn!(
                "Cached artifact for {} was produced with different settings",
                stage
            );
            return Err(PipelineError::MissingCache(stage));
        }
        Ok(artifact)
    }

    /// Stages with an artifact valid for the current settings
    pub fn cached_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.load(*s).is_ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;

    fn records() -> Vec<PlaceRecord> {
        vec![
            PlaceRecord::new("Bolzano", 46.4983, 11.3548, RecordSource::Geonames)
                .with_country(Some("IT"))
                .with_population(Some(107_000)),
        ]
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StageCache::open(dir.path(), 42).unwrap();
        let run_id = Uuid::new_v4();
        cache.store(Stage::Dedupe, run_id, &records()).unwrap();

        let artifact = cache.load(Stage::Dedupe).unwrap();
        assert_eq!(artifact.stage, Stage::Dedupe);
        assert_eq!(artifact.run_id, run_id);
        assert_eq!(artifact.records, records());
        assert_eq!(cache.cached_stages(), vec![Stage::Dedupe]);
    }

    #[test]
    fn test_missing_stage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StageCache::open(dir.path(), 42).unwrap();
        assert!(matches!(
            cache.load(Stage::Filter),
            Err(PipelineError::MissingCache(Stage::Filter))
        ));
    }

    #[test]
    fn test_foreign_fingerprint_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StageCache::open(dir.path(), 1).unwrap();
        cache.store(Stage::Fetch, Uuid::new_v4(), &records()).unwrap();

        let changed = StageCache {
            db: cache.db.clone(),
            fingerprint: 2,
        };
        assert!(matches!(
            changed.load(Stage::Fetch),
            Err(PipelineError::MissingCache(Stage::Fetch))
        ));
    }
}
