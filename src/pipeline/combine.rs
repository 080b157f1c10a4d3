//! Multi-region combination: every region keeps its own records, tagged
//! with the region slug. Nothing is deduplicated across regions.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::PipelineResult;
use crate::models::PlaceRecord;
use crate::output::{read_json, JSON_FILE};

/// Directory holding the combined output, skipped during discovery
pub const COMBINED_DIR: &str = "combined";

/// `(slug, path)` of every `<output_dir>/<slug>/cities.json`, sorted by slug
pub fn discover_region_outputs(output_dir: &Path) -> PipelineResult<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    if !output_dir.exists() {
        warn!("Output directory not found: {}", output_dir.display());
        return Ok(found);
    }

    for entry in WalkDir::new(output_dir).min_depth(2).max_depth(2).follow_links(true) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() || path.file_name().and_then(|n| n.to_str()) != Some(JSON_FILE) {
            continue;
        }
        let Some(slug) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        else {
            continue;
        };
        if slug == COMBINED_DIR {
            continue;
        }
        found.push((slug.to_string(), path.to_path_buf()));
    }

    found.sort();
    Ok(found)
}

/// Load and tag each region's final records; `only` restricts to given slugs
pub fn combine_regions(output_dir: &Path, only: &[String]) -> PipelineResult<Vec<PlaceRecord>> {
    let mut combined = Vec::new();

    for (slug, path) in discover_region_outputs(output_dir)? {
        if !only.is_empty() && !only.contains(&slug) {
            continue;
        }
        let mut records = read_json(&path)?;
        for record in &mut records {
            record.region = Some(slug.clone());
        }
        info!("{}: {} records", slug, records.len());
        combined.extend(records);
    }

    combined.sort_by(|a, b| {
        a.region
            .cmp(&b.region)
            .then_with(|| b.population.cmp(&a.population))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;
    use crate::output::write_json;

    fn write_region(root: &Path, slug: &str, records: &[PlaceRecord]) {
        let dir = root.join(slug);
        std::fs::create_dir_all(&dir).unwrap();
        write_json(records, &dir.join(JSON_FILE)).unwrap();
    }

    #[test]
    fn test_regions_are_tagged_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        // A town on the border of both study areas shows up in each
        let andorra = PlaceRecord::new("Andorra la Vella", 42.5063, 1.5218, RecordSource::Geonames)
            .with_population(Some(22_000));
        write_region(dir.path(), "pyrenees", &[andorra.clone()]);
        write_region(dir.path(), "alps", &[
            PlaceRecord::new("Innsbruck", 47.2627, 11.3945, RecordSource::Geonames)
                .with_population(Some(132_493)),
            andorra,
        ]);
        write_region(dir.path(), COMBINED_DIR, &[]);

        let combined = combine_regions(dir.path(), &[]).unwrap();
        assert_eq!(combined.len(), 3);
        assert_eq!(combined[0].region.as_deref(), Some("alps"));
        assert_eq!(combined[0].name, "Innsbruck");
        assert_eq!(combined[2].region.as_deref(), Some("pyrenees"));
        assert_eq!(combined[2].name, "Andorra la Vella");

        let only_pyrenees = combine_regions(dir.path(), &["pyrenees".to_string()]).unwrap();
        assert_eq!(only_pyrenees.len(), 1);
    }

    #[test]
    fn test_missing_output_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_region_outputs(&dir.path().join("nope")).unwrap().is_empty());
    }
}
