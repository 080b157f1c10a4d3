//! Country inference from per-country bounding boxes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::perimeter::BBox;

/// Built-in (west, south, east, north) boxes; a code may repeat
const BUILTIN_BOXES: &[(&str, [f64; 4])] = &[
    ("AT", [9.53, 46.37, 17.16, 49.02]),
    ("DE", [5.87, 47.27, 15.04, 55.06]),
    ("FR", [-5.14, 41.33, 9.56, 51.09]),
    ("IT", [6.62, 35.29, 18.79, 47.09]),
    ("CH", [5.96, 45.80, 10.49, 47.81]),
    ("SI", [13.37, 45.40, 16.61, 46.88]),
    ("LI", [9.47, 47.05, 9.64, 47.27]),
    ("ES", [-9.39, 35.95, 3.04, 43.79]),
    ("AD", [1.41, 42.43, 1.79, 42.66]),
    ("US", [-124.85, 24.40, -66.88, 49.39]),
    ("US", [-179.15, 51.20, -141.00, 71.40]),
    ("US", [-141.00, 54.60, -129.90, 60.40]),
    ("CA", [-141.00, 41.68, -52.62, 83.11]),
    ("MX", [-118.40, 14.53, -86.70, 32.72]),
];

/// Resolves a missing country code from coordinates
#[derive(Debug, Clone)]
pub struct CountryResolver {
    boxes: BTreeMap<String, Vec<BBox>>,
}

impl Default for CountryResolver {
    fn default() -> Self {
        let mut boxes: BTreeMap<String, Vec<BBox>> = BTreeMap::new();
        for (code, [w, s, e, n]) in BUILTIN_BOXES {
            boxes
                .entry(code.to_string())
                .or_default()
                .push(BBox::new(*w, *s, *e, *n));
        }
        Self { boxes }
    }
}

impl CountryResolver {
    /// Replace a country's boxes, e.g. from the `[country_boxes]` config table
    pub fn with_overrides<'a>(mut self, overrides: impl IntoIterator<Item = (&'a String, &'a [f64; 4])>) -> Self {
        for (code, [w, s, e, n]) in overrides {
            self.boxes
                .insert(code.to_uppercase(), vec![BBox::new(*w, *s, *e, *n)]);
        }
        self
    }

    pub fn has_box(&self, code: &str) -> bool {
        self.boxes.contains_key(&code.to_uppercase())
    }

    /// Exactly one matching candidate box resolves the country.
    /// Zero or several matches leave it unresolved.
    pub fn infer_country(&self, lat: f64, lon: f64, candidates: &[String]) -> Option<String> {
        let mut matched = candidates
            .iter()
            .map(|c| c.to_uppercase())
            .filter(|c| {
                self.boxes
                    .get(c)
                    .is_some_and(|boxes| boxes.iter().any(|b| b.contains(lat, lon)))
            });

        let first = matched.next()?;
        if let Some(second) = matched.next() {
            debug!(
                "Ambiguous country for ({:.4}, {:.4}): {} and {} both match",
                lat, lon, first, second
            );
            return None;
        }
        Some(first)
    }
}

/// Case-insensitive membership in an exclude list
pub fn is_excluded(code: Option<&str>, excluded: &[String]) -> bool {
    match code {
        Some(code) => excluded.iter().any(|e| e.eq_ignore_ascii_case(code)),
        None => false,
    }
}
