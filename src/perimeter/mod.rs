//! Region perimeter: polygon/multipolygon or bounding box.
//!
//! Answers point-in-region and distance-to-boundary queries for the
//! reconciler and the final distance annotation.

mod geojson;

pub use geojson::parse_geojson;

use std::path::Path;

use geo::{BoundingRect, Coord, Intersects, LineString, MultiPolygon, Point, Rect};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::GeoPoint;

/// Bounding box as (west, south, east, north)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
    }

    /// Grow by a distance in km on every side
    pub fn expand_km(&self, km: f64) -> Self {
        let dlat = km / 111.0;
        let mid_lat = ((self.south + self.north) / 2.0).to_radians();
        let dlon = km / (111.0 * mid_lat.cos().max(0.1));
        Self::new(
            (self.west - dlon).max(-180.0),
            (self.south - dlat).max(-90.0),
            (self.east + dlon).min(180.0),
            (self.north + dlat).min(90.0),
        )
    }

    /// Split into tiles of at most `step` degrees
    pub fn tiles(&self, step: f64) -> Vec<BBox> {
        let step = if step > 0.0 { step } else { 1.0 };
        let mut out = Vec::new();
        let mut lat = self.south;
        while lat < self.north {
            let lat_next = (lat + step).min(self.north);
            let mut lon = self.west;
            while lon < self.east {
                let lon_next = (lon + step).min(self.east);
                out.push(BBox::new(lon, lat, lon_next, lat_next));
                lon = lon_next;
            }
            lat = lat_next;
        }
        out
    }

    fn to_rect(self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.west,
                y: self.south,
            },
            Coord {
                x: self.east,
                y: self.north,
            },
        )
    }
}

/// Region boundary, immutable once loaded
#[derive(Debug, Clone)]
pub enum Perimeter {
    Polygon(MultiPolygon<f64>),
    Box(BBox),
}

impl Perimeter {
    /// Load from a GeoJSON file. Any parse problem is a configuration error.
    pub fn from_geojson_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read perimeter {}: {}", path.display(), e))
        })?;
        let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            PipelineError::config(format!("malformed perimeter {}: {}", path.display(), e))
        })?;
        let polygons = parse_geojson(&value).map_err(|e| {
            PipelineError::config(format!("malformed perimeter {}: {}", path.display(), e))
        })?;
        Ok(Perimeter::Polygon(polygons))
    }

    /// Conservative box for known region slugs
    pub fn fallback_for_slug(slug: &str) -> Option<Self> {
        let bbox = match slug.trim().to_lowercase().as_str() {
            "alps" => BBox::new(6.0, 45.5, 16.0, 48.0),
            "pyrenees" => BBox::new(-2.8, 42.0, 3.6, 43.8),
            "rockies" => BBox::new(-125.0, 31.0, -103.0, 60.0),
            _ => return None,
        };
        Some(Perimeter::Box(bbox))
    }

    /// Resolve a region perimeter: explicit file, then the conventional
    /// `<data_dir>/regions/<slug>/perimeter.geojson`, then the slug's fallback box.
    pub fn resolve(explicit: Option<&Path>, data_dir: &Path, slug: &str) -> PipelineResult<Self> {
        if let Some(path) = explicit {
            if path.exists() {
                info!("Loading perimeter from {}", path.display());
                return Self::from_geojson_file(path);
            }
            warn!("Perimeter file {} not found", path.display());
        }

        let conventional = data_dir.join("regions").join(slug).join("perimeter.geojson");
        if conventional.exists() {
            info!("Loading perimeter from {}", conventional.display());
            return Self::from_geojson_file(&conventional);
        }

        match Self::fallback_for_slug(slug) {
            Some(p) => {
                warn!("Using fallback bounding box perimeter for region {}", slug);
                Ok(p)
            }
            None => Err(PipelineError::config(format!(
                "no perimeter for region '{}': set perimeter_geojson or add {}",
                slug,
                conventional.display()
            ))),
        }
    }

    /// Point-in-region test, boundary inclusive; multipolygons are a logical OR over members
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if !lat.is_finite() || !lon.is_finite() {
            return false;
        }
        match self {
            Perimeter::Polygon(mp) => {
                let pt = Point::new(lon, lat);
                mp.0.iter().any(|poly| poly.intersects(&pt))
            }
            Perimeter::Box(b) => b.contains(lat, lon),
        }
    }

    /// Non-negative great-circle distance to the nearest boundary edge
    pub fn distance_to_boundary_km(&self, lat: f64, lon: f64) -> f64 {
        let origin = GeoPoint::new(lat, lon);
        match self {
            Perimeter::Polygon(mp) => mp
                .0
                .iter()
                .flat_map(|poly| std::iter::once(poly.exterior()).chain(poly.interiors().iter()))
                .map(|ring| nearest_on_ring(ring, origin))
                .filter_map(|p| p.map(|p| origin.distance_km(&p)))
                .fold(f64::INFINITY, f64::min),
            Perimeter::Box(b) => {
                let ring = b.to_rect().to_polygon().exterior().clone();
                nearest_on_ring(&ring, origin)
                    .map(|p| origin.distance_km(&p))
                    .unwrap_or(f64::INFINITY)
            }
        }
    }

    pub fn bounds(&self) -> Option<BBox> {
        match self {
            Perimeter::Polygon(mp) => mp
                .bounding_rect()
                .map(|r| BBox::new(r.min().x, r.min().y, r.max().x, r.max().y)),
            Perimeter::Box(b) => Some(*b),
        }
    }
}

/// Closest point on a ring, measured in a local equirectangular frame
/// centred on the origin so longitude is scaled by cos(lat).
fn nearest_on_ring(ring: &LineString<f64>, origin: GeoPoint) -> Option<GeoPoint> {
    let k = origin.lat.to_radians().cos().max(1e-6);
    let to_local = |c: Coord<f64>| ((c.x - origin.lon) * k, c.y - origin.lat);

    let mut best: Option<(f64, (f64, f64))> = None;
    for line in ring.lines() {
        let (ax, ay) = to_local(line.start);
        let (bx, by) = to_local(line.end);
        let (dx, dy) = (bx - ax, by - ay);
        let len2 = dx * dx + dy * dy;
        let t = if len2 > 0.0 {
            (-(ax * dx + ay * dy) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (px, py) = (ax + t * dx, ay + t * dy);
        let d2 = px * px + py * py;
        if best.map_or(true, |(b, _)| d2 < b) {
            best = Some((d2, (px, py)));
        }
    }

    best.map(|(_, (px, py))| GeoPoint::new(origin.lat + py, origin.lon + px / k))
}
