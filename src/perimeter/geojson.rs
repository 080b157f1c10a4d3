use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde_json::Value;

/// Parse a FeatureCollection, Feature or bare geometry into a multipolygon.
///
/// Every Polygon/MultiPolygon feature in a collection contributes to the result.
pub fn parse_geojson(value: &Value) -> Result<MultiPolygon<f64>, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("missing 'type'")?;

    let mut polygons = Vec::new();
    match kind {
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or("FeatureCollection without 'features'")?;
            for feature in features {
                if let Some(geometry) = feature.get("geometry") {
                    collect_geometry(geometry, &mut polygons)?;
                }
            }
        }
        "Feature" => {
            let geometry = value.get("geometry").ok_or("Feature without 'geometry'")?;
            collect_geometry(geometry, &mut polygons)?;
        }
        _ => collect_geometry(value, &mut polygons)?,
    }

    if polygons.is_empty() {
        return Err("no polygon geometry found".to_string());
    }
    Ok(MultiPolygon::new(polygons))
}

fn collect_geometry(geometry: &Value, out: &mut Vec<Polygon<f64>>) -> Result<(), String> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry missing 'type'")?;
    let coords = geometry.get("coordinates");

    match kind {
        "Polygon" => out.push(parse_polygon(coords.ok_or("Polygon missing coordinates")?)?),
        "MultiPolygon" => {
            let parts = coords
                .and_then(Value::as_array)
                .ok_or("MultiPolygon coordinates must be an array")?;
            for part in parts {
                out.push(parse_polygon(part)?);
            }
        }
        "GeometryCollection" => {
            if let Some(geoms) = geometry.get("geometries").and_then(Value::as_array) {
                for g in geoms {
                    collect_geometry(g, out)?;
                }
            }
        }
        // Points and lines carry no area
        _ => {}
    }
    Ok(())
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>, String> {
    let rings = value.as_array().ok_or("polygon must be an array of rings")?;
    let mut rings = rings.iter().map(parse_ring);
    let exterior = rings.next().ok_or("polygon has no rings")??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn parse_ring(value: &Value) -> Result<LineString<f64>, String> {
    let positions = value.as_array().ok_or("ring must be an array")?;
    let coords = positions
        .iter()
        .map(|pos| {
            let pair = pos.as_array().ok_or("position must be an array")?;
            match (
                pair.first().and_then(Value::as_f64),
                pair.get(1).and_then(Value::as_f64),
            ) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err("position must hold two numbers".to_string()),
            }
        })
        .collect::<Result<Vec<_>, String>>()?;

    if coords.len() < 4 {
        return Err(format!("ring has {} positions, need at least 4", coords.len()));
    }
    Ok(LineString::new(coords))
}
