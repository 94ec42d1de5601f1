//! Area geometry helpers.

use geo::{BoundingRect as _, MultiPolygon};
use geojson::GeoJson;
use rstar::AABB;

/// Parses a `GeoJSON` `Polygon` or `MultiPolygon` geometry object. Any other
/// geometry type, or malformed input, yields `None`.
#[must_use]
pub fn parse_area_geometry(geometry: &str) -> Option<MultiPolygon<f64>> {
    let GeoJson::Geometry(geometry) = geometry.parse::<GeoJson>().ok()? else {
        return None;
    };
    match geo::Geometry::<f64>::try_from(geometry).ok()? {
        geo::Geometry::Polygon(polygon) => Some(MultiPolygon::new(vec![polygon])),
        geo::Geometry::MultiPolygon(polygons) => Some(polygons),
        _ => None,
    }
}

/// Bounding box of `polygons` as an R-tree envelope. `None` for an empty
/// multipolygon.
#[must_use]
pub fn envelope(polygons: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = polygons.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x, rect.min().y],
        [rect.max().x, rect.max().y],
    ))
}

/// `GeoJSON` `Polygon` string for an axis-aligned rectangle. Used for
/// bounding-box areas such as the economic zone and for fixtures.
#[must_use]
pub fn rectangle(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> String {
    format!(
        r#"{{"type":"Polygon","coordinates":[[[{min_lon},{min_lat}],[{max_lon},{min_lat}],[{max_lon},{max_lat}],[{min_lon},{max_lat}],[{min_lon},{min_lat}]]]}}"#
    )
}
