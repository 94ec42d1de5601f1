//! Reference-data readers.
//!
//! [`VecAreaReader`] pages over areas already in memory.
//! [`GeoJsonAreaReader`] reads a `GeoJSON` `FeatureCollection` whose features
//! carry `featureId`, `areaType`, and `name` properties.

use std::path::{Path, PathBuf};
use std::str::FromStr as _;

use async_trait::async_trait;
use geojson::{Feature, GeoJson};
use sos_area_models::{Area, AreaType};
use tokio::sync::OnceCell;

use crate::{AreaReader, SpatialError};

/// Serves pages from an in-memory list of areas.
pub struct VecAreaReader {
    areas: Vec<Area>,
}

impl VecAreaReader {
    /// Wraps `areas`.
    #[must_use]
    pub const fn new(areas: Vec<Area>) -> Self {
        Self { areas }
    }
}

#[async_trait]
impl AreaReader for VecAreaReader {
    async fn get_batch(&self, skip: usize, take: usize) -> Result<Vec<Area>, SpatialError> {
        Ok(page(&self.areas, skip, take))
    }
}

/// Reads areas from a `GeoJSON` `FeatureCollection` file.
///
/// The file is parsed on the first page request; later pages are sliced
/// from the parsed list.
pub struct GeoJsonAreaReader {
    path: PathBuf,
    areas: OnceCell<Vec<Area>>,
}

impl GeoJsonAreaReader {
    /// Creates a reader for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            areas: OnceCell::new(),
        }
    }

    async fn load(path: &Path) -> Result<Vec<Area>, SpatialError> {
        let text = tokio::fs::read_to_string(path).await?;
        let areas = parse_feature_collection(&text)?;
        log::info!("Read {} areas from {}", areas.len(), path.display());
        Ok(areas)
    }
}

#[async_trait]
impl AreaReader for GeoJsonAreaReader {
    async fn get_batch(&self, skip: usize, take: usize) -> Result<Vec<Area>, SpatialError> {
        let areas = self
            .areas
            .get_or_try_init(|| Self::load(&self.path))
            .await?;
        Ok(page(areas, skip, take))
    }
}

fn page(areas: &[Area], skip: usize, take: usize) -> Vec<Area> {
    areas.iter().skip(skip).take(take).cloned().collect()
}

/// Parses a `FeatureCollection` into areas. Features without a geometry or
/// without the required properties are skipped with a warning.
///
/// # Errors
///
/// Returns [`SpatialError`] if the text is not `GeoJSON` or is not a
/// `FeatureCollection`.
pub fn parse_feature_collection(text: &str) -> Result<Vec<Area>, SpatialError> {
    let GeoJson::FeatureCollection(collection) = text.parse::<GeoJson>()? else {
        return Err(SpatialError::Unavailable {
            message: "area file is not a GeoJSON FeatureCollection".to_string(),
        });
    };

    Ok(collection
        .features
        .iter()
        .filter_map(|feature| {
            let area = feature_to_area(feature);
            if area.is_none() {
                log::warn!("Skipping area feature without required properties: {:?}", feature.id);
            }
            area
        })
        .collect())
}

fn feature_to_area(feature: &Feature) -> Option<Area> {
    let geometry = feature.geometry.as_ref()?;

    // Feature ids come as strings or numbers depending on the exporter.
    let feature_id = match feature.property("featureId")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let area_type = AreaType::from_str(feature.property("areaType")?.as_str()?).ok()?;
    let name = feature.property("name")?.as_str()?.to_string();

    Some(Area {
        feature_id,
        area_type,
        name,
        geometry: serde_json::to_string(geometry).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {"featureId": 8, "areaType": "County", "name": "Kalmar"},
                "geometry": {"type": "Polygon", "coordinates": [[[15.5,56.2],[17.2,56.2],[17.2,58.0],[15.5,58.0],[15.5,56.2]]]}
            },
            {
                "type": "Feature",
                "properties": {"featureId": "5", "areaType": "Province", "name": "Öland"},
                "geometry": {"type": "Polygon", "coordinates": [[[16.3,56.2],[17.2,56.2],[17.2,57.4],[16.3,57.4],[16.3,56.2]]]}
            },
            {
                "type": "Feature",
                "properties": {"featureId": "x", "areaType": "Galaxy", "name": "Nowhere"},
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}
            }
        ]
    }"#;

    #[test]
    fn parses_feature_collection_and_skips_unknown_types() {
        let areas = parse_feature_collection(COLLECTION).unwrap();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].feature_id, "8");
        assert_eq!(areas[0].area_type, AreaType::County);
        assert_eq!(areas[1].name, "Öland");
    }

    #[test]
    fn rejects_non_collection() {
        assert!(parse_feature_collection(r#"{"type":"Point","coordinates":[1,2]}"#).is_err());
    }

    #[tokio::test]
    async fn vec_reader_pages() {
        let areas = parse_feature_collection(COLLECTION).unwrap();
        let reader = VecAreaReader::new(areas);
        assert_eq!(reader.get_batch(0, 1).await.unwrap().len(), 1);
        assert_eq!(reader.get_batch(1, 5).await.unwrap().len(), 1);
        assert!(reader.get_batch(2, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_reader_reads_once() {
        let dir = std::env::temp_dir().join("sos_spatial_reader_test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("areas.geojson");
        std::fs::write(&path, COLLECTION).unwrap();

        let reader = GeoJsonAreaReader::new(&path);
        assert_eq!(reader.get_batch(0, 10).await.unwrap().len(), 2);

        // Parsed list is cached, so removing the file does not matter.
        std::fs::remove_file(&path).unwrap();
        assert_eq!(reader.get_batch(1, 10).await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
