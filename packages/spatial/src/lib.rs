#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index for area attribution.
//!
//! Streams area polygons from an [`AreaReader`] in pages, bulk-loads them
//! into an R-tree keyed by envelope, and answers point-in-polygon queries.
//! The index is built once per process and shared by reference with the
//! enrichment service and the processors.

pub mod geometry;
pub mod reader;

use async_trait::async_trait;
use geo::{Contains, MultiPolygon};
use rstar::{AABB, RTree, RTreeObject};
use sos_area_models::{Area, AreaInfo};
use tokio::sync::OnceCell;

pub use reader::{GeoJsonAreaReader, VecAreaReader};

/// Default number of areas requested per reference-data page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Errors that can occur while loading reference areas.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// I/O error reading a reference file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reference file is not valid `GeoJSON`.
    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    /// The reference store could not deliver a page.
    #[error("Reference data unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },
}

/// Paginated access to the area reference data.
#[async_trait]
pub trait AreaReader: Send + Sync {
    /// Returns up to `take` areas starting at offset `skip`. An empty result
    /// means there are no more areas.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the page cannot be read.
    async fn get_batch(&self, skip: usize, take: usize) -> Result<Vec<Area>, SpatialError>;
}

/// Anything that can answer "which areas contain this point?".
///
/// Implemented by [`SpatialAreaIndex`]; the enrichment service depends on
/// this trait so tests can observe or replace the lookups.
pub trait AreaLookup: Send + Sync {
    /// Returns every area containing `(lon, lat)`, ordered by area type and
    /// feature id.
    fn areas_at(&self, lon: f64, lat: f64) -> Vec<AreaInfo>;
}

/// An area polygon stored in the R-tree with its metadata.
struct AreaEntry {
    info: AreaInfo,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
}

impl RTreeObject for AreaEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree over all reference area polygons.
///
/// Starts empty. [`SpatialAreaIndex::build`] populates it exactly once;
/// later calls are no-ops. Until it is built every query returns no areas.
pub struct SpatialAreaIndex {
    tree: OnceCell<RTree<AreaEntry>>,
    page_size: usize,
}

impl Default for SpatialAreaIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialAreaIndex {
    /// Creates an empty, unbuilt index using [`DEFAULT_PAGE_SIZE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty, unbuilt index that reads `page_size` areas per
    /// page (at least one).
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tree: OnceCell::new(),
            page_size: if page_size == 0 { 1 } else { page_size },
        }
    }

    /// Whether [`Self::build`] has completed.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.tree.initialized()
    }

    /// Number of indexed polygons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.get().map_or(0, RTree::size)
    }

    /// Whether the index holds no polygons.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads every area from `reader` and bulk-builds the R-tree.
    ///
    /// Idempotent: if the tree is already built the reader is not touched
    /// and the existing size is returned. An empty reader produces a built
    /// but empty index.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the reader fails. The index then stays
    /// unbuilt (queries return nothing) and a later call may retry.
    pub async fn build(&self, reader: &dyn AreaReader) -> Result<usize, SpatialError> {
        if let Some(tree) = self.tree.get() {
            log::debug!(
                "Spatial index already built ({} areas), skipping",
                tree.size()
            );
            return Ok(tree.size());
        }

        let page_size = self.page_size;
        let tree = self
            .tree
            .get_or_try_init(|| load_tree(reader, page_size))
            .await?;

        Ok(tree.size())
    }

    /// Returns every area containing `(lon, lat)`.
    ///
    /// Candidates are pruned by envelope intersection and confirmed with an
    /// exact point-in-polygon test. Points exactly on a polygon boundary are
    /// not contained.
    #[must_use]
    pub fn query(&self, lon: f64, lat: f64) -> Vec<AreaInfo> {
        let Some(tree) = self.tree.get() else {
            return Vec::new();
        };

        let point = geo::Point::new(lon, lat);
        let query_env = AABB::from_point([lon, lat]);

        let mut hits: Vec<AreaInfo> = tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.polygon.contains(&point))
            .map(|entry| entry.info.clone())
            .collect();

        hits.sort();
        hits.dedup();
        hits
    }
}

impl AreaLookup for SpatialAreaIndex {
    fn areas_at(&self, lon: f64, lat: f64) -> Vec<AreaInfo> {
        self.query(lon, lat)
    }
}

async fn load_tree(
    reader: &dyn AreaReader,
    page_size: usize,
) -> Result<RTree<AreaEntry>, SpatialError> {
    let mut entries = Vec::new();
    let mut skip = 0usize;
    let mut skipped = 0usize;

    loop {
        let page = reader.get_batch(skip, page_size).await?;
        let page_len = page.len();
        if page_len == 0 {
            break;
        }

        for area in page {
            let parsed = geometry::parse_area_geometry(&area.geometry)
                .and_then(|polygon| Some((geometry::envelope(&polygon)?, polygon)));
            let Some((envelope, polygon)) = parsed else {
                log::warn!(
                    "Skipping {} area {}: geometry is not a non-empty polygon",
                    area.area_type,
                    area.feature_id
                );
                skipped += 1;
                continue;
            };

            entries.push(AreaEntry {
                info: area.info(),
                envelope,
                polygon,
            });
        }

        skip += page_len;
        log::debug!("Read {skip} areas so far");

        if page_len < page_size {
            break;
        }
    }

    if entries.is_empty() {
        log::warn!("No reference areas available; spatial index will return no matches");
    } else {
        log::info!(
            "Loaded {} areas into spatial index ({skipped} skipped)",
            entries.len()
        );
    }

    Ok(RTree::bulk_load(entries))
}
