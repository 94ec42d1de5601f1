#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Administrative area types shared by the spatial index, the enrichment
//! service, and the observation model.
//!
//! Areas are immutable reference data. Observations never hold an area by
//! reference; they store an [`AreaRef`] (feature id + name) that acts as a
//! weak lookup key into the reference set.

pub mod special;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The kind of administrative or ecological area a polygon represents.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum AreaType {
    /// County (län)
    County,
    /// Municipality (kommun)
    Municipality,
    /// Parish (socken)
    Parish,
    /// Historical province (landskap)
    Province,
    /// Swedish exclusive economic zone at sea
    EconomicZoneOfSweden,
    /// Regional bird report validation area
    BirdValidationArea,
}

impl AreaType {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::County,
            Self::Municipality,
            Self::Parish,
            Self::Province,
            Self::EconomicZoneOfSweden,
            Self::BirdValidationArea,
        ]
    }
}

/// An area polygon as delivered by the reference store.
///
/// `geometry` is a `GeoJSON` `Polygon` or `MultiPolygon` geometry object
/// serialized as a string; parsing happens once, when the spatial index is
/// built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    /// Stable identifier of the area within its type (e.g. `"8"` for
    /// Kalmar county).
    pub feature_id: String,
    /// What kind of area this is.
    pub area_type: AreaType,
    /// Display name.
    pub name: String,
    /// `GeoJSON` geometry string.
    pub geometry: String,
}

impl Area {
    /// Returns the geometry-free description of this area.
    #[must_use]
    pub fn info(&self) -> AreaInfo {
        AreaInfo {
            feature_id: self.feature_id.clone(),
            area_type: self.area_type,
            name: self.name.clone(),
        }
    }
}

/// Geometry-free area description returned by containment queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaInfo {
    /// Area type. Listed first so the derived ordering groups by type.
    pub area_type: AreaType,
    /// Feature id within the type.
    pub feature_id: String,
    /// Display name.
    pub name: String,
}

impl AreaInfo {
    /// Converts this description into the weak reference stored on
    /// observations.
    #[must_use]
    pub fn to_ref(&self) -> AreaRef {
        AreaRef {
            feature_id: self.feature_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Weak reference from an observation to an area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaRef {
    /// Feature id of the referenced area.
    pub feature_id: String,
    /// Display name captured at enrichment time.
    pub name: String,
}

impl AreaRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(feature_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            name: name.into(),
        }
    }
}
