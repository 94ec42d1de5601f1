#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Processed observation types.
//!
//! Verbatim provider records are mapped into [`Observation`]s during
//! processing. The [`ObservationLocation`] carries both the coordinates and
//! the area metadata attached by the enrichment service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sos_area_models::AreaRef;
use strum_macros::{AsRefStr, Display, EnumString};

/// Sensitivity of an observation's location, from 1 (public) to 5 (most
/// sensitive).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
#[serde(try_from = "u8", into = "u8")]
pub enum ProtectionLevel {
    /// Level 1: public, never diffused
    #[default]
    Public = 1,
    /// Level 2: slightly sensitive
    Low = 2,
    /// Level 3: sensitive
    Medium = 3,
    /// Level 4: highly sensitive
    High = 4,
    /// Level 5: strictly protected
    Strict = 5,
}

impl ProtectionLevel {
    /// Returns the numeric value of this protection level.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Creates a protection level from a numeric value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not in the range 1-5.
    pub const fn from_value(value: u8) -> Result<Self, InvalidProtectionLevelError> {
        match value {
            1 => Ok(Self::Public),
            2 => Ok(Self::Low),
            3 => Ok(Self::Medium),
            4 => Ok(Self::High),
            5 => Ok(Self::Strict),
            _ => Err(InvalidProtectionLevelError { value }),
        }
    }

    /// Whether observations at this level need their coordinates diffused.
    #[must_use]
    pub const fn is_sensitive(self) -> bool {
        !matches!(self, Self::Public)
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Public,
            Self::Low,
            Self::Medium,
            Self::High,
            Self::Strict,
        ]
    }
}

impl TryFrom<u8> for ProtectionLevel {
    type Error = InvalidProtectionLevelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> Self {
        level.value()
    }
}

/// Error returned when attempting to create a [`ProtectionLevel`] from an
/// invalid numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidProtectionLevelError {
    /// The invalid value that was provided.
    pub value: u8,
}

impl std::fmt::Display for InvalidProtectionLevelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid protection level {}: expected 1-5", self.value)
    }
}

impl std::error::Error for InvalidProtectionLevelError {}

/// Location of an observation together with its area metadata.
///
/// The part fields are derived from the plain area fields in a second pass
/// (see the enrichment service).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationLocation {
    /// Latitude (WGS84).
    pub decimal_latitude: Option<f64>,
    /// Longitude (WGS84).
    pub decimal_longitude: Option<f64>,
    /// Containing county.
    pub county: Option<AreaRef>,
    /// Containing municipality.
    pub municipality: Option<AreaRef>,
    /// Containing parish.
    pub parish: Option<AreaRef>,
    /// Containing province.
    pub province: Option<AreaRef>,
    /// County, with Kalmar split into mainland and Öland.
    pub county_part: Option<AreaRef>,
    /// Province, with the five lappmarks merged into Lappland.
    pub province_part: Option<AreaRef>,
    /// Whether the point lies inside the Swedish economic zone.
    pub is_in_economic_zone: bool,
}

impl ObservationLocation {
    /// Creates a location with coordinates and no area metadata.
    #[must_use]
    pub fn at(longitude: f64, latitude: f64) -> Self {
        Self {
            decimal_latitude: Some(latitude),
            decimal_longitude: Some(longitude),
            ..Self::default()
        }
    }

    /// Returns `(longitude, latitude)` when both coordinates are present and
    /// not the `(0, 0)` placeholder some providers emit for missing data.
    #[must_use]
    pub fn valid_point(&self) -> Option<(f64, f64)> {
        let lon = self.decimal_longitude?;
        let lat = self.decimal_latitude?;
        if !lon.is_finite() || !lat.is_finite() {
            return None;
        }
        #[allow(clippy::float_cmp)]
        if lon == 0.0 && lat == 0.0 {
            return None;
        }
        Some((lon, lat))
    }

    /// Clears all area metadata, keeping the coordinates.
    pub fn clear_areas(&mut self) {
        self.county = None;
        self.municipality = None;
        self.parish = None;
        self.province = None;
        self.county_part = None;
        self.province_part = None;
        self.is_in_economic_zone = false;
    }
}

/// A processed observation ready to be written to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Occurrence id from the provider (unique within the provider).
    pub occurrence_id: String,
    /// Provider the observation was harvested from.
    pub provider_id: u32,
    /// Taxon id, if the provider supplied one.
    pub taxon_id: Option<i64>,
    /// When the observation was made.
    pub event_date: Option<DateTime<Utc>>,
    /// Location sensitivity.
    pub protection_level: ProtectionLevel,
    /// Coordinates and area metadata.
    pub location: ObservationLocation,
    /// Whether `location` holds diffused rather than true coordinates.
    #[serde(default)]
    pub is_diffused: bool,
    /// Diffusion radius applied, in meters.
    #[serde(default)]
    pub diffusion_radius_meters: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_level_from_value_roundtrip() {
        for v in 1..=5u8 {
            let level = ProtectionLevel::from_value(v).unwrap();
            assert_eq!(level.value(), v);
        }
        assert!(ProtectionLevel::from_value(0).is_err());
        assert!(ProtectionLevel::from_value(6).is_err());
    }

    #[test]
    fn only_public_is_not_sensitive() {
        for level in ProtectionLevel::all() {
            assert_eq!(level.is_sensitive(), *level != ProtectionLevel::Public);
        }
    }

    #[test]
    fn protection_level_serializes_as_number() {
        let json = serde_json::to_string(&ProtectionLevel::High).unwrap();
        assert_eq!(json, "4");
        let level: ProtectionLevel = serde_json::from_str("5").unwrap();
        assert_eq!(level, ProtectionLevel::Strict);
        assert!(serde_json::from_str::<ProtectionLevel>("9").is_err());
    }

    #[test]
    fn zero_zero_is_not_a_valid_point() {
        assert!(ObservationLocation::at(0.0, 0.0).valid_point().is_none());
        assert!(ObservationLocation::default().valid_point().is_none());
        assert_eq!(
            ObservationLocation::at(16.8, 57.0).valid_point(),
            Some((16.8, 57.0))
        );
    }
}
