//! Fixed feature ids used by the county-part and province-part overrides.
//!
//! Political and statistical boundaries split or merge historical
//! sub-regions differently from natural geography. The overrides below are
//! a closed table; they are not configurable.

/// Feature id of Kalmar county.
pub const COUNTY_KALMAR: &str = "8";

/// Feature id of the province of Öland.
pub const PROVINCE_OLAND: &str = "5";

/// Åsele lappmark.
pub const PROVINCE_ASELE_LAPPMARK: &str = "24";
/// Lycksele lappmark.
pub const PROVINCE_LYCKSELE_LAPPMARK: &str = "25";
/// Pite lappmark.
pub const PROVINCE_PITE_LAPPMARK: &str = "26";
/// Lule lappmark.
pub const PROVINCE_LULE_LAPPMARK: &str = "27";
/// Torne lappmark.
pub const PROVINCE_TORNE_LAPPMARK: &str = "28";

/// The five lappmark provinces merged into [`PROVINCE_PART_LAPPLAND`].
pub const LAPPMARK_PROVINCES: [&str; 5] = [
    PROVINCE_ASELE_LAPPMARK,
    PROVINCE_LYCKSELE_LAPPMARK,
    PROVINCE_PITE_LAPPMARK,
    PROVINCE_LULE_LAPPMARK,
    PROVINCE_TORNE_LAPPMARK,
];

/// County part id for the Kalmar mainland.
pub const COUNTY_PART_KALMAR_MAINLAND: &str = "100";
/// Display name for [`COUNTY_PART_KALMAR_MAINLAND`].
pub const COUNTY_PART_KALMAR_MAINLAND_NAME: &str = "Kalmar fastland";

/// County part id for Öland.
pub const COUNTY_PART_OLAND: &str = "101";
/// Display name for [`COUNTY_PART_OLAND`].
pub const COUNTY_PART_OLAND_NAME: &str = "Öland";

/// Province part id for the unified Lappland.
pub const PROVINCE_PART_LAPPLAND: &str = "100";
/// Display name for [`PROVINCE_PART_LAPPLAND`].
pub const PROVINCE_PART_LAPPLAND_NAME: &str = "Lappland";

/// Returns `true` if `province_id` is one of the five lappmark provinces.
#[must_use]
pub fn is_lappmark(province_id: &str) -> bool {
    LAPPMARK_PROVINCES.contains(&province_id)
}
