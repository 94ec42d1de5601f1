#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Area enrichment for observations.
//!
//! [`AreaEnricher`] asks an [`AreaLookup`] (normally the shared
//! [`sos_spatial::SpatialAreaIndex`]) which areas contain each
//! observation, copies the results onto the observation's location, and
//! then derives the county and province parts from a fixed override table.
//!
//! Lookups are cached per point rounded to five decimals (about one meter),
//! so dense clusters of observations at the same site cost one spatial
//! query.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use sos_area_models::special::{
    COUNTY_KALMAR, COUNTY_PART_KALMAR_MAINLAND, COUNTY_PART_KALMAR_MAINLAND_NAME,
    COUNTY_PART_OLAND, COUNTY_PART_OLAND_NAME, PROVINCE_OLAND, PROVINCE_PART_LAPPLAND,
    PROVINCE_PART_LAPPLAND_NAME, is_lappmark,
};
use sos_area_models::{AreaInfo, AreaRef, AreaType};
use sos_observation_models::{Observation, ObservationLocation};
use sos_spatial::AreaLookup;

/// Number of decimals coordinates are rounded to for the cache key.
pub const CACHE_KEY_DECIMALS: i32 = 5;

/// Cache key: longitude and latitude scaled by 10^5 and rounded.
pub type CacheKey = (i64, i64);

/// Returns the cache key for `(lon, lat)`.
#[must_use]
pub fn cache_key(lon: f64, lat: f64) -> CacheKey {
    let scale = 10f64.powi(CACHE_KEY_DECIMALS);
    #[allow(clippy::cast_possible_truncation)]
    let key = ((lon * scale).round() as i64, (lat * scale).round() as i64);
    key
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that went to the spatial index.
    pub misses: u64,
    /// Distinct rounded points cached.
    pub cached_points: usize,
}

/// Attaches area metadata to observations.
pub struct AreaEnricher {
    lookup: Arc<dyn AreaLookup>,
    cache: RwLock<BTreeMap<CacheKey, Arc<Vec<AreaInfo>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AreaEnricher {
    /// Creates an enricher with an empty cache.
    #[must_use]
    pub fn new(lookup: Arc<dyn AreaLookup>) -> Self {
        Self {
            lookup,
            cache: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the areas containing `(lon, lat)`, consulting the cache
    /// first. Empty results are cached too.
    pub fn areas_at(&self, lon: f64, lat: f64) -> Arc<Vec<AreaInfo>> {
        let key = cache_key(lon, lat);

        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let areas = Arc::new(self.lookup.areas_at(lon, lat));

        // Another task may have filled the slot meanwhile; keep theirs.
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(key).or_insert(areas))
    }

    /// Enriches one location in place. Returns `false` (and leaves the
    /// location untouched) when it has no usable coordinate.
    pub fn enrich_location(&self, location: &mut ObservationLocation) -> bool {
        let Some((lon, lat)) = location.valid_point() else {
            return false;
        };

        let areas = self.areas_at(lon, lat);
        apply_areas(location, &areas);
        derive_parts(location);
        true
    }

    /// Enriches every observation with a usable coordinate. Returns the
    /// number of observations enriched.
    pub fn enrich(&self, observations: &mut [Observation]) -> usize {
        let mut enriched = 0;
        let mut skipped = 0;

        for observation in observations.iter_mut() {
            if self.enrich_location(&mut observation.location) {
                enriched += 1;
            } else {
                skipped += 1;
            }
        }

        if skipped > 0 {
            log::debug!("Skipped {skipped} observations without coordinates");
        }
        enriched
    }

    /// Current cache counters.
    #[must_use]
    pub fn stats(&self) -> EnrichmentStats {
        EnrichmentStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_points: self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Drops every cached point. Counters are kept.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Copies `areas` onto the location's area fields, replacing whatever was
/// there. When several areas of one type match, the first in
/// `(areaType, featureId)` order wins.
pub fn apply_areas(location: &mut ObservationLocation, areas: &[AreaInfo]) {
    location.clear_areas();

    for area in areas {
        let slot = match area.area_type {
            AreaType::County => &mut location.county,
            AreaType::Municipality => &mut location.municipality,
            AreaType::Parish => &mut location.parish,
            AreaType::Province => &mut location.province,
            AreaType::EconomicZoneOfSweden => {
                location.is_in_economic_zone = true;
                continue;
            }
            AreaType::BirdValidationArea => continue,
        };
        if slot.is_none() {
            *slot = Some(area.to_ref());
        }
    }
}

/// Fills `county_part` and `province_part` from `county` and `province`.
///
/// Kalmar county is split into Öland and the mainland by province; the
/// five lappmark provinces are merged into Lappland. Every other area is
/// its own part.
pub fn derive_parts(location: &mut ObservationLocation) {
    location.county_part = county_part(location.county.as_ref(), location.province.as_ref());
    location.province_part = province_part(location.province.as_ref());
}

fn county_part(county: Option<&AreaRef>, province: Option<&AreaRef>) -> Option<AreaRef> {
    let county = county?;
    if county.feature_id != COUNTY_KALMAR {
        return Some(county.clone());
    }

    if province.is_some_and(|p| p.feature_id == PROVINCE_OLAND) {
        Some(AreaRef::new(COUNTY_PART_OLAND, COUNTY_PART_OLAND_NAME))
    } else {
        Some(AreaRef::new(
            COUNTY_PART_KALMAR_MAINLAND,
            COUNTY_PART_KALMAR_MAINLAND_NAME,
        ))
    }
}

fn province_part(province: Option<&AreaRef>) -> Option<AreaRef> {
    let province = province?;
    if is_lappmark(&province.feature_id) {
        Some(AreaRef::new(
            PROVINCE_PART_LAPPLAND,
            PROVINCE_PART_LAPPLAND_NAME,
        ))
    } else {
        Some(province.clone())
    }
}
