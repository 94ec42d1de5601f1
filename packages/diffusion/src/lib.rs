#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Coordinate diffusion for sensitive observations.
//!
//! A diffused point is the true point moved by a uniformly random bearing
//! and a distance drawn uniformly over a disk whose radius depends on the
//! observation's protection level. The offset is applied in a metric
//! projection ([`projection::TransverseMercator`], SWEREF 99 TM), which the
//! [`DiffusionEngine`] enforces at construction.

pub mod projection;

use std::f64::consts::TAU;

use geo::{Distance as _, Haversine, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sos_observation_models::ProtectionLevel;

use crate::projection::{Projection, TransverseMercator};

/// Default relative tolerance for [`DiffusionEngine::self_test`].
pub const DEFAULT_SELF_TEST_TOLERANCE: f64 = 0.15;

/// Errors raised by the diffusion engine.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    /// The engine was handed a projection whose units are not meters.
    #[error("projection {projection} is not metric; diffusion distances would be wrong")]
    NonMetricProjection {
        /// Name of the rejected projection.
        projection: &'static str,
    },

    /// A sensitive level has a radius that is not a positive finite number.
    #[error("invalid diffusion radius {radius} for protection level {level}")]
    InvalidRadius {
        /// Protection level the radius belongs to.
        level: u8,
        /// The offending value.
        radius: f64,
    },

    /// The self-test tolerance is negative or not finite.
    #[error("invalid self-test tolerance {tolerance}")]
    InvalidTolerance {
        /// The offending value.
        tolerance: f64,
    },

    /// The measured mean displacement does not match the configured radius.
    #[error(
        "diffusion self-test failed for level {level}: mean displacement {measured_m:.0} m, expected {expected_m:.0} m"
    )]
    SelfTestFailed {
        /// Protection level under test.
        level: u8,
        /// Expected mean displacement in meters.
        expected_m: f64,
        /// Measured mean displacement in meters.
        measured_m: f64,
    },
}

/// Diffusion radius in meters per protection level. Level 1 is public and
/// never diffused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionRadii {
    /// Radius for level 2.
    pub level2: f64,
    /// Radius for level 3.
    pub level3: f64,
    /// Radius for level 4.
    pub level4: f64,
    /// Radius for level 5.
    pub level5: f64,
}

impl Default for DiffusionRadii {
    fn default() -> Self {
        Self {
            level2: 1_000.0,
            level3: 5_000.0,
            level4: 25_000.0,
            level5: 50_000.0,
        }
    }
}

impl DiffusionRadii {
    /// Returns the radius in meters for `level`.
    #[must_use]
    pub const fn radius_for(&self, level: ProtectionLevel) -> f64 {
        match level {
            ProtectionLevel::Public => 0.0,
            ProtectionLevel::Low => self.level2,
            ProtectionLevel::Medium => self.level3,
            ProtectionLevel::High => self.level4,
            ProtectionLevel::Strict => self.level5,
        }
    }
}

/// Diffusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Seed for reproducible diffusion. `None` draws a fresh seed per
    /// process.
    pub seed: Option<u64>,
    /// Radius per protection level.
    pub radii: DiffusionRadii,
    /// Relative tolerance accepted by the statistical self-test.
    pub self_test_tolerance: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            seed: None,
            radii: DiffusionRadii::default(),
            self_test_tolerance: DEFAULT_SELF_TEST_TOLERANCE,
        }
    }
}

/// Outcome of diffusing one point. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionResult {
    /// The original coordinate.
    pub true_point: Point<f64>,
    /// The obfuscated coordinate.
    pub diffused_point: Point<f64>,
    /// Protection level that selected the radius.
    pub protection_level: ProtectionLevel,
    /// Great-circle distance between the two points, in meters.
    pub displacement_distance: f64,
    /// Radius the displacement was drawn from, in meters.
    pub radius: f64,
}

/// Mean displacement of a point drawn uniformly over a disk of `radius`.
#[must_use]
pub fn expected_mean_displacement(radius: f64) -> f64 {
    2.0 * radius / 3.0
}

/// Moves `(lon, lat)` by a random bearing and a distance uniform over the
/// disk of `radius` planar units of `projection`.
///
/// Works with any projection, including non-metric ones.
/// [`DiffusionEngine`] only accepts metric projections.
pub fn displace<R: Rng + ?Sized>(
    projection: &dyn Projection,
    lon: f64,
    lat: f64,
    radius: f64,
    rng: &mut R,
) -> (f64, f64) {
    let (x, y) = projection.forward(lon, lat);
    let bearing = rng.gen_range(0.0..TAU);
    let distance = radius * rng.r#gen::<f64>().sqrt();
    projection.inverse(x + distance * bearing.sin(), y + distance * bearing.cos())
}

/// Mean great-circle displacement over `samples` calls to [`displace`].
pub fn measure_mean_displacement<R: Rng + ?Sized>(
    projection: &dyn Projection,
    lon: f64,
    lat: f64,
    radius: f64,
    samples: usize,
    rng: &mut R,
) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    let origin = Point::new(lon, lat);
    let total: f64 = (0..samples)
        .map(|_| {
            let (dx, dy) = displace(projection, lon, lat, radius, rng);
            Haversine.distance(origin, Point::new(dx, dy))
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = total / samples as f64;
    mean
}

/// Diffuses coordinates of sensitive observations.
pub struct DiffusionEngine<P: Projection = TransverseMercator> {
    config: DiffusionConfig,
    projection: P,
    seed: u64,
}

impl DiffusionEngine<TransverseMercator> {
    /// Creates an engine using SWEREF 99 TM.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::InvalidRadius`] unless every sensitive level
    /// has a positive radius, or [`DiffusionError::InvalidTolerance`] for a
    /// negative or non-finite self-test tolerance.
    pub fn sweref99(config: DiffusionConfig) -> Result<Self, DiffusionError> {
        Self::new(config, TransverseMercator::sweref99_tm())
    }
}

impl<P: Projection> DiffusionEngine<P> {
    /// Creates an engine that displaces points in `projection`.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::NonMetricProjection`] if `projection` is not
    /// metric, [`DiffusionError::InvalidRadius`] unless every sensitive level
    /// has a positive radius, or [`DiffusionError::InvalidTolerance`] for a
    /// negative or non-finite self-test tolerance.
    pub fn new(config: DiffusionConfig, projection: P) -> Result<Self, DiffusionError> {
        if !projection.is_metric() {
            return Err(DiffusionError::NonMetricProjection {
                projection: projection.name(),
            });
        }

        for level in ProtectionLevel::all().iter().filter(|l| l.is_sensitive()) {
            let radius = config.radii.radius_for(*level);
            if !radius.is_finite() || radius <= 0.0 {
                return Err(DiffusionError::InvalidRadius {
                    level: level.value(),
                    radius,
                });
            }
        }

        let tolerance = config.self_test_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(DiffusionError::InvalidTolerance { tolerance });
        }

        let seed = config.seed.unwrap_or_else(rand::random);
        log::debug!(
            "Diffusion engine using {} (seed {})",
            projection.name(),
            config.seed.map_or_else(|| "random".to_string(), |s| s.to_string())
        );

        Ok(Self {
            config,
            projection,
            seed,
        })
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Radius in meters applied to `level`.
    #[must_use]
    pub const fn radius_for(&self, level: ProtectionLevel) -> f64 {
        self.config.radii.radius_for(level)
    }

    /// Returns a random source that depends only on the engine seed and
    /// `key` (typically the occurrence id), so reprocessing the same record
    /// yields the same diffused point.
    #[must_use]
    pub fn rng_for(&self, key: &str) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ key_hash(key))
    }

    /// Diffuses `(lon, lat)` for `level`.
    ///
    /// Returns `None` when the level has no radius (public observations).
    pub fn diffuse<R: Rng + ?Sized>(
        &self,
        lon: f64,
        lat: f64,
        level: ProtectionLevel,
        rng: &mut R,
    ) -> Option<DiffusionResult> {
        let radius = self.radius_for(level);
        if radius <= 0.0 {
            return None;
        }

        let (dlon, dlat) = displace(&self.projection, lon, lat, radius, rng);
        let true_point = Point::new(lon, lat);
        let diffused_point = Point::new(dlon, dlat);

        Some(DiffusionResult {
            true_point,
            diffused_point,
            protection_level: level,
            displacement_distance: Haversine.distance(true_point, diffused_point),
            radius,
        })
    }

    /// Samples `samples` displacements of `(lon, lat)` at `level` and checks
    /// the mean great-circle displacement against the configured radius.
    ///
    /// Returns the measured mean in meters.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::SelfTestFailed`] when the mean deviates from
    /// `2R/3` by more than the configured tolerance.
    pub fn self_test(
        &self,
        lon: f64,
        lat: f64,
        level: ProtectionLevel,
        samples: usize,
    ) -> Result<f64, DiffusionError> {
        let radius = self.radius_for(level);
        if radius <= 0.0 {
            return Ok(0.0);
        }

        let mut rng = self.rng_for("self-test");
        let measured_m = measure_mean_displacement(&self.projection, lon, lat, radius, samples, &mut rng);
        let expected_m = expected_mean_displacement(radius);

        if (measured_m - expected_m).abs() > expected_m * self.config.self_test_tolerance {
            return Err(DiffusionError::SelfTestFailed {
                level: level.value(),
                expected_m,
                measured_m,
            });
        }

        log::info!(
            "Diffusion self-test level {}: mean {measured_m:.0} m (expected {expected_m:.0} m)",
            level.value()
        );
        Ok(measured_m)
    }
}

/// First eight bytes of the key's SHA-256 digest.
fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::WebMercator;

    const LON: f64 = 15.0;
    const LAT: f64 = 62.0;
    const SAMPLES: usize = 2000;

    fn engine() -> DiffusionEngine {
        DiffusionEngine::sweref99(DiffusionConfig {
            seed: Some(7),
            ..DiffusionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn level_five_mean_displacement_exceeds_floor() {
        let measured = engine()
            .self_test(LON, LAT, ProtectionLevel::Strict, SAMPLES)
            .unwrap();
        assert!(measured > 18_000.0, "mean was {measured}");
    }

    #[test]
    fn web_mercator_understates_displacement() {
        let mut rng = StdRng::seed_from_u64(7);
        let measured =
            measure_mean_displacement(&WebMercator, LON, LAT, 50_000.0, SAMPLES, &mut rng);
        let expected = expected_mean_displacement(50_000.0);

        assert!(measured < 18_000.0, "mean was {measured}");
        assert!(
            (measured - expected).abs() > expected * DEFAULT_SELF_TEST_TOLERANCE,
            "web mercator mean {measured} should diverge from {expected}"
        );
    }

    #[test]
    fn engine_rejects_non_metric_projection() {
        let result = DiffusionEngine::new(DiffusionConfig::default(), WebMercator);
        assert!(matches!(
            result,
            Err(DiffusionError::NonMetricProjection { .. })
        ));
    }

    #[test]
    fn engine_rejects_negative_radius() {
        let config = DiffusionConfig {
            radii: DiffusionRadii {
                level3: -1.0,
                ..DiffusionRadii::default()
            },
            ..DiffusionConfig::default()
        };
        assert!(matches!(
            DiffusionEngine::sweref99(config),
            Err(DiffusionError::InvalidRadius { level: 3, .. })
        ));
    }

    #[test]
    fn engine_rejects_zero_radius_for_sensitive_level() {
        let config = DiffusionConfig {
            radii: DiffusionRadii {
                level5: 0.0,
                ..DiffusionRadii::default()
            },
            ..DiffusionConfig::default()
        };
        assert!(matches!(
            DiffusionEngine::sweref99(config),
            Err(DiffusionError::InvalidRadius { level: 5, .. })
        ));
    }

    #[test]
    fn engine_rejects_unusable_tolerance() {
        for tolerance in [-0.1, f64::NAN] {
            let config = DiffusionConfig {
                self_test_tolerance: tolerance,
                ..DiffusionConfig::default()
            };
            assert!(matches!(
                DiffusionEngine::sweref99(config),
                Err(DiffusionError::InvalidTolerance { .. })
            ));
        }
    }

    #[test]
    fn public_observations_are_not_diffused() {
        let engine = engine();
        let mut rng = engine.rng_for("obs-1");
        assert!(engine.diffuse(LON, LAT, ProtectionLevel::Public, &mut rng).is_none());
    }

    #[test]
    fn displacement_is_bounded_by_radius() {
        let engine = engine();
        let mut rng = engine.rng_for("bounded");
        for _ in 0..500 {
            let result = engine
                .diffuse(LON, LAT, ProtectionLevel::Medium, &mut rng)
                .unwrap();
            assert!(result.displacement_distance <= 5_000.0 * 1.001);
            assert_eq!(result.radius, 5_000.0);
        }
    }

    #[test]
    fn same_key_gives_same_point() {
        let engine = engine();
        let a = engine
            .diffuse(LON, LAT, ProtectionLevel::High, &mut engine.rng_for("occ-42"))
            .unwrap();
        let b = engine
            .diffuse(LON, LAT, ProtectionLevel::High, &mut engine.rng_for("occ-42"))
            .unwrap();
        let c = engine
            .diffuse(LON, LAT, ProtectionLevel::High, &mut engine.rng_for("occ-43"))
            .unwrap();
        assert_eq!(a.diffused_point, b.diffused_point);
        assert_ne!(a.diffused_point, c.diffused_point);
    }

    #[test]
    fn config_reads_partial_toml() {
        let config: DiffusionConfig = toml::from_str(
            "seed = 3\n[radii]\nlevel5 = 40000.0\n",
        )
        .unwrap();
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.radii.level5, 40_000.0);
        assert_eq!(config.radii.level2, 1_000.0);
        assert_eq!(config.self_test_tolerance, DEFAULT_SELF_TEST_TOLERANCE);
    }
}
