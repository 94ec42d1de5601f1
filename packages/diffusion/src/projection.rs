//! Map projections used for displacement.
//!
//! Diffusion offsets must be applied in a projection where one unit is one
//! meter everywhere in the area of interest. [`TransverseMercator`] with the
//! SWEREF 99 TM parameters satisfies that for Sweden (scale error below
//! 0.1%). [`WebMercator`] does not: its unit shrinks with `cos(latitude)`,
//! so at 62°N a "50 km" offset covers well under half that on the ground.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

/// A forward/inverse map projection between WGS84 degrees and planar
/// coordinates.
pub trait Projection: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Whether planar units are (approximately) true meters everywhere in
    /// the projection's area of use.
    fn is_metric(&self) -> bool;

    /// Projects `(lon, lat)` in degrees to `(x, y)` (easting, northing).
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64);

    /// Unprojects `(x, y)` back to `(lon, lat)` in degrees.
    fn inverse(&self, x: f64, y: f64) -> (f64, f64);
}

/// Gauss–Krüger transverse Mercator on an ellipsoid.
///
/// Uses the series expansion published by Lantmäteriet for SWEREF 99,
/// accurate to well below a millimeter within the zone.
#[derive(Debug, Clone, Copy)]
pub struct TransverseMercator {
    central_meridian: f64,
    scale: f64,
    false_northing: f64,
    false_easting: f64,
    a_roof: f64,
    forward_phi: [f64; 4],
    beta: [f64; 4],
    delta: [f64; 4],
    inverse_phi: [f64; 4],
}

impl TransverseMercator {
    /// Creates a projection for an ellipsoid with semi-major `axis` and
    /// `flattening`.
    #[must_use]
    pub fn new(
        axis: f64,
        flattening: f64,
        central_meridian: f64,
        scale: f64,
        false_northing: f64,
        false_easting: f64,
    ) -> Self {
        let e2 = flattening * (2.0 - flattening);
        let n = flattening / (2.0 - flattening);
        let n2 = n * n;
        let n3 = n2 * n;
        let n4 = n3 * n;
        let a_roof = axis / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0);

        let forward_phi = [
            e2,
            (5.0 * e2.powi(2) - e2.powi(3)) / 6.0,
            (104.0 * e2.powi(3) - 45.0 * e2.powi(4)) / 120.0,
            (1237.0 * e2.powi(4)) / 1260.0,
        ];
        let beta = [
            n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0 + 41.0 * n4 / 180.0,
            13.0 * n2 / 48.0 - 3.0 * n3 / 5.0 + 557.0 * n4 / 1440.0,
            61.0 * n3 / 240.0 - 103.0 * n4 / 140.0,
            49561.0 * n4 / 161_280.0,
        ];
        let delta = [
            n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0 - n4 / 360.0,
            n2 / 48.0 + n3 / 15.0 - 437.0 * n4 / 1440.0,
            17.0 * n3 / 480.0 - 37.0 * n4 / 840.0,
            4397.0 * n4 / 161_280.0,
        ];
        let inverse_phi = [
            e2 + e2.powi(2) + e2.powi(3) + e2.powi(4),
            -(7.0 * e2.powi(2) + 17.0 * e2.powi(3) + 30.0 * e2.powi(4)) / 6.0,
            (224.0 * e2.powi(3) + 889.0 * e2.powi(4)) / 120.0,
            -(4279.0 * e2.powi(4)) / 1260.0,
        ];

        Self {
            central_meridian,
            scale,
            false_northing,
            false_easting,
            a_roof,
            forward_phi,
            beta,
            delta,
            inverse_phi,
        }
    }

    /// SWEREF 99 TM (EPSG:3006): GRS80, central meridian 15°E, scale
    /// 0.9996, false easting 500 000 m.
    #[must_use]
    pub fn sweref99_tm() -> Self {
        Self::new(6_378_137.0, 1.0 / 298.257_222_101, 15.0, 0.9996, 0.0, 500_000.0)
    }
}

impl Default for TransverseMercator {
    fn default() -> Self {
        Self::sweref99_tm()
    }
}

/// Evaluates `c0 + c1·s² + c2·s⁴ + c3·s⁶` for `s = sin(phi)`.
fn sin_series(coefficients: &[f64; 4], phi: f64) -> f64 {
    let s2 = phi.sin().powi(2);
    coefficients[0] + s2 * (coefficients[1] + s2 * (coefficients[2] + s2 * coefficients[3]))
}

impl Projection for TransverseMercator {
    fn name(&self) -> &'static str {
        "SWEREF 99 TM"
    }

    fn is_metric(&self) -> bool {
        true
    }

    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let phi = lat.to_radians();
        let d_lambda = (lon - self.central_meridian).to_radians();

        let phi_star = phi - phi.sin() * phi.cos() * sin_series(&self.forward_phi, phi);
        let xi_prim = (phi_star.tan() / d_lambda.cos()).atan();
        let eta_prim = (phi_star.cos() * d_lambda.sin()).atanh();

        let mut northing = xi_prim;
        let mut easting = eta_prim;
        for (i, beta) in self.beta.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let k = 2.0 * (i + 1) as f64;
            northing += beta * (k * xi_prim).sin() * (k * eta_prim).cosh();
            easting += beta * (k * xi_prim).cos() * (k * eta_prim).sinh();
        }

        (
            self.scale * self.a_roof * easting + self.false_easting,
            self.scale * self.a_roof * northing + self.false_northing,
        )
    }

    fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let xi = (y - self.false_northing) / (self.scale * self.a_roof);
        let eta = (x - self.false_easting) / (self.scale * self.a_roof);

        let mut xi_prim = xi;
        let mut eta_prim = eta;
        for (i, delta) in self.delta.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let k = 2.0 * (i + 1) as f64;
            xi_prim -= delta * (k * xi).sin() * (k * eta).cosh();
            eta_prim -= delta * (k * xi).cos() * (k * eta).sinh();
        }

        let phi_star = (xi_prim.sin() / eta_prim.cosh()).asin();
        let d_lambda = (eta_prim.sinh() / xi_prim.cos()).atan();

        let phi =
            phi_star + phi_star.sin() * phi_star.cos() * sin_series(&self.inverse_phi, phi_star);

        (
            self.central_meridian + d_lambda.to_degrees(),
            phi.to_degrees(),
        )
    }
}

/// Spherical "pseudo" Mercator (EPSG:3857) as used by web map tiles.
///
/// Not metric: planar distances overstate ground distances by
/// `1 / cos(latitude)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

impl Projection for WebMercator {
    fn name(&self) -> &'static str {
        "Web Mercator"
    }

    fn is_metric(&self) -> bool {
        false
    }

    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let x = WEB_MERCATOR_RADIUS * lon.to_radians();
        let y = WEB_MERCATOR_RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
        (x, y)
    }

    fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
        let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - FRAC_PI_2).to_degrees();
        (lon, lat)
    }
}
