//! Conversions between geocentric (GCC) and geodetic (WGS-84) coordinates, and from
//! federation orientations to azimuth/elevation.

use serde::Deserialize;
use std::{
    f64::consts::{FRAC_PI_2, PI},
    ops::{Add, Sub},
};

/// WGS-84 semi-major axis (meters).
const SEMI_MAJOR: f64 = 6_378_137.0;

/// WGS-84 flattening.
const FLATTENING: f64 = 1.0 / 298.257_223_563;

/// Maximum number of refinement steps when solving for latitude.
const MAX_ITERATIONS: usize = 16;

fn eccentricity_squared() -> f64 {
    FLATTENING * (2.0 - FLATTENING)
}

/// A three-dimensional vector (geocentric position, offset, or velocity).
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Returns true if any axis differs from `other` by at least `epsilon`.
    pub fn moved(&self, other: &Self, epsilon: f64) -> bool {
        (self.x - other.x).abs() >= epsilon
            || (self.y - other.y).abs() >= epsilon
            || (self.z - other.z).abs() >= epsilon
    }
}

impl Add for Vector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Geodetic position in degrees (latitude, longitude) and meters (altitude).
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct Geodetic {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl Geodetic {
    pub const fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Returns true if latitude is in [-90, 90] and longitude in [-180, 180].
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Converts to geocentric coordinates.
    pub fn to_geocentric(&self) -> Vector {
        let e2 = eccentricity_squared();
        let lat = self.latitude.to_radians();
        let lon = self.longitude.to_radians();
        let n = SEMI_MAJOR / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        Vector::new(
            (n + self.altitude) * lat.cos() * lon.cos(),
            (n + self.altitude) * lat.cos() * lon.sin(),
            (n * (1.0 - e2) + self.altitude) * lat.sin(),
        )
    }

    /// Converts a geocentric position to geodetic coordinates.
    pub fn from_geocentric(gcc: &Vector) -> Self {
        let e2 = eccentricity_squared();
        let longitude = gcc.y.atan2(gcc.x);
        let p = (gcc.x * gcc.x + gcc.y * gcc.y).sqrt();

        // On the polar axis the longitude is arbitrary and the latitude is +/-90.
        if p < 1e-9 {
            let semi_minor = SEMI_MAJOR * (1.0 - FLATTENING);
            let latitude = if gcc.z >= 0.0 { 90.0 } else { -90.0 };
            return Self::new(latitude, 0.0, gcc.z.abs() - semi_minor);
        }

        let mut latitude = gcc.z.atan2(p * (1.0 - e2));
        let mut altitude = 0.0;
        for _ in 0..MAX_ITERATIONS {
            let n = SEMI_MAJOR / (1.0 - e2 * latitude.sin().powi(2)).sqrt();
            altitude = p / latitude.cos() - n;
            let next = gcc.z.atan2(p * (1.0 - e2 * n / (n + altitude)));
            let done = (next - latitude).abs() < 1e-14;
            latitude = next;
            if done {
                break;
            }
        }
        Self::new(latitude.to_degrees(), longitude.to_degrees(), altitude)
    }

    /// Returns the rate of change, in degrees (and meters) per second, of this position
    /// when moving with a geocentric `velocity` (meters per second).
    pub fn rate(&self, velocity: &Vector) -> Self {
        let next = Self::from_geocentric(&(self.to_geocentric() + *velocity));
        Self::new(
            next.latitude - self.latitude,
            next.longitude - self.longitude,
            next.altitude - self.altitude,
        )
    }
}

/// Orientation as reported by the federation: rotations (radians) of the geocentric
/// axes about z (psi), the new y (theta), and the new x (phi).
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct TaitBryan {
    pub psi: f64,
    pub theta: f64,
    pub phi: f64,
}

impl TaitBryan {
    pub const fn new(psi: f64, theta: f64, phi: f64) -> Self {
        Self { psi, theta, phi }
    }
}

/// Orientation of a node in whole degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Orientation {
    /// Clockwise from north, in `[0, 360)`.
    pub azimuth: i16,
    /// Above the local horizontal, in `[-90, 90]`.
    pub elevation: i16,
}

impl Orientation {
    /// Derives azimuth and elevation of an entity at `location` facing along the
    /// x-axis of its body frame.
    ///
    /// At the poles the azimuth is reported as 0. Roll (phi) does not affect the result.
    pub fn from_tait_bryan(location: &Geodetic, orientation: &TaitBryan) -> Self {
        let lat = location.latitude.to_radians();
        let lon = location.longitude.to_radians();

        // Unit vector from the earth center towards the entity.
        let up = Vector::new(lon.cos() * lat.cos(), lon.sin() * lat.cos(), lat.sin());

        // Body x-axis expressed in geocentric coordinates.
        let (psi, theta) = (orientation.psi, orientation.theta);
        let facing = Vector::new(
            psi.cos() * theta.cos(),
            psi.sin() * theta.cos(),
            -theta.sin(),
        );

        let dot = (up.x * facing.x + up.y * facing.y + up.z * facing.z).clamp(-1.0, 1.0);
        let elevation = (FRAC_PI_2 - dot.acos()).to_degrees().round().clamp(-90.0, 90.0);

        // Components of the facing vector along local east (east) and north (north).
        let east = -lon.sin() * facing.x + lon.cos() * facing.y;
        let north = (-lat).sin() * lon.cos() * facing.x
            + (-lat).sin() * lon.sin() * facing.y
            + (-lat).cos() * facing.z;
        let horizontal = (east * east + north * north).sqrt();
        let mut azimuth = 0.0;
        if horizontal > 0.0 {
            let mut angle = (north / horizontal).clamp(-1.0, 1.0).acos();
            if east < 0.0 {
                angle = 2.0 * PI - angle;
            }
            azimuth = angle.to_degrees().round();
            if azimuth >= 360.0 {
                azimuth = 0.0;
            }
        }

        Self {
            azimuth: azimuth as i16,
            elevation: elevation as i16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() <= tolerance
    }

    #[test]
    fn test_equator_prime_meridian() {
        let gcc = Geodetic::new(0.0, 0.0, 0.0).to_geocentric();
        assert!(close(gcc.x, SEMI_MAJOR, 1e-6));
        assert!(close(gcc.y, 0.0, 1e-6));
        assert!(close(gcc.z, 0.0, 1e-6));
    }

    #[test]
    fn test_geodetic_conversion_consistent() {
        for position in [
            Geodetic::new(37.5, -122.25, 120.0),
            Geodetic::new(-33.9, 151.2, 15.0),
            Geodetic::new(89.0, 45.0, 10_000.0),
            Geodetic::new(-60.0, 179.5, -20.0),
        ] {
            let back = Geodetic::from_geocentric(&position.to_geocentric());
            assert!(close(back.latitude, position.latitude, 1e-9));
            assert!(close(back.longitude, position.longitude, 1e-9));
            assert!(close(back.altitude, position.altitude, 1e-5));
            assert!(back.is_valid());
        }
    }

    #[test]
    fn test_pole() {
        let position = Geodetic::from_geocentric(&Vector::new(0.0, 0.0, 6_400_000.0));
        assert_eq!(position.latitude, 90.0);
        assert!(position.is_valid());
    }

    #[test]
    fn test_rate() {
        // Moving north at the equator increases latitude only.
        let position = Geodetic::new(0.0, 0.0, 0.0);
        let rate = position.rate(&Vector::new(0.0, 0.0, 100.0));
        assert!(rate.latitude > 0.0);
        assert!(close(rate.longitude, 0.0, 1e-12));
    }

    #[test]
    fn test_orientation_headings() {
        let origin = Geodetic::new(0.0, 0.0, 0.0);

        // Facing north: body x-axis along +z.
        let north = Orientation::from_tait_bryan(&origin, &TaitBryan::new(0.0, -FRAC_PI_2, 0.0));
        assert_eq!(north, Orientation { azimuth: 0, elevation: 0 });

        // Facing east: body x-axis along +y.
        let east = Orientation::from_tait_bryan(&origin, &TaitBryan::new(FRAC_PI_2, 0.0, 0.0));
        assert_eq!(east, Orientation { azimuth: 90, elevation: 0 });

        // Facing west: body x-axis along -y.
        let west = Orientation::from_tait_bryan(&origin, &TaitBryan::new(-FRAC_PI_2, 0.0, 0.0));
        assert_eq!(west, Orientation { azimuth: 270, elevation: 0 });

        // Facing straight up: elevation 90, azimuth undefined (0).
        let up = Orientation::from_tait_bryan(&origin, &TaitBryan::new(0.0, 0.0, 0.0));
        assert_eq!(up, Orientation { azimuth: 0, elevation: 90 });

        // Roll does not matter.
        let rolled = Orientation::from_tait_bryan(&origin, &TaitBryan::new(FRAC_PI_2, 0.0, 1.0));
        assert_eq!(rolled, east);
    }

    #[test]
    fn test_moved() {
        let a = Vector::new(1.0, 2.0, 3.0);
        assert!(!a.moved(&Vector::new(1.2, 2.0, 3.0), 0.5));
        assert!(a.moved(&Vector::new(1.5, 2.0, 3.0), 0.5));
        assert!(a.moved(&Vector::new(1.0, 2.0, 2.0), 0.5));
    }
}
