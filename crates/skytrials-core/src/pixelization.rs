//! Equal-area spherical pixelization and coordinate frames.
//!
//! Every component that touches the pixel grid goes through the [`Pixelization`]
//! trait, so the backend can be swapped without touching binning, p-value or
//! template code. The shipped backend is [`HealpixRing`], the HEALPix RING
//! ordering.
//!
//! Coordinates are `(dec, ra)` in radians: declination in [-π/2, π/2], right
//! ascension (or longitude) in [0, 2π).

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use cdshealpix::ring;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

/// A direction on the sphere, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub dec: f64,
    pub ra: f64,
}

impl SkyCoord {
    pub fn new(dec: f64, ra: f64) -> Self {
        Self { dec, ra }
    }

    /// Build from degrees.
    pub fn from_degrees(dec_deg: f64, ra_deg: f64) -> Self {
        Self {
            dec: dec_deg.to_radians(),
            ra: ra_deg.to_radians(),
        }
    }

    fn to_unit_vector(self) -> Vector3<f64> {
        let (sin_dec, cos_dec) = self.dec.sin_cos();
        let (sin_ra, cos_ra) = self.ra.sin_cos();
        Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
    }

    fn from_unit_vector(v: Vector3<f64>) -> Self {
        let dec = v.z.clamp(-1.0, 1.0).asin();
        let ra = v.y.atan2(v.x).rem_euclid(TAU);
        Self { dec, ra }
    }
}

/// Great-circle distance between two directions (radians).
///
/// Uses the spherical law of cosines. The cosine is clamped to [-1, 1] before
/// `acos`, so coincident positions give exactly zero instead of NaN.
pub fn angular_distance(a: SkyCoord, b: SkyCoord) -> f64 {
    let cos_dist = a.dec.sin() * b.dec.sin() + a.dec.cos() * b.dec.cos() * (a.ra - b.ra).cos();
    cos_dist.clamp(-1.0, 1.0).acos()
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Celestial coordinate frame of a map or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    #[default]
    Equatorial,
    Galactic,
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Equatorial => write!(f, "equatorial"),
            Frame::Galactic => write!(f, "galactic"),
        }
    }
}

/// J2000 equatorial -> galactic rotation (rows are the galactic axes).
fn equatorial_to_galactic() -> Matrix3<f64> {
    Matrix3::new(
        -0.054_875_560_416_215_4,
        -0.873_437_090_234_885_0,
        -0.483_835_015_548_713_2,
        0.494_109_427_875_583_7,
        -0.444_829_629_960_011_2,
        0.746_982_244_497_218_9,
        -0.867_666_149_019_004_7,
        -0.198_076_373_431_201_5,
        0.455_983_776_175_066_9,
    )
}

/// Rotate a direction from one frame into another.
pub fn rotate(from: Frame, to: Frame, coord: SkyCoord) -> SkyCoord {
    let v = coord.to_unit_vector();
    let rotated = match (from, to) {
        (Frame::Equatorial, Frame::Galactic) => equatorial_to_galactic() * v,
        (Frame::Galactic, Frame::Equatorial) => equatorial_to_galactic().transpose() * v,
        _ => return coord,
    };
    SkyCoord::from_unit_vector(rotated)
}

// ---------------------------------------------------------------------------
// Pixelization interface
// ---------------------------------------------------------------------------

/// An equal-area tessellation of the sphere parameterized by `nside`.
pub trait Pixelization {
    /// Number of pixels at this resolution.
    fn pixel_count(&self, nside: u32) -> usize;

    /// Center of pixel `index`. `index` must be below `pixel_count(nside)`.
    fn pixel_to_angle(&self, nside: u32, index: usize) -> SkyCoord;

    /// Pixel containing the direction `(dec, ra)`.
    fn angle_to_pixel(&self, nside: u32, dec: f64, ra: f64) -> usize;

    /// Rotate a direction between frames.
    fn rotate(&self, from: Frame, to: Frame, coord: SkyCoord) -> SkyCoord {
        rotate(from, to, coord)
    }

    /// Solid angle of one pixel (steradians).
    fn pixel_area(&self, nside: u32) -> f64 {
        4.0 * PI / self.pixel_count(nside) as f64
    }
}

/// HEALPix RING scheme, backed by `cdshealpix`.
///
/// Pixel centers on one iso-latitude ring share a bit-identical declination,
/// which declination binning relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealpixRing;

impl Pixelization for HealpixRing {
    fn pixel_count(&self, nside: u32) -> usize {
        ring::n_hash(nside) as usize
    }

    fn pixel_to_angle(&self, nside: u32, index: usize) -> SkyCoord {
        debug_assert!(
            index < self.pixel_count(nside),
            "pixel {index} out of range for nside {nside}"
        );
        let (lon, lat) = ring::center(nside, index as u64);
        SkyCoord { dec: lat, ra: lon }
    }

    fn angle_to_pixel(&self, nside: u32, dec: f64, ra: f64) -> usize {
        ring::hash(nside, ra.rem_euclid(TAU), dec.clamp(-FRAC_PI_2, FRAC_PI_2)) as usize
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_count() {
        let hp = HealpixRing;
        assert_eq!(hp.pixel_count(1), 12);
        assert_eq!(hp.pixel_count(128), 196_608);
        assert_eq!(hp.pixel_count(512), 3_145_728);
    }

    #[test]
    fn test_pixel_center_roundtrip() {
        let hp = HealpixRing;
        for nside in [1u32, 2, 4, 8, 16, 32] {
            for pix in 0..hp.pixel_count(nside) {
                let c = hp.pixel_to_angle(nside, pix);
                assert_eq!(
                    hp.angle_to_pixel(nside, c.dec, c.ra),
                    pix,
                    "nside={nside} pix={pix}"
                );
            }
        }
    }

    #[test]
    fn test_ring_declinations_are_identical() {
        let hp = HealpixRing;
        // First ring of nside=4 holds pixels 0..4, the equator ring starts at ncap.
        let decs: Vec<f64> = (0..4).map(|p| hp.pixel_to_angle(4, p).dec).collect();
        assert!(decs.iter().all(|d| d.to_bits() == decs[0].to_bits()));
        assert!(decs[0] > 0.0);
    }

    #[test]
    fn test_south_pole_direction_maps_to_last_ring() {
        let hp = HealpixRing;
        let pix = hp.angle_to_pixel(8, -FRAC_PI_2 + 1e-9, 0.1);
        assert!(pix >= hp.pixel_count(8) - 4);
    }

    #[test]
    fn test_angular_distance_coincident_is_zero() {
        let a = SkyCoord::from_degrees(-72.3, 145.0);
        let d = angular_distance(a, a);
        assert!(!d.is_nan());
        assert!(d.abs() < 1e-7);
    }

    #[test]
    fn test_angular_distance_known_value() {
        let a = SkyCoord::from_degrees(0.0, 0.0);
        let b = SkyCoord::from_degrees(0.0, 90.0);
        assert!((angular_distance(a, b) - FRAC_PI_2).abs() < 1e-12);
        let pole = SkyCoord::from_degrees(-90.0, 0.0);
        assert!((angular_distance(a, pole) - FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_galactic_center_rotation() {
        let gc = SkyCoord::from_degrees(0.0, 0.0);
        let eq = rotate(Frame::Galactic, Frame::Equatorial, gc);
        assert!((eq.ra.to_degrees() - 266.405).abs() < 1e-2);
        assert!((eq.dec.to_degrees() + 28.936).abs() < 1e-2);
    }

    #[test]
    fn test_rotation_roundtrip() {
        let c = SkyCoord::from_degrees(-63.2, 211.7);
        let back = rotate(
            Frame::Galactic,
            Frame::Equatorial,
            rotate(Frame::Equatorial, Frame::Galactic, c),
        );
        assert!((c.dec - back.dec).abs() < 1e-10);
        assert!((c.ra - back.ra).abs() < 1e-10);
    }

    #[test]
    fn test_same_frame_rotation_is_identity() {
        let c = SkyCoord::new(0.3, 1.2);
        assert_eq!(rotate(Frame::Galactic, Frame::Galactic, c), c);
    }

    #[test]
    fn test_known_pixel_centers() {
        let hp = HealpixRing;
        let first = hp.pixel_to_angle(1, 0);
        assert!((first.dec - (2.0f64 / 3.0).asin()).abs() < 1e-12);
        assert!((first.ra - FRAC_PI_2 / 2.0).abs() < 1e-12);
        let equator = hp.pixel_to_angle(1, 4);
        assert!(equator.dec.abs() < 1e-12);
        assert!(equator.ra.abs() < 1e-12);
        let last = hp.pixel_to_angle(1, 11);
        assert!((last.dec + (2.0f64 / 3.0).asin()).abs() < 1e-12);
    }

    #[test]
    fn test_every_ring_shares_one_declination() {
        let hp = HealpixRing;
        let nside = 16;
        let mut decs: Vec<f64> = (0..hp.pixel_count(nside))
            .map(|p| hp.pixel_to_angle(nside, p).dec)
            .collect();
        decs.dedup_by(|a, b| a.to_bits() == b.to_bits());
        assert_eq!(decs.len(), 4 * nside as usize - 1);
    }
}
