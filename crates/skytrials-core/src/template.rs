//! Source templates: joint directional densities from uncertain positions.
//!
//! Each event contributes a Gaussian in angular distance whose width is its
//! positional uncertainty. Kernels are normalized over the sphere, so each
//! event integrates to one, and the sum is divided by the event count. The
//! result is a probability density handed to the likelihood engine as a
//! spatial prior.

use std::f64::consts::{PI, TAU};

use log::info;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;
use crate::error::{Error, Result};
use crate::pixelization::{Frame, Pixelization, SkyCoord, angular_distance};
use crate::pvalue::SkyMap;

/// Simpson intervals used for the kernel normalization.
const NORM_STEPS: usize = 2000;

/// Sphere integral of exp(-θ²/2σ²): 2π ∫ exp(-θ²/2σ²) sin θ dθ.
///
/// The integrand is negligible beyond 12σ, so the range is cut there to keep
/// narrow kernels resolved.
fn kernel_norm(sigma: f64) -> f64 {
    let upper = (12.0 * sigma).min(PI);
    let h = upper / NORM_STEPS as f64;
    let f = |theta: f64| (-theta * theta / (2.0 * sigma * sigma)).exp() * theta.sin();
    let mut sum = f(0.0) + f(upper);
    for i in 1..NORM_STEPS {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(i as f64 * h);
    }
    TAU * sum * h / 3.0
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event record as stored on disk (degrees, equatorial).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ra: f64,
    pub dec: f64,
    /// Positional uncertainty.
    pub err: f64,
}

/// One kernel center with its width (radians).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateEvent {
    coord: SkyCoord,
    sigma: f64,
    norm: f64,
}

impl TemplateEvent {
    pub fn new(coord: SkyCoord, sigma: f64) -> Result<Self> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::validation(format!(
                "event width {sigma} must be positive and finite"
            )));
        }
        Ok(Self {
            coord,
            sigma,
            norm: kernel_norm(sigma),
        })
    }

    /// Event from a stored record, with its uncertainty multiplied by `error_scale`.
    pub fn from_record(record: &EventRecord, error_scale: f64) -> Result<Self> {
        Self::new(
            SkyCoord::from_degrees(record.dec, record.ra),
            (record.err * error_scale).to_radians(),
        )
    }

    /// Catalog source smeared by its extent and the detector resolution.
    pub fn from_catalog(entry: &CatalogEntry, resolution_deg: f64) -> Result<Self> {
        let width_deg = entry.extent_deg.hypot(resolution_deg);
        Self::new(entry.coord, width_deg.to_radians())
    }

    pub fn coord(&self) -> SkyCoord {
        self.coord
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Normalized kernel value at `coord`.
    pub fn kernel(&self, coord: SkyCoord) -> f64 {
        let d = angular_distance(self.coord, coord);
        (-d * d / (2.0 * self.sigma * self.sigma)).exp() / self.norm
    }
}

/// Mean kernel density of `events` at `coord`; zero when `events` is empty.
pub fn density_at(events: &[TemplateEvent], coord: SkyCoord) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    events.iter().map(|e| e.kernel(coord)).sum::<f64>() / events.len() as f64
}

// ---------------------------------------------------------------------------
// Density maps
// ---------------------------------------------------------------------------

/// A pixelized density in a given frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityMap {
    pub nside: u32,
    pub frame: Frame,
    pub values: Vec<f64>,
}

impl DensityMap {
    /// Area-weighted sum over all pixels.
    pub fn integral<P: Pixelization>(&self, pixelization: &P) -> f64 {
        self.values.iter().sum::<f64>() * pixelization.pixel_area(self.nside)
    }

    /// Nearest-pixel re-projection into another frame.
    pub fn reproject<P: Pixelization>(&self, pixelization: &P, to: Frame) -> DensityMap {
        if to == self.frame {
            return self.clone();
        }
        let npix = pixelization.pixel_count(self.nside);
        let values = (0..npix)
            .map(|pixel| {
                let center = pixelization.pixel_to_angle(self.nside, pixel);
                let source = pixelization.rotate(to, self.frame, center);
                let index = pixelization.angle_to_pixel(self.nside, source.dec, source.ra);
                self.values.get(index).copied().unwrap_or(0.0)
            })
            .collect();
        DensityMap {
            nside: self.nside,
            frame: to,
            values,
        }
    }

    pub fn to_sky_map(&self) -> SkyMap {
        SkyMap::new(self.nside, Some(self.frame), self.values.clone())
    }

    pub fn from_sky_map(map: SkyMap) -> Result<Self> {
        map.validate()?;
        Ok(Self {
            nside: map.nside,
            frame: map.frame.unwrap_or_default(),
            values: map.values,
        })
    }
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

/// Evaluates the joint event density on a pixel grid.
#[derive(Debug, Clone)]
pub struct TemplateCombiner<P: Pixelization> {
    pixelization: P,
    nside: u32,
}

impl<P: Pixelization> TemplateCombiner<P> {
    pub fn new(pixelization: P, nside: u32) -> Self {
        Self {
            pixelization,
            nside,
        }
    }

    /// Density of equatorial `events` on a grid laid out in `frame`.
    ///
    /// Pixel centers are rotated into the equatorial frame before evaluation,
    /// so no re-projection error is introduced.
    pub fn build(&self, events: &[TemplateEvent], frame: Frame) -> Result<DensityMap> {
        if events.is_empty() {
            return Err(Error::validation("a template needs at least one event"));
        }
        let npix = self.pixelization.pixel_count(self.nside);
        let values: Vec<f64> = (0..npix)
            .map(|pixel| {
                let center = self.pixelization.pixel_to_angle(self.nside, pixel);
                let equatorial = self.pixelization.rotate(frame, Frame::Equatorial, center);
                density_at(events, equatorial)
            })
            .collect();

        let map = DensityMap {
            nside: self.nside,
            frame,
            values,
        };
        info!(
            "template: {} events on nside {} ({frame}), integral {:.6}",
            events.len(),
            self.nside,
            map.integral(&self.pixelization)
        );
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
