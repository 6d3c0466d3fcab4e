//! Declination binning of the pixel grid.
//!
//! The detector background does not depend on right ascension, so every pixel
//! on one iso-declination ring shares a single background trial pool. The
//! binner groups eligible pixels by their exact grid declination; bins are
//! ordered south to north and that order fixes the bin index used in job
//! output filenames.

use std::collections::HashSet;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pixelization::Pixelization;

// ---------------------------------------------------------------------------
// Eligibility cut
// ---------------------------------------------------------------------------

/// Open declination interval `(min_deg, max_deg)` of the field of view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeclinationCut {
    pub min_deg: f64,
    pub max_deg: f64,
}

impl DeclinationCut {
    pub fn new(min_deg: f64, max_deg: f64) -> Self {
        Self { min_deg, max_deg }
    }

    /// Whether a declination (radians) lies strictly inside the interval.
    pub fn contains(&self, dec: f64) -> bool {
        dec > self.min_deg.to_radians() && dec < self.max_deg.to_radians()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min_deg.is_finite() || !self.max_deg.is_finite() {
            return Err(Error::config("declination cut bounds must be finite"));
        }
        if self.min_deg >= self.max_deg {
            return Err(Error::config(format!(
                "declination cut ({}, {}) is empty",
                self.min_deg, self.max_deg
            )));
        }
        Ok(())
    }
}

impl Default for DeclinationCut {
    /// Detector acceptance: above -85° and below sin(dec) = -0.8.
    fn default() -> Self {
        Self {
            min_deg: -85.0,
            max_deg: (-0.8f64).asin().to_degrees(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bins
// ---------------------------------------------------------------------------

/// One declination value and the pixels sharing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclinationBin {
    /// Declination in radians.
    pub declination: f64,
    /// Pixel indices, ascending.
    pub pixels: Vec<usize>,
}

/// The persisted pixel→bin mapping for one grid and cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclinationBins {
    pub nside: u32,
    pub cut: DeclinationCut,
    pub bins: Vec<DeclinationBin>,
}

impl DeclinationBins {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn get(&self, bin: usize) -> Option<&DeclinationBin> {
        self.bins.get(bin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeclinationBin> {
        self.bins.iter()
    }

    /// Total number of eligible pixels.
    pub fn pixel_count(&self) -> usize {
        self.bins.iter().map(|b| b.pixels.len()).sum()
    }

    /// All eligible pixels, ascending.
    pub fn eligible_pixels(&self) -> Vec<usize> {
        let mut pixels: Vec<usize> = self
            .bins
            .iter()
            .flat_map(|b| b.pixels.iter().copied())
            .collect();
        pixels.sort_unstable();
        pixels
    }

    /// Bin holding `pixel`, or `None` when the pixel is outside the cut.
    pub fn bin_of(&self, pixel: usize) -> Option<usize> {
        self.bins
            .iter()
            .position(|b| b.pixels.binary_search(&pixel).is_ok())
    }

    /// Dense lookup table of length `npix`: `Some(bin)` for eligible pixels.
    pub fn pixel_lookup(&self, npix: usize) -> Vec<Option<usize>> {
        let mut lookup = vec![None; npix];
        for (i, bin) in self.bins.iter().enumerate() {
            for &pixel in &bin.pixels {
                if let Some(slot) = lookup.get_mut(pixel) {
                    *slot = Some(i);
                }
            }
        }
        lookup
    }

    /// Check that the bins form a partition of valid pixel indices.
    pub fn validate(&self, npix: usize) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.pixel_count());
        for (i, bin) in self.bins.iter().enumerate() {
            if bin.pixels.is_empty() {
                return Err(Error::validation(format!("declination bin {i} has no pixels")));
            }
            for &pixel in &bin.pixels {
                if pixel >= npix {
                    return Err(Error::validation(format!(
                        "pixel {pixel} in bin {i} is outside a grid of {npix} pixels"
                    )));
                }
                if !seen.insert(pixel) {
                    return Err(Error::validation(format!(
                        "pixel {pixel} appears in more than one declination bin"
                    )));
                }
            }
            if !bin.pixels.windows(2).all(|w| w[0] < w[1]) {
                return Err(Error::validation(format!("bin {i} pixels are not ascending")));
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let bins: DeclinationBins = serde_json::from_str(&raw)?;
        bins.validate(12 * bins.nside as usize * bins.nside as usize)?;
        Ok(bins)
    }

    /// Load a bin file, refusing one built for another grid or cut.
    pub fn load_checked(path: &Path, nside: u32, cut: DeclinationCut) -> Result<Self> {
        let bins = Self::load(path)?;
        if bins.nside != nside {
            return Err(Error::IncompatibleFile {
                path: path.to_path_buf(),
                message: format!("built for nside {}, expected {nside}", bins.nside),
            });
        }
        let same_cut = (bins.cut.min_deg - cut.min_deg).abs() <= 1e-9
            && (bins.cut.max_deg - cut.max_deg).abs() <= 1e-9;
        if !same_cut {
            return Err(Error::IncompatibleFile {
                path: path.to_path_buf(),
                message: format!(
                    "built for cut ({}, {}), expected ({}, {})",
                    bins.cut.min_deg, bins.cut.max_deg, cut.min_deg, cut.max_deg
                ),
            });
        }
        Ok(bins)
    }
}

// ---------------------------------------------------------------------------
// Binner
// ---------------------------------------------------------------------------

/// Builds [`DeclinationBins`] from a pixelization, resolution and cut.
#[derive(Debug, Clone)]
pub struct DeclinationBinner<P: Pixelization> {
    pixelization: P,
    nside: u32,
    cut: DeclinationCut,
}

impl<P: Pixelization> DeclinationBinner<P> {
    pub fn new(pixelization: P, nside: u32, cut: DeclinationCut) -> Self {
        Self {
            pixelization,
            nside,
            cut,
        }
    }

    /// Group eligible pixels by exact declination.
    ///
    /// Declinations are compared bit for bit: the grid produces identical values
    /// for pixels on one ring, and a tolerance would merge neighbouring rings at
    /// high resolution.
    pub fn build(&self) -> DeclinationBins {
        let npix = self.pixelization.pixel_count(self.nside);
        let mut eligible: Vec<(f64, usize)> = (0..npix)
            .filter_map(|pixel| {
                let dec = self.pixelization.pixel_to_angle(self.nside, pixel).dec;
                self.cut.contains(dec).then_some((dec, pixel))
            })
            .collect();
        eligible.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut bins: Vec<DeclinationBin> = Vec::new();
        for (dec, pixel) in eligible {
            match bins.last_mut() {
                Some(bin) if bin.declination == dec => bin.pixels.push(pixel),
                _ => bins.push(DeclinationBin {
                    declination: dec,
                    pixels: vec![pixel],
                }),
            }
        }

        info!(
            "nside {}: {} declination bins over {} eligible pixels",
            self.nside,
            bins.len(),
            bins.iter().map(|b| b.pixels.len()).sum::<usize>()
        );

        DeclinationBins {
            nside: self.nside,
            cut: self.cut,
            bins,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixelization::HealpixRing;

    fn bins(nside: u32) -> DeclinationBins {
        DeclinationBinner::new(HealpixRing, nside, DeclinationCut::default()).build()
    }

    #[test]
    fn test_default_cut_bounds() {
        let cut = DeclinationCut::default();
        assert!((cut.max_deg + 53.130_102_354_155_98).abs() < 1e-9);
        assert!(cut.contains((-60.0f64).to_radians()));
        assert!(!cut.contains((-85.0f64).to_radians()));
        assert!(!cut.contains((-86.0f64).to_radians()));
        assert!(!cut.contains((-50.0f64).to_radians()));
    }

    #[test]
    fn test_bin_counts_per_resolution() {
        assert_eq!(bins(64).len(), 43);
        assert_eq!(bins(128).len(), 86);
    }

    #[test]
    fn test_bins_ascend_in_declination() {
        let b = bins(64);
        assert!(b.bins.windows(2).all(|w| w[0].declination < w[1].declination));
    }

    #[test]
    fn test_bins_partition_eligible_pixels() {
        let b = bins(32);
        let hp = HealpixRing;
        let expected: Vec<usize> = (0..hp.pixel_count(32))
            .filter(|&p| DeclinationCut::default().contains(hp.pixel_to_angle(32, p).dec))
            .collect();
        assert_eq!(b.eligible_pixels(), expected);
        assert!(b.validate(hp.pixel_count(32)).is_ok());
    }

    #[test]
    fn test_build_is_idempotent() {
        assert_eq!(bins(32), bins(32));
    }

    #[test]
    fn test_bin_of_and_lookup_agree() {
        let b = bins(16);
        let lookup = b.pixel_lookup(HealpixRing.pixel_count(16));
        for (pixel, slot) in lookup.iter().enumerate() {
            assert_eq!(*slot, b.bin_of(pixel));
        }
    }

    #[test]
    fn test_cut_excluding_everything_gives_no_bins() {
        let b = DeclinationBinner::new(HealpixRing, 4, DeclinationCut::new(10.0, 10.5)).build();
        assert!(b.is_empty());
        assert_eq!(b.pixel_count(), 0);
    }

    #[test]
    fn test_save_and_load_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bins").join("dec_bins.json");
        let b = bins(16);
        b.save(&path).unwrap();

        let loaded = DeclinationBins::load_checked(&path, 16, DeclinationCut::default()).unwrap();
        assert_eq!(loaded, b);

        let wrong_nside = DeclinationBins::load_checked(&path, 32, DeclinationCut::default());
        assert!(matches!(wrong_nside, Err(Error::IncompatibleFile { .. })));

        let wrong_cut = DeclinationBins::load_checked(&path, 16, DeclinationCut::new(-80.0, -60.0));
        assert!(matches!(wrong_cut, Err(Error::IncompatibleFile { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_pixel() {
        let b = DeclinationBins {
            nside: 1,
            cut: DeclinationCut::default(),
            bins: vec![
                DeclinationBin {
                    declination: -1.0,
                    pixels: vec![8, 9],
                },
                DeclinationBin {
                    declination: -0.9,
                    pixels: vec![9],
                },
            ],
        };
        assert!(b.validate(12).is_err());
    }
}
