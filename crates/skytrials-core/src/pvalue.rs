//! Empirical p-values from background trial pools.
//!
//! Every eligible pixel is compared against the pool of its declination bin.
//! Pixels that cannot get a p-value are tagged rather than filled with a number:
//! [`PValue::EmptyPool`] when their bin has no trials, [`PValue::Unseen`] when
//! they lie outside the field of view or carry no observed TS. When a map is
//! written out, both become the [`UNSEEN`] sentinel, which no real p-value in
//! [0, 1] can collide with.

use std::fmt;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::binning::DeclinationBins;
use crate::error::{Error, Result};
use crate::pixelization::{Frame, Pixelization, SkyCoord};
use crate::trials::BackgroundPool;

/// Sentinel marking pixels without a value in persisted maps.
pub const UNSEEN: f64 = -1.6375e30;

/// Whether a map value is the [`UNSEEN`] sentinel.
pub fn is_unseen(value: f64) -> bool {
    (value - UNSEEN).abs() <= UNSEEN.abs() * 1e-6
}

// ---------------------------------------------------------------------------
// Tagged p-value
// ---------------------------------------------------------------------------

/// Which background trials count as "at least as signal-like".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailRule {
    /// Trials with TS >= observed. Used for sky maps.
    #[default]
    AtLeast,
    /// Trials with TS > observed. Used for single-source and post-trial tests.
    Exceeding,
}

impl fmt::Display for TailRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TailRule::AtLeast => write!(f, "at_least"),
            TailRule::Exceeding => write!(f, "exceeding"),
        }
    }
}

/// P-value of one pixel or source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PValue {
    Value(f64),
    /// The matching background pool has no trials.
    EmptyPool,
    /// Outside the eligible region, or no observed TS.
    Unseen,
}

impl PValue {
    pub fn value(self) -> Option<f64> {
        match self {
            PValue::Value(p) => Some(p),
            PValue::EmptyPool | PValue::Unseen => None,
        }
    }

    /// Value as written to a map file.
    pub fn to_map_value(self) -> f64 {
        self.value().unwrap_or(UNSEEN)
    }

    /// One-sided Gaussian significance in σ.
    ///
    /// p = 0 maps to +∞: no background trial reached the observed TS, so the
    /// significance is only bounded by the pool size.
    pub fn significance(self) -> Option<f64> {
        let p = self.value()?;
        if p <= 0.0 {
            return Some(f64::INFINITY);
        }
        if p >= 1.0 {
            return Some(f64::NEG_INFINITY);
        }
        let normal = Normal::standard();
        Some(-normal.inverse_cdf(p))
    }
}

// ---------------------------------------------------------------------------
// Sky maps
// ---------------------------------------------------------------------------

/// A pixelized map as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyMap {
    pub nside: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
    pub values: Vec<f64>,
}

impl SkyMap {
    pub fn new(nside: u32, frame: Option<Frame>, values: Vec<f64>) -> Self {
        Self {
            nside,
            frame,
            values,
        }
    }

    /// Check the value count against `12·nside²`.
    pub fn validate(&self) -> Result<()> {
        let npix = 12 * self.nside as usize * self.nside as usize;
        if self.values.len() != npix {
            return Err(Error::shape(
                format!("map at nside {}", self.nside),
                npix,
                self.values.len(),
            ));
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
        let map: SkyMap = serde_json::from_str(&raw)?;
        map.validate()?;
        Ok(map)
    }
}

/// Pixel accounting of a p-value map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSummary {
    pub pixels: usize,
    pub evaluated: usize,
    pub empty_pool: usize,
    pub unseen: usize,
    /// Smallest p-value among evaluated pixels.
    pub min_p: Option<f64>,
}

/// Per-pixel p-values at one resolution.
#[derive(Debug, Clone)]
pub struct PValueMap {
    pub nside: u32,
    pub values: Vec<PValue>,
}

impl PValueMap {
    pub fn summary(&self) -> MapSummary {
        let mut summary = MapSummary {
            pixels: self.values.len(),
            ..MapSummary::default()
        };
        for value in &self.values {
            match value {
                PValue::Value(p) => {
                    summary.evaluated += 1;
                    summary.min_p = Some(summary.min_p.map_or(*p, |m| m.min(*p)));
                }
                PValue::EmptyPool => summary.empty_pool += 1,
                PValue::Unseen => summary.unseen += 1,
            }
        }
        summary
    }

    pub fn to_sky_map(&self) -> SkyMap {
        SkyMap::new(
            self.nside,
            None,
            self.values.iter().map(|p| p.to_map_value()).collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Converts observed TS values into p-values using per-bin pools.
pub struct PValueMapper<'a> {
    bins: &'a DeclinationBins,
    pools: &'a [BackgroundPool],
    rule: TailRule,
}

impl<'a> PValueMapper<'a> {
    /// `pools[i]` must be the pool of bin `i`.
    pub fn new(bins: &'a DeclinationBins, pools: &'a [BackgroundPool]) -> Result<Self> {
        if pools.len() != bins.len() {
            return Err(Error::shape("background pool list", bins.len(), pools.len()));
        }
        Ok(Self {
            bins,
            pools,
            rule: TailRule::AtLeast,
        })
    }

    pub fn with_rule(mut self, rule: TailRule) -> Self {
        self.rule = rule;
        self
    }

    /// P-value map for a full-sky TS map.
    ///
    /// Each bin's pixels are evaluated together against that bin's pool.
    pub fn map(&self, ts_map: &SkyMap) -> Result<PValueMap> {
        if ts_map.nside != self.bins.nside {
            return Err(Error::validation(format!(
                "TS map has nside {}, declination bins were built for nside {}",
                ts_map.nside, self.bins.nside
            )));
        }
        ts_map.validate()?;

        let mut values = vec![PValue::Unseen; ts_map.values.len()];
        let mut empty_bins = 0usize;
        for (bin, pool) in self.bins.iter().zip(self.pools) {
            if pool.is_empty() {
                empty_bins += 1;
            }
            let ts: Vec<f64> = bin.pixels.iter().map(|&p| ts_map.values[p]).collect();
            for (&pixel, p) in bin.pixels.iter().zip(pool.p_values(&ts, self.rule)) {
                values[pixel] = p;
            }
        }
        if empty_bins > 0 {
            warn!("{empty_bins} declination bins have empty background pools");
        }

        let map = PValueMap {
            nside: ts_map.nside,
            values,
        };
        let summary = map.summary();
        info!(
            "p-value map: {} evaluated, {} empty pool, {} unseen",
            summary.evaluated, summary.empty_pool, summary.unseen
        );
        Ok(map)
    }

    /// P-values for sources at `positions` with observed `ts`.
    pub fn source_p_values<P: Pixelization>(
        &self,
        pixelization: &P,
        positions: &[SkyCoord],
        ts: &[f64],
    ) -> Result<Vec<PValue>> {
        if positions.len() != ts.len() {
            return Err(Error::shape("source TS list", positions.len(), ts.len()));
        }
        Ok(positions
            .iter()
            .zip(ts)
            .map(|(pos, &t)| {
                let pixel = pixelization.angle_to_pixel(self.bins.nside, pos.dec, pos.ra);
                match self.bins.bin_of(pixel) {
                    Some(bin) => self.pools[bin].p_value_with(t, self.rule),
                    None => PValue::Unseen,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Hotspot
// ---------------------------------------------------------------------------

/// The most significant eligible pixel of a TS map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub pixel: usize,
    pub bin: usize,
    pub coord: SkyCoord,
    pub ts: f64,
}

/// Maximum-TS eligible pixel; ties go to the lowest pixel index.
pub fn hottest_pixel<P: Pixelization>(
    pixelization: &P,
    ts_map: &SkyMap,
    bins: &DeclinationBins,
) -> Option<Hotspot> {
    let mut best: Option<(usize, usize, f64)> = None;
    for (bin_index, bin) in bins.iter().enumerate() {
        for &pixel in &bin.pixels {
            let Some(&ts) = ts_map.values.get(pixel) else {
                continue;
            };
            if !ts.is_finite() || is_unseen(ts) {
                continue;
            }
            let better = match best {
                None => true,
                Some((p, _, t)) => ts > t || (ts == t && pixel < p),
            };
            if better {
                best = Some((pixel, bin_index, ts));
            }
        }
    }
    best.map(|(pixel, bin, ts)| Hotspot {
        pixel,
        bin,
        coord: pixelization.pixel_to_angle(ts_map.nside, pixel),
        ts,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::{DeclinationBinner, DeclinationCut};
    use crate::pixelization::HealpixRing;

    fn setup(nside: u32) -> (DeclinationBins, Vec<BackgroundPool>) {
        let bins = DeclinationBinner::new(HealpixRing, nside, DeclinationCut::default()).build();
        let pools = (0..bins.len())
            .map(|i| {
                let values = (0..100).map(|k| f64::from(k) * 0.1 + i as f64).collect();
                BackgroundPool::from_values(values)
            })
            .collect();
        (bins, pools)
    }

    #[test]
    fn test_unseen_is_not_a_p_value() {
        assert!(is_unseen(UNSEEN));
        assert!(!is_unseen(1.0));
        assert!(!is_unseen(0.0));
        assert_eq!(PValue::EmptyPool.to_map_value(), UNSEEN);
        assert_eq!(PValue::Value(1.0).to_map_value(), 1.0);
    }

    #[test]
    fn test_significance() {
        let z = PValue::Value(0.001_349_898).significance().unwrap();
        assert!((z - 3.0).abs() < 1e-4);
        assert_eq!(PValue::Value(0.0).significance(), Some(f64::INFINITY));
        assert!((PValue::Value(0.5).significance().unwrap()).abs() < 1e-12);
        assert_eq!(PValue::Unseen.significance(), None);
    }

    #[test]
    fn test_mapper_rejects_pool_count_mismatch() {
        let (bins, mut pools) = setup(16);
        pools.pop();
        assert!(matches!(
            PValueMapper::new(&bins, &pools),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_map_tags_ineligible_and_empty_pixels() {
        let (bins, mut pools) = setup(16);
        pools[0] = BackgroundPool::new();
        let npix = HealpixRing.pixel_count(16);
        let mut ts = vec![5.0; npix];
        let eligible_pixel = bins.bins[1].pixels[0];
        ts[eligible_pixel] = UNSEEN;
        let map = PValueMapper::new(&bins, &pools)
            .unwrap()
            .map(&SkyMap::new(16, None, ts))
            .unwrap();

        assert_eq!(map.values[0], PValue::Unseen);
        assert_eq!(map.values[bins.bins[0].pixels[0]], PValue::EmptyPool);
        assert_eq!(map.values[eligible_pixel], PValue::Unseen);

        let summary = map.summary();
        assert_eq!(summary.pixels, npix);
        assert_eq!(summary.empty_pool, bins.bins[0].pixels.len());
        assert_eq!(summary.evaluated + summary.empty_pool + summary.unseen, npix);

        let sky = map.to_sky_map();
        assert!(sky.values.iter().all(|v| is_unseen(*v) || (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_map_uses_pool_of_pixel_bin() {
        let (bins, pools) = setup(16);
        let npix = HealpixRing.pixel_count(16);
        let mut ts = vec![UNSEEN; npix];
        // Bin 2 pool holds 2.0..=11.9; TS 7.0 leaves 50 of 100 trials at or above.
        let pixel = bins.bins[2].pixels[3];
        ts[pixel] = 7.0;
        let map = PValueMapper::new(&bins, &pools)
            .unwrap()
            .map(&SkyMap::new(16, None, ts))
            .unwrap();
        assert_eq!(map.values[pixel], PValue::Value(0.5));
    }

    #[test]
    fn test_map_rejects_wrong_resolution_or_shape() {
        let (bins, pools) = setup(16);
        let mapper = PValueMapper::new(&bins, &pools).unwrap();
        assert!(mapper.map(&SkyMap::new(32, None, vec![0.0; 12 * 32 * 32])).is_err());
        assert!(matches!(
            mapper.map(&SkyMap::new(16, None, vec![0.0; 10])),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_source_p_values() {
        let (bins, pools) = setup(16);
        let mapper = PValueMapper::new(&bins, &pools).unwrap().with_rule(TailRule::Exceeding);
        let inside = HealpixRing.pixel_to_angle(16, bins.bins[0].pixels[0]);
        let outside = SkyCoord::from_degrees(10.0, 20.0);
        let p = mapper
            .source_p_values(&HealpixRing, &[inside, outside], &[50.0, 1.0])
            .unwrap();
        assert_eq!(p[0], PValue::Value(0.0));
        assert_eq!(p[1], PValue::Unseen);

        assert!(mapper.source_p_values(&HealpixRing, &[inside], &[]).is_err());
    }

    #[test]
    fn test_hottest_pixel_ignores_ineligible_region() {
        let (bins, _) = setup(16);
        let npix = HealpixRing.pixel_count(16);
        let mut ts = vec![0.0; npix];
        ts[0] = 100.0;
        let a = bins.bins[3].pixels[1];
        let b = bins.bins[5].pixels[0];
        ts[a] = 12.0;
        ts[b] = 12.0;
        let spot = hottest_pixel(&HealpixRing, &SkyMap::new(16, None, ts), &bins).unwrap();
        assert_eq!(spot.pixel, a.min(b));
        assert_eq!(spot.ts, 12.0);
        assert!(DeclinationCut::default().contains(spot.coord.dec));
    }

    #[test]
    fn test_sky_map_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts.json");
        let map = SkyMap::new(1, Some(Frame::Galactic), (0..12).map(f64::from).collect());
        map.save(&path).unwrap();
        assert_eq!(SkyMap::load(&path).unwrap(), map);
    }
}
