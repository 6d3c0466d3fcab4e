//! Source catalogs stored as parallel arrays.
//!
//! A catalog file is a JSON object of equal-length arrays, angles in degrees:
//! `{ name, ra, dec, flux, flux_err, spectral_index, spectral_index_err, extent? }`.
//! Unknown values (for example an unmeasured spectral index) are `null` and load
//! as NaN.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pixelization::SkyCoord;

mod nan_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|v| v.is_finite().then_some(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let raw = Vec::<Option<f64>>::deserialize(d)?;
        Ok(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

/// Symmetrized extent of an elliptical source: sqrt((a² + b²) / 2).
pub fn symmetric_extent(major: f64, minor: f64) -> f64 {
    ((major * major + minor * minor) / 2.0).sqrt()
}

/// A catalog of candidate sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub name: Vec<String>,
    pub ra: Vec<f64>,
    pub dec: Vec<f64>,
    #[serde(with = "nan_vec")]
    pub flux: Vec<f64>,
    #[serde(with = "nan_vec")]
    pub flux_err: Vec<f64>,
    #[serde(with = "nan_vec")]
    pub spectral_index: Vec<f64>,
    #[serde(with = "nan_vec")]
    pub spectral_index_err: Vec<f64>,
    /// Angular extent in degrees; point sources when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<Vec<f64>>,
}

/// One row of a [`SourceCatalog`].
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub coord: SkyCoord,
    pub flux: f64,
    pub flux_err: f64,
    pub spectral_index: f64,
    pub spectral_index_err: f64,
    /// Degrees; zero for point sources.
    pub extent_deg: f64,
}

impl SourceCatalog {
    pub fn len(&self) -> usize {
        self.name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Check that every column has one value per source.
    pub fn validate(&self) -> Result<()> {
        let n = self.name.len();
        let columns = [
            ("ra", self.ra.len()),
            ("dec", self.dec.len()),
            ("flux", self.flux.len()),
            ("flux_err", self.flux_err.len()),
            ("spectral_index", self.spectral_index.len()),
            ("spectral_index_err", self.spectral_index_err.len()),
        ];
        for (column, len) in columns
            .into_iter()
            .chain(self.extent.as_ref().map(|e| ("extent", e.len())))
        {
            if len != n {
                return Err(Error::Catalog(format!(
                    "column {column} has {len} entries for {n} sources"
                )));
            }
        }
        if let Some(i) = (0..n).find(|&i| !self.ra[i].is_finite() || !self.dec[i].is_finite()) {
            return Err(Error::Catalog(format!("source {} has no position", self.name[i])));
        }
        if let Some(i) = (0..n).find(|&i| !(-90.0..=90.0).contains(&self.dec[i])) {
            return Err(Error::Catalog(format!(
                "source {} has declination {} outside [-90, 90]",
                self.name[i], self.dec[i]
            )));
        }
        Ok(())
    }

    /// Set extents from elliptical major and minor axes (degrees).
    pub fn set_extents(&mut self, major: &[f64], minor: &[f64]) -> Result<()> {
        if major.len() != self.len() || minor.len() != self.len() {
            return Err(Error::Catalog(format!(
                "{} major and {} minor axes for {} sources",
                major.len(),
                minor.len(),
                self.len()
            )));
        }
        self.extent = Some(
            major
                .iter()
                .zip(minor)
                .map(|(a, b)| symmetric_extent(*a, *b))
                .collect(),
        );
        Ok(())
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        (0..self.len())
            .map(|i| CatalogEntry {
                name: self.name[i].clone(),
                coord: SkyCoord::from_degrees(self.dec[i], self.ra[i]),
                flux: self.flux[i],
                flux_err: self.flux_err[i],
                spectral_index: self.spectral_index[i],
                spectral_index_err: self.spectral_index_err[i],
                extent_deg: self.extent.as_ref().map_or(0.0, |e| e[i]),
            })
            .collect()
    }

    pub fn positions(&self) -> Vec<SkyCoord> {
        self.ra
            .iter()
            .zip(&self.dec)
            .map(|(ra, dec)| SkyCoord::from_degrees(*dec, *ra))
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: SourceCatalog = serde_json::from_str(&raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
