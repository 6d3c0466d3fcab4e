//! Analysis configuration.
//!
//! One [`AnalysisConfig`] value is built at startup (defaults, or a JSON file)
//! and handed to each component. Nothing in the crate reads global state or
//! hard-coded path prefixes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::binning::DeclinationCut;
use crate::error::{Error, Result};
use crate::pixelization::Frame;
use crate::sensitivity::CurveFamily;

/// Top-level configuration. Missing sections in a config file take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Root directory of derived artifacts (bins, manifests, maps, caches).
    pub output_dir: PathBuf,
    pub binning: BinningConfig,
    pub background: BackgroundConfig,
    pub sensitivity: SensitivityConfig,
    pub template: TemplateConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("skytrials-output"),
            binning: BinningConfig::default(),
            background: BackgroundConfig::default(),
            sensitivity: SensitivityConfig::default(),
            template: TemplateConfig::default(),
        }
    }
}

/// Declination binning of the analysis grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    pub nside: u32,
    pub cut: DeclinationCut,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            nside: 512,
            cut: DeclinationCut::default(),
        }
    }
}

/// Background scramble job layout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub jobs_per_bin: usize,
    pub trials_per_job: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            jobs_per_bin: 10,
            trials_per_job: 1000,
        }
    }
}

/// Sensitivity and discovery-potential fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    pub family: CurveFamily,
    /// Pass-fraction defining the sensitivity.
    pub sensitivity_fraction: f64,
    /// Pass-fraction defining the discovery potential.
    pub discovery_fraction: f64,
    /// Background p-value of the TS threshold counted for the sensitivity.
    pub sensitivity_alpha: f64,
    /// Background p-value of the TS threshold counted for the discovery
    /// potential (5σ one-sided).
    pub discovery_alpha: f64,
    /// Injected mean signal counts planned by `plan-injection`.
    pub mu_grid: Vec<f64>,
    pub jobs_per_level: usize,
    pub max_iterations: usize,
    /// Relative chi-square change at which the fit stops.
    pub tolerance: f64,
    /// Largest chi-square per degree of freedom accepted from a fit.
    pub max_reduced_chi2: f64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            family: CurveFamily::default(),
            sensitivity_fraction: 0.9,
            discovery_fraction: 0.5,
            sensitivity_alpha: 0.5,
            discovery_alpha: 2.87e-7,
            mu_grid: (0..=10).map(|i| f64::from(i) * 10.0).collect(),
            jobs_per_level: 1,
            max_iterations: 200,
            tolerance: 1e-12,
            max_reduced_chi2: 100.0,
        }
    }
}

/// Source template construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub nside: u32,
    /// Multiplier applied to every event's positional uncertainty.
    pub error_scale: f64,
    /// Frame of the written density map.
    pub frame: Frame,
    /// Angular resolution (degrees) added in quadrature to catalog extents.
    pub resolution_deg: f64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            nside: 256,
            error_scale: 1.0,
            frame: Frame::Equatorial,
            resolution_deg: 0.5,
        }
    }
}

impl AnalysisConfig {
    /// Load a JSON configuration file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        check_nside("binning.nside", self.binning.nside)?;
        check_nside("template.nside", self.template.nside)?;
        self.binning.cut.validate()?;

        for (name, value) in [
            ("sensitivity.sensitivity_fraction", self.sensitivity.sensitivity_fraction),
            ("sensitivity.discovery_fraction", self.sensitivity.discovery_fraction),
            ("sensitivity.sensitivity_alpha", self.sensitivity.sensitivity_alpha),
            ("sensitivity.discovery_alpha", self.sensitivity.discovery_alpha),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::config(format!("{name} must lie in (0, 1), got {value}")));
            }
        }
        if self.sensitivity.max_iterations == 0 {
            return Err(Error::config("sensitivity.max_iterations must be positive"));
        }
        if !(self.sensitivity.tolerance > 0.0) {
            return Err(Error::config("sensitivity.tolerance must be positive"));
        }
        if !(self.sensitivity.max_reduced_chi2 > 0.0) {
            return Err(Error::config("sensitivity.max_reduced_chi2 must be positive"));
        }
        if self.sensitivity.mu_grid.iter().any(|mu| !mu.is_finite() || *mu < 0.0) {
            return Err(Error::config("sensitivity.mu_grid must hold finite, non-negative values"));
        }
        if self.background.jobs_per_bin == 0 || self.sensitivity.jobs_per_level == 0 {
            return Err(Error::config("job counts must be positive"));
        }
        if !(self.template.error_scale > 0.0) {
            return Err(Error::config("template.error_scale must be positive"));
        }
        if !(self.template.resolution_deg >= 0.0) {
            return Err(Error::config("template.resolution_deg must be non-negative"));
        }
        Ok(())
    }

    /// Declination-bin file for the configured grid.
    pub fn bins_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("dec_bins_nside{}.json", self.binning.nside))
    }

    /// Directory holding background job outputs.
    pub fn background_dir(&self) -> PathBuf {
        self.output_dir.join("background")
    }

    /// Directory holding injection job outputs.
    pub fn injection_dir(&self) -> PathBuf {
        self.output_dir.join("injection")
    }

    pub fn background_manifest_path(&self) -> PathBuf {
        self.output_dir.join("background_manifest.json")
    }

    pub fn injection_manifest_path(&self) -> PathBuf {
        self.output_dir.join("injection_manifest.json")
    }

    /// Per-bin TS thresholds handed to injection jobs.
    pub fn thresholds_path(&self) -> PathBuf {
        self.output_dir.join("ts_thresholds.json")
    }

    /// Persisted sensitivity results.
    pub fn sensitivity_cache_path(&self) -> PathBuf {
        self.output_dir.join("sensitivity_cache.json")
    }
}

fn check_nside(name: &str, nside: u32) -> Result<()> {
    if nside == 0 || !nside.is_power_of_two() {
        return Err(Error::config(format!(
            "{name} must be a positive power of two, got {nside}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.binning.nside, 512);
        assert_eq!(config.sensitivity.mu_grid.len(), 11);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"binning": {"nside": 128}}"#).unwrap();

        let config = AnalysisConfig::load(&path).unwrap();
        assert_eq!(config.binning.nside, 128);
        assert_eq!(config.binning.cut, DeclinationCut::default());
        assert_eq!(config.template.nside, 256);
        assert!((config.sensitivity.sensitivity_fraction - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AnalysisConfig::default();
        config.sensitivity.family = CurveFamily::Logistic;
        config.template.frame = Frame::Galactic;
        config.save(&path).unwrap();

        let loaded = AnalysisConfig::load(&path).unwrap();
        assert_eq!(loaded.sensitivity.family, CurveFamily::Logistic);
        assert_eq!(loaded.template.frame, Frame::Galactic);
    }

    #[test]
    fn test_rejects_bad_nside() {
        let mut config = AnalysisConfig::default();
        config.binning.nside = 100;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.binning.nside = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_fraction_outside_unit_interval() {
        let mut config = AnalysisConfig::default();
        config.sensitivity.discovery_fraction = 1.0;
        assert!(config.validate().is_err());
        config.sensitivity.discovery_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_chi2_limit() {
        let mut config = AnalysisConfig::default();
        config.sensitivity.max_reduced_chi2 = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.sensitivity.max_reduced_chi2 = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_cut() {
        let mut config = AnalysisConfig::default();
        config.binning.cut = DeclinationCut::new(-50.0, -60.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AnalysisConfig::load(&path), Err(Error::Config(_))));
    }
}
