//! # skytrials-core
//!
//! **Empirical significance and sensitivity for sky searches.**
//!
//! `skytrials-core` sits around an external likelihood engine. It turns observed
//! test-statistic (TS) maps into calibrated p-values using scrambled background
//! trials, fits injection-trial pass-fractions to find the sensitivity and
//! discovery-potential flux, and builds source templates used as spatial priors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skytrials_core::{AnalysisConfig, DeclinationBinner, HealpixRing};
//!
//! let config = AnalysisConfig::default();
//! let binner = DeclinationBinner::new(HealpixRing, config.binning.nside, config.binning.cut);
//! let bins = binner.build();
//! println!("{} declination bins, {} pixels", bins.len(), bins.pixel_count());
//! ```
//!
//! ## Architecture
//!
//! Batch jobs → Manifest → TrialAggregator → Pools → PValueMapper
//!
//! - [`DeclinationBinner`] groups grid pixels sharing one declination. The
//!   detector background is invariant in right ascension, so one pool serves a
//!   whole ring.
//! - [`JobManifest`] lists every job output expected at submission time.
//! - [`TrialAggregator`] merges job outputs into [`BackgroundPool`]s and
//!   [`SensitivityCurve`]s, reporting missing and corrupt files.
//! - [`PValueMapper`] maps TS values to empirical p-values, tagging pixels that
//!   have no usable pool.
//! - [`SensitivityFitter`] fits and inverts a pass-fraction curve.
//! - [`TemplateCombiner`] sums per-event Gaussian kernels into a density map.
//!
//! All grid access goes through the [`Pixelization`] trait.

pub mod binning;
pub mod catalog;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pixelization;
pub mod pvalue;
pub mod sensitivity;
pub mod template;
pub mod trials;

pub use binning::{DeclinationBin, DeclinationBinner, DeclinationBins, DeclinationCut};
pub use catalog::{CatalogEntry, SourceCatalog, symmetric_extent};
pub use config::{
    AnalysisConfig, BackgroundConfig, BinningConfig, SensitivityConfig, TemplateConfig,
};
pub use error::{Error, Result};
pub use manifest::{
    JobEntry, JobManifest, JobTarget, write_background_trials, write_injection_sample,
};
pub use pixelization::{Frame, HealpixRing, Pixelization, SkyCoord, angular_distance, rotate};
pub use pvalue::{
    Hotspot, MapSummary, PValue, PValueMap, PValueMapper, SkyMap, TailRule, UNSEEN,
    hottest_pixel,
};
pub use sensitivity::{
    Criterion, CurveFamily, CurveFit, FitError, FitSummary, InjectionSample, SensitivityCache,
    SensitivityCurve, SensitivityEstimate, SensitivityFitter, SensitivityRequest,
    SensitivityResult, SensitivityStatus,
};
pub use template::{DensityMap, EventRecord, TemplateCombiner, TemplateEvent, density_at};
pub use trials::{
    AggregationReport, AggregationStatus, AggregationSummary, BackgroundPool, TrialAggregator,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
