pub mod aggregate;
pub mod bins;
pub mod hotspot;
pub mod plan_background;
pub mod plan_injection;
pub mod pvalue;
pub mod sensitivity;
pub mod template;

use std::path::Path;

use skytrials_core::{
    AnalysisConfig, BackgroundPool, DeclinationBins, Error, JobManifest, Result, TrialAggregator,
};

/// Config from `--config`, or defaults.
pub fn load_config(path: Option<&str>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            log::debug!("loading config from {path}");
            AnalysisConfig::load(Path::new(path))
        }
        None => {
            log::debug!("no --config given; using defaults");
            Ok(AnalysisConfig::default())
        }
    }
}

pub fn init_config(config: &AnalysisConfig, output: &str) -> Result<()> {
    config.save(Path::new(output))?;
    println!("Wrote config to {output}");
    Ok(())
}

/// Saved declination bins, checked against the configured grid.
pub fn load_bins(config: &AnalysisConfig) -> Result<DeclinationBins> {
    let path = config.bins_path();
    if !path.exists() {
        return Err(Error::config(format!(
            "{} not found; run `skytrials bins` first",
            path.display()
        )));
    }
    DeclinationBins::load_checked(&path, config.binning.nside, config.binning.cut)
}

fn load_manifest(path: &Path, plan_command: &str) -> Result<JobManifest> {
    if !path.exists() {
        return Err(Error::config(format!(
            "{} not found; run `skytrials {plan_command}` first",
            path.display()
        )));
    }
    JobManifest::load(path)
}

/// Bins plus one aggregated pool per bin.
pub fn load_pools(config: &AnalysisConfig) -> Result<(DeclinationBins, Vec<BackgroundPool>)> {
    let bins = load_bins(config)?;
    let manifest = load_manifest(&config.background_manifest_path(), "plan-background")?;
    let (pools, _, summary) = TrialAggregator::new(&manifest).background_pools(bins.len());
    if summary.failed() > 0 {
        println!(
            "  {} of {} bins have no usable background trials",
            summary.failed(),
            summary.targets
        );
    }
    Ok((bins, pools))
}

/// Parse "0,10,20.5" into injected means.
pub fn parse_mu_list(raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| Error::validation(format!("invalid injected mean {s:?}")))
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn format_p(p: Option<f64>) -> String {
    match p {
        Some(p) => format!("{p:.3e}"),
        None => "—".to_string(),
    }
}
