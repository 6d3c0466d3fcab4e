//! `skytrials aggregate`: merge background job outputs per declination bin.
//!
//! Prints one row per bin and writes the TS thresholds that injection jobs
//! count passes against: the background quantiles at the sensitivity and
//! discovery-potential alphas.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use skytrials_core::{AnalysisConfig, Result, TrialAggregator};

/// Thresholds of one bin; `None` when the pool cannot resolve the alpha.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinThresholds {
    pub bin: usize,
    /// Degrees.
    pub declination: f64,
    pub trials: usize,
    pub sensitivity_ts: Option<f64>,
    pub discovery_ts: Option<f64>,
}

pub fn run(config: &AnalysisConfig, output: Option<&str>) -> Result<()> {
    let bins = super::load_bins(config)?;
    let manifest = super::load_manifest(&config.background_manifest_path(), "plan-background")?;
    let (pools, reports, summary) = TrialAggregator::new(&manifest).background_pools(bins.len());

    let expected_trials = config.background.jobs_per_bin * config.background.trials_per_job;
    let alpha_sens = config.sensitivity.sensitivity_alpha;
    let alpha_disc = config.sensitivity.discovery_alpha;

    println!(
        "{:>5} {:>9} {:>9} {:>10} {:>12} {:>12}  status",
        "bin", "dec", "trials", "files", "TS(sens)", "TS(disc)"
    );
    let mut thresholds = Vec::with_capacity(bins.len());
    let mut short_bins = 0usize;
    for ((index, bin), (pool, report)) in bins.iter().enumerate().zip(pools.iter().zip(&reports)) {
        let row = BinThresholds {
            bin: index,
            declination: bin.declination.to_degrees(),
            trials: pool.len(),
            sensitivity_ts: pool.threshold(alpha_sens),
            discovery_ts: pool.threshold(alpha_disc),
        };
        if pool.len() < expected_trials {
            short_bins += 1;
        }
        println!(
            "{:>5} {:>9.3} {:>9} {:>10} {:>12} {:>12}  {}",
            row.bin,
            row.declination,
            row.trials,
            format!("{}/{}", report.loaded, report.expected),
            format_ts(row.sensitivity_ts),
            format_ts(row.discovery_ts),
            report.status()
        );
        thresholds.push(row);
    }

    println!();
    println!("{summary}");
    if short_bins > 0 {
        log::warn!(
            "{short_bins} bins hold fewer than {expected_trials} trials ({} jobs × {})",
            config.background.jobs_per_bin, config.background.trials_per_job
        );
    }
    let unresolved = thresholds.iter().filter(|t| t.discovery_ts.is_none()).count();
    if unresolved > 0 {
        log::warn!(
            "{unresolved} bins cannot resolve alpha {alpha_disc:.2e}; \
             discovery thresholds need ≥ {:.0} trials",
            (1.0 / alpha_disc).ceil()
        );
    }

    let path = output.map_or_else(|| config.thresholds_path(), PathBuf::from);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&thresholds)?)?;
    println!("Thresholds → {}", path.display());
    Ok(())
}

fn format_ts(ts: Option<f64>) -> String {
    ts.map_or_else(|| "—".to_string(), |t| format!("{t:.3}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skytrials_core::write_background_trials;

    #[test]
    fn test_thresholds_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AnalysisConfig::default();
        config.output_dir = dir.path().to_path_buf();
        config.binning.nside = 4;
        config.background.jobs_per_bin = 1;
        super::super::bins::run(&config, None).unwrap();
        super::super::plan_background::run(&config).unwrap();

        let manifest =
            skytrials_core::JobManifest::load(&config.background_manifest_path()).unwrap();
        let ts: Vec<f64> = (1..=100).map(f64::from).collect();
        write_background_trials(&manifest.entries[0].path, &ts).unwrap();
        run(&config, None).unwrap();

        let raw = std::fs::read_to_string(config.thresholds_path()).unwrap();
        let rows: Vec<BinThresholds> = serde_json::from_str(&raw).unwrap();
        assert_eq!(rows[0].trials, 100);
        assert_eq!(rows[0].sensitivity_ts, Some(51.0));
        assert_eq!(rows[0].discovery_ts, None);
        assert!(rows[1..].iter().all(|r| r.trials == 0 && r.sensitivity_ts.is_none()));
    }
}
