//! `skytrials plan-background`: list the background scramble jobs of a run.

use skytrials_core::{AnalysisConfig, JobManifest, Result};

pub fn run(config: &AnalysisConfig) -> Result<()> {
    let bins = super::load_bins(config)?;
    let manifest = JobManifest::plan_background(
        bins.len(),
        config.background.jobs_per_bin,
        &config.background_dir(),
    );

    let path = config.background_manifest_path();
    manifest.save(&path)?;
    println!(
        "Planned {} jobs ({} bins × {} jobs, {} trials each) → {}",
        manifest.len(),
        bins.len(),
        config.background.jobs_per_bin,
        config.background.trials_per_job,
        path.display()
    );
    println!("  job outputs expected under {}", config.background_dir().display());
    Ok(())
}
