//! `skytrials sensitivity`: sensitivity and discovery-potential flux for one
//! hypothesis, cached across runs.

use skytrials_core::{
    AnalysisConfig, Criterion, JobManifest, Result, SensitivityCache, SensitivityCurve,
    SensitivityFitter, SensitivityRequest, SensitivityResult, SensitivityStatus, TrialAggregator,
};

pub struct SensitivityCommandConfig<'a> {
    pub hypothesis: &'a str,
    pub discovery_hypothesis: Option<&'a str>,
    pub declination_deg: f64,
    pub spectral_index: f64,
    pub flux_per_event: f64,
    pub refit: bool,
}

pub fn run(config: &AnalysisConfig, cmd: SensitivityCommandConfig<'_>) -> Result<()> {
    let manifest = super::load_manifest(&config.injection_manifest_path(), "plan-injection")?;
    let aggregator = TrialAggregator::new(&manifest);
    let fitter = SensitivityFitter::from_config(&config.sensitivity);

    let cache_path = config.sensitivity_cache_path();
    let mut cache = SensitivityCache::load(&cache_path)?;

    let mut criteria = vec![(
        Criterion::Sensitivity,
        cmd.hypothesis,
        config.sensitivity.sensitivity_fraction,
    )];
    if let Some(discovery) = cmd.discovery_hypothesis {
        criteria.push((
            Criterion::DiscoveryPotential,
            discovery,
            config.sensitivity.discovery_fraction,
        ));
    }

    println!(
        "{} at dec {:.3}°, index {} ({} fit)",
        cmd.hypothesis, cmd.declination_deg, cmd.spectral_index, fitter.family
    );
    for (criterion, hypothesis, target_fraction) in criteria {
        let request = SensitivityRequest {
            // Keyed by the sensitivity hypothesis so both criteria share one entry.
            hypothesis: cmd.hypothesis.to_string(),
            criterion,
            declination: cmd.declination_deg.to_radians(),
            spectral_index: cmd.spectral_index,
            target_fraction,
            flux_per_event: cmd.flux_per_event,
        };
        let curve = load_curve(&aggregator, &manifest, hypothesis);
        let result = if cmd.refit {
            let result = fitter.estimate(&request, &curve);
            cache.insert(result.clone());
            result
        } else {
            cache.get_or_estimate(&fitter, &request, &curve)
        };
        print_result(&result, &curve);
    }

    cache.save(&cache_path)?;
    println!("Cache ({} results) → {}", cache.len(), cache_path.display());
    Ok(())
}

fn load_curve(
    aggregator: &TrialAggregator<'_>,
    manifest: &JobManifest,
    hypothesis: &str,
) -> SensitivityCurve {
    if manifest.injection_entries(hypothesis).next().is_none() {
        println!("  no injection jobs planned for {hypothesis}");
    }
    aggregator.sensitivity_curve(hypothesis).0
}

fn print_result(result: &SensitivityResult, curve: &SensitivityCurve) {
    match &result.status {
        SensitivityStatus::Fitted => {
            println!(
                "  {:<20} mu = {:.2} ± {:.2}   flux = {:.3e} ± {:.3e}",
                result.criterion.to_string(),
                result.mu,
                result.mu_err,
                result.flux,
                result.flux_err
            );
            if let Some(fit) = &result.fit {
                println!(
                    "  {:<20} chi2/ndof = {:.2}/{} over {} levels",
                    "",
                    fit.chi2,
                    fit.ndof,
                    curve.len()
                );
            }
        }
        SensitivityStatus::Undefined => {
            println!(
                "  {:<20} undefined (spectral index or flux normalization missing)",
                result.criterion.to_string()
            );
        }
        SensitivityStatus::Failed(e) => {
            println!("  {:<20} failed: {e}", result.criterion.to_string());
            if let Some(levels) = curve.suggest_extension(result.target_fraction, 5) {
                let levels: Vec<String> = levels.iter().map(|mu| format!("{mu}")).collect();
                println!("  {:<20} try injecting at mu = [{}]", "", levels.join(", "));
            }
        }
    }
}
