//! `skytrials plan-injection`: list signal-injection jobs for one hypothesis.
//!
//! Plans are merged into the run's injection manifest, so a second call for
//! another hypothesis, or with extra levels, keeps every earlier entry.

use skytrials_core::{AnalysisConfig, Error, JobManifest, Result, TrialAggregator};

pub struct PlanInjectionConfig<'a> {
    pub hypothesis: &'a str,
    pub mu: Option<&'a str>,
    pub extend: bool,
    pub extend_levels: usize,
}

pub fn run(config: &AnalysisConfig, cmd: PlanInjectionConfig<'_>) -> Result<()> {
    let path = config.injection_manifest_path();
    let mut manifest = if path.exists() {
        JobManifest::load(&path)?
    } else {
        JobManifest::new()
    };

    let mu_grid = if cmd.extend {
        let (curve, report) = TrialAggregator::new(&manifest).sensitivity_curve(cmd.hypothesis);
        let target = config.sensitivity.sensitivity_fraction;
        println!(
            "{}: {} levels from {} of {} job outputs",
            cmd.hypothesis,
            curve.len(),
            report.loaded,
            report.expected
        );
        match curve.suggest_extension(target, cmd.extend_levels) {
            Some(levels) => levels,
            None if curve.is_empty() => {
                println!("  No injection results yet; nothing to extend.");
                return Ok(());
            }
            None if curve.brackets(target) => {
                println!("  Sampled fractions already bracket {target}; nothing to add.");
                return Ok(());
            }
            None => {
                return Err(Error::validation(format!(
                    "{}: pass fraction already exceeds {target} at mu = 0; \
                     no lower levels can be planned",
                    cmd.hypothesis
                )));
            }
        }
    } else {
        match cmd.mu {
            Some(raw) => super::parse_mu_list(raw)?,
            None => config.sensitivity.mu_grid.clone(),
        }
    };

    let planned = JobManifest::plan_injection(
        cmd.hypothesis,
        &mu_grid,
        config.sensitivity.jobs_per_level,
        &config.injection_dir(),
    )?;
    let added = manifest.extend(planned);
    manifest.save(&path)?;

    let levels: Vec<String> = mu_grid.iter().map(|mu| format!("{mu}")).collect();
    println!(
        "Added {added} jobs for {} at mu = [{}] → {}",
        cmd.hypothesis,
        levels.join(", "),
        path.display()
    );
    println!("  manifest now lists {} injection jobs", manifest.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skytrials_core::{InjectionSample, JobTarget, write_injection_sample};

    fn config(dir: &std::path::Path) -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.output_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_explicit_grid_then_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        run(
            &config,
            PlanInjectionConfig {
                hypothesis: "src",
                mu: Some("0,10,20"),
                extend: false,
                extend_levels: 2,
            },
        )
        .unwrap();

        let manifest = JobManifest::load(&config.injection_manifest_path()).unwrap();
        assert_eq!(manifest.len(), 3);
        for (entry, passed) in manifest.entries.iter().zip([10, 200, 500]) {
            let JobTarget::Injection { mu, .. } = entry.target else {
                panic!("expected injection entry");
            };
            write_injection_sample(&entry.path, &InjectionSample::new(mu, passed, 1000)).unwrap();
        }

        run(
            &config,
            PlanInjectionConfig {
                hypothesis: "src",
                mu: None,
                extend: true,
                extend_levels: 2,
            },
        )
        .unwrap();
        let manifest = JobManifest::load(&config.injection_manifest_path()).unwrap();
        assert_eq!(manifest.len(), 5);
        assert!(manifest.entries.iter().any(|e| e.path.ends_with("src_mu_40_job_0.json")));
    }

    #[test]
    fn test_extension_from_zero_with_every_level_above_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let plan = |mu: Option<&'static str>| PlanInjectionConfig {
            hypothesis: "src",
            mu,
            extend: mu.is_none(),
            extend_levels: 3,
        };
        run(&config, plan(Some("0,10"))).unwrap();
        let manifest = JobManifest::load(&config.injection_manifest_path()).unwrap();
        for (entry, passed) in manifest.entries.iter().zip([950, 990]) {
            let JobTarget::Injection { mu, .. } = entry.target else {
                panic!("expected injection entry");
            };
            write_injection_sample(&entry.path, &InjectionSample::new(mu, passed, 1000)).unwrap();
        }

        assert!(matches!(run(&config, plan(None)), Err(Error::Validation(_))));
        let manifest = JobManifest::load(&config.injection_manifest_path()).unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_extension_without_results_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        run(
            &config,
            PlanInjectionConfig {
                hypothesis: "src",
                mu: None,
                extend: true,
                extend_levels: 3,
            },
        )
        .unwrap();
        assert!(!config.injection_manifest_path().exists());
    }
}
