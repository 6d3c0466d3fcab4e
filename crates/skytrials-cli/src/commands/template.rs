//! `skytrials template`: joint directional density of uncertain positions.

use std::path::Path;

use skytrials_core::{
    AnalysisConfig, EventRecord, HealpixRing, Result, SourceCatalog, TemplateCombiner,
    TemplateEvent,
};

pub fn run(
    config: &AnalysisConfig,
    events: Option<&str>,
    catalog: Option<&str>,
    output: &str,
) -> Result<()> {
    let template = &config.template;
    let kernels: Vec<TemplateEvent> = match (events, catalog) {
        (Some(path), _) => {
            let records: Vec<EventRecord> = super::read_json(path)?;
            println!(
                "{} events from {path}, uncertainties scaled by {}",
                records.len(),
                template.error_scale
            );
            records
                .iter()
                .map(|r| TemplateEvent::from_record(r, template.error_scale))
                .collect::<Result<_>>()?
        }
        (None, Some(path)) => {
            let catalog = SourceCatalog::load(Path::new(path))?;
            println!(
                "{} sources from {path}, resolution {}°",
                catalog.len(),
                template.resolution_deg
            );
            catalog
                .entries()
                .iter()
                .map(|entry| TemplateEvent::from_catalog(entry, template.resolution_deg))
                .collect::<Result<_>>()?
        }
        (None, None) => Vec::new(),
    };

    let map = TemplateCombiner::new(HealpixRing, template.nside).build(&kernels, template.frame)?;
    map.to_sky_map().save(Path::new(output))?;
    println!(
        "Template (nside {}, {}) → {output}; integral {:.6}",
        map.nside,
        map.frame,
        map.integral(&HealpixRing)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skytrials_core::{DensityMap, SkyMap};

    #[test]
    fn test_template_from_events_file() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.json");
        std::fs::write(
            &events_path,
            r#"[{"ra": 83.6, "dec": 22.0, "err": 6.0}, {"ra": 266.4, "dec": -29.0, "err": 8.0}]"#,
        )
        .unwrap();
        let out = dir.path().join("template.json");

        let mut config = AnalysisConfig::default();
        config.template.nside = 16;
        run(
            &config,
            Some(events_path.to_str().unwrap()),
            None,
            out.to_str().unwrap(),
        )
        .unwrap();

        let map = DensityMap::from_sky_map(SkyMap::load(&out).unwrap()).unwrap();
        assert!((map.integral(&HealpixRing) - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_empty_event_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.json");
        std::fs::write(&events_path, "[]").unwrap();
        let out = dir.path().join("template.json");
        let config = AnalysisConfig::default();
        assert!(run(&config, events_path.to_str(), None, out.to_str().unwrap()).is_err());
    }
}
