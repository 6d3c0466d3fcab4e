//! `skytrials pvalue`: convert an observed TS map into empirical p-values.

use std::path::Path;

use skytrials_core::{
    AnalysisConfig, Error, HealpixRing, PValueMapper, Result, SkyMap, SourceCatalog, TailRule,
};

pub struct PValueCommandConfig<'a> {
    pub ts_map: &'a str,
    pub output: &'a str,
    pub catalog: Option<&'a str>,
    pub source_ts: Option<&'a str>,
}

pub fn run(config: &AnalysisConfig, cmd: PValueCommandConfig<'_>) -> Result<()> {
    let (bins, pools) = super::load_pools(config)?;
    let ts_map = SkyMap::load(Path::new(cmd.ts_map))?;

    let mapper = PValueMapper::new(&bins, &pools)?;
    let map = mapper.map(&ts_map)?;
    let summary = map.summary();
    map.to_sky_map().save(Path::new(cmd.output))?;

    println!("P-value map → {}", cmd.output);
    println!(
        "  {} pixels: {} evaluated, {} with empty pool, {} unseen",
        summary.pixels, summary.evaluated, summary.empty_pool, summary.unseen
    );
    println!("  smallest p-value: {}", super::format_p(summary.min_p));

    if let (Some(catalog_path), Some(ts_path)) = (cmd.catalog, cmd.source_ts) {
        let catalog = SourceCatalog::load(Path::new(catalog_path))?;
        let ts: Vec<f64> = super::read_json(ts_path)?;
        if ts.len() != catalog.len() {
            return Err(Error::shape("source TS list", catalog.len(), ts.len()));
        }
        let source_mapper = PValueMapper::new(&bins, &pools)?.with_rule(TailRule::Exceeding);
        let p_values = source_mapper.source_p_values(&HealpixRing, &catalog.positions(), &ts)?;

        println!();
        println!("{:<24} {:>9} {:>10} {:>10} {:>8}", "source", "dec", "TS", "p", "σ");
        for ((name, dec), (t, p)) in catalog
            .name
            .iter()
            .zip(&catalog.dec)
            .zip(ts.iter().zip(&p_values))
        {
            let sigma = p
                .significance()
                .map_or_else(|| "—".to_string(), |s| format!("{s:.2}"));
            println!(
                "{name:<24} {dec:>9.3} {t:>10.3} {:>10} {sigma:>8}",
                super::format_p(p.value())
            );
        }
    }
    Ok(())
}
