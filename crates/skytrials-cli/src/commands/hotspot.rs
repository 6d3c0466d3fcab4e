//! `skytrials hotspot`: the most significant pixel of a TS map.
//!
//! The pre-trial p-value compares the hottest pixel against its declination
//! bin. The post-trial p-value compares its TS against the hottest-spot TS
//! of all-sky scrambles, which accounts for searching the whole map.

use std::path::Path;

use skytrials_core::{
    AnalysisConfig, BackgroundPool, HealpixRing, PValue, Result, SkyMap, TailRule, hottest_pixel,
};

pub fn run(config: &AnalysisConfig, ts_map: &str, trials: Option<&str>) -> Result<()> {
    let (bins, pools) = super::load_pools(config)?;
    let ts_map = SkyMap::load(Path::new(ts_map))?;

    let Some(spot) = hottest_pixel(&HealpixRing, &ts_map, &bins) else {
        println!("No eligible pixel carries an observed TS.");
        return Ok(());
    };

    let pre_trial = pools
        .get(spot.bin)
        .map_or(PValue::EmptyPool, |pool| pool.p_value_with(spot.ts, TailRule::Exceeding));
    println!(
        "Hottest pixel {} (bin {}): dec {:.3}°, ra {:.3}°, TS {:.3}",
        spot.pixel,
        spot.bin,
        spot.coord.dec.to_degrees(),
        spot.coord.ra.to_degrees(),
        spot.ts
    );
    print_p("pre-trial", pre_trial);

    if let Some(trials_path) = trials {
        let hottest: Vec<f64> = super::read_json(trials_path)?;
        let pool = BackgroundPool::from_values(hottest);
        println!("  {} all-sky scrambles", pool.len());
        print_p("post-trial", pool.p_value_with(spot.ts, TailRule::Exceeding));
    }
    Ok(())
}

fn print_p(label: &str, p: PValue) {
    match p {
        PValue::Value(value) => {
            let sigma = p.significance().unwrap_or(f64::NAN);
            println!("  {label} p = {value:.3e} ({sigma:.2}σ)");
        }
        PValue::EmptyPool => println!("  {label} p: no background trials"),
        PValue::Unseen => println!("  {label} p: unseen"),
    }
}
