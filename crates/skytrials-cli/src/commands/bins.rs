//! `skytrials bins`: build and save the declination bins of the analysis grid.

use skytrials_core::{AnalysisConfig, DeclinationBinner, HealpixRing, Pixelization, Result};

pub fn run(config: &AnalysisConfig, nside: Option<u32>) -> Result<()> {
    let mut config = config.clone();
    if let Some(nside) = nside {
        config.binning.nside = nside;
        config.validate()?;
    }
    let nside = config.binning.nside;
    let cut = config.binning.cut;

    println!(
        "Binning nside {nside} ({} pixels), declination cut ({:.3}°, {:.3}°)",
        HealpixRing.pixel_count(nside),
        cut.min_deg,
        cut.max_deg
    );
    let bins = DeclinationBinner::new(HealpixRing, nside, cut).build();
    if bins.is_empty() {
        println!("  No pixel centre falls inside the cut; writing an empty bin file.");
    }

    let path = config.bins_path();
    bins.save(&path)?;
    println!(
        "  {} bins, {} eligible pixels → {}",
        bins.len(),
        bins.pixel_count(),
        path.display()
    );
    if let (Some(first), Some(last)) = (bins.get(0), bins.get(bins.len().saturating_sub(1))) {
        println!(
            "  declinations {:.3}° … {:.3}°",
            first.declination.to_degrees(),
            last.declination.to_degrees()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skytrials_core::DeclinationBins;

    #[test]
    fn test_bins_written_for_override_nside() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AnalysisConfig::default();
        config.output_dir = dir.path().to_path_buf();
        run(&config, Some(8)).unwrap();

        config.binning.nside = 8;
        let bins =
            DeclinationBins::load_checked(&config.bins_path(), 8, config.binning.cut).unwrap();
        assert!(!bins.is_empty());
    }

    #[test]
    fn test_rejects_invalid_override() {
        let config = AnalysisConfig::default();
        assert!(run(&config, Some(3)).is_err());
    }
}
