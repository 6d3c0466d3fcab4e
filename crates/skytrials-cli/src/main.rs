//! CLI for skytrials: empirical significance and sensitivity for sky searches.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "skytrials")]
#[command(about = "skytrials — calibrate sky-search TS maps with background and injection trials")]
#[command(version = skytrials_core::VERSION)]
struct Cli {
    /// Analysis config (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default analysis config as JSON
    InitConfig {
        /// Destination path
        #[arg(long, default_value = "skytrials.json")]
        output: String,
    },

    /// Group the grid's pixels into declination bins and save them
    Bins {
        /// Override the configured nside
        #[arg(long)]
        nside: Option<u32>,
    },

    /// Write the manifest of background scramble jobs, one set per bin
    PlanBackground,

    /// Write (or extend) the manifest of signal-injection jobs for a hypothesis
    PlanInjection {
        /// Hypothesis name (filename-safe)
        #[arg(long)]
        hypothesis: String,

        /// Comma-separated injected means; defaults to the configured grid
        #[arg(long)]
        mu: Option<String>,

        /// Add levels until the sampled fractions bracket the sensitivity fraction
        #[arg(long)]
        extend: bool,

        /// Number of levels added by --extend
        #[arg(long, default_value = "5")]
        extend_levels: usize,
    },

    /// Merge background job outputs and report pools and TS thresholds per bin
    Aggregate {
        /// Write per-bin thresholds here instead of the default location
        #[arg(long)]
        output: Option<String>,
    },

    /// Convert a TS map to an empirical p-value map
    Pvalue {
        /// Observed TS map (JSON sky map)
        #[arg(long)]
        ts_map: String,

        /// Destination of the p-value map
        #[arg(long)]
        output: String,

        /// Source catalog for per-source p-values
        #[arg(long, requires = "source_ts")]
        catalog: Option<String>,

        /// Observed TS per catalog source (JSON array)
        #[arg(long, requires = "catalog")]
        source_ts: Option<String>,
    },

    /// Locate the hottest pixel and compute its pre- and post-trial p-values
    Hotspot {
        /// Observed TS map (JSON sky map)
        #[arg(long)]
        ts_map: String,

        /// Hottest-spot TS values of all-sky scrambles (JSON array)
        #[arg(long)]
        trials: Option<String>,
    },

    /// Fit injection curves and report sensitivity and discovery potential
    Sensitivity {
        /// Hypothesis whose injection trials pass the sensitivity threshold
        #[arg(long)]
        hypothesis: String,

        /// Hypothesis whose injection trials pass the discovery threshold
        #[arg(long)]
        discovery_hypothesis: Option<String>,

        /// Source declination in degrees
        #[arg(long, allow_hyphen_values = true)]
        declination: f64,

        /// Spectral index; "nan" marks an undefined hypothesis
        #[arg(long, allow_hyphen_values = true)]
        index: f64,

        /// Flux of one injected signal event
        #[arg(long)]
        flux_per_event: f64,

        /// Ignore cached results and refit
        #[arg(long)]
        refit: bool,
    },

    /// Build a source template from event positions or a catalog
    Template {
        /// Events with positional uncertainties (JSON array of {ra, dec, err})
        #[arg(long, conflicts_with = "catalog", required_unless_present = "catalog")]
        events: Option<String>,

        /// Source catalog; each source is smeared by extent and resolution
        #[arg(long)]
        catalog: Option<String>,

        /// Destination of the density map
        #[arg(long)]
        output: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::InitConfig { output } => commands::init_config(&config, &output),
        Commands::Bins { nside } => commands::bins::run(&config, nside),
        Commands::PlanBackground => commands::plan_background::run(&config),
        Commands::PlanInjection {
            hypothesis,
            mu,
            extend,
            extend_levels,
        } => commands::plan_injection::run(
            &config,
            commands::plan_injection::PlanInjectionConfig {
                hypothesis: &hypothesis,
                mu: mu.as_deref(),
                extend,
                extend_levels,
            },
        ),
        Commands::Aggregate { output } => commands::aggregate::run(&config, output.as_deref()),
        Commands::Pvalue {
            ts_map,
            output,
            catalog,
            source_ts,
        } => commands::pvalue::run(
            &config,
            commands::pvalue::PValueCommandConfig {
                ts_map: &ts_map,
                output: &output,
                catalog: catalog.as_deref(),
                source_ts: source_ts.as_deref(),
            },
        ),
        Commands::Hotspot { ts_map, trials } => {
            commands::hotspot::run(&config, &ts_map, trials.as_deref())
        }
        Commands::Sensitivity {
            hypothesis,
            discovery_hypothesis,
            declination,
            index,
            flux_per_event,
            refit,
        } => commands::sensitivity::run(
            &config,
            commands::sensitivity::SensitivityCommandConfig {
                hypothesis: &hypothesis,
                discovery_hypothesis: discovery_hypothesis.as_deref(),
                declination_deg: declination,
                spectral_index: index,
                flux_per_event,
                refit,
            },
        ),
        Commands::Template {
            events,
            catalog,
            output,
        } => commands::template::run(&config, events.as_deref(), catalog.as_deref(), &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "skytrials", "bins", "--nside", "64", "--config", "a.json", "-v",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("a.json"));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Bins { nside: Some(64) }));
    }

    #[test]
    fn test_parse_negative_declination() {
        let cli = Cli::try_parse_from([
            "skytrials",
            "sensitivity",
            "--hypothesis",
            "src",
            "--declination",
            "-62.5",
            "--index",
            "2.2",
            "--flux-per-event",
            "1e-18",
        ])
        .unwrap();
        match cli.command {
            Commands::Sensitivity {
                declination, index, ..
            } => {
                assert_eq!(declination, -62.5);
                assert_eq!(index, 2.2);
            }
            _ => panic!("expected sensitivity command"),
        }
    }

    #[test]
    fn test_template_requires_one_input() {
        assert!(Cli::try_parse_from(["skytrials", "template", "--output", "t.json"]).is_err());
        assert!(
            Cli::try_parse_from([
                "skytrials", "template", "--events", "e.json", "--catalog", "c.json", "--output",
                "t.json"
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "skytrials", "template", "--catalog", "c.json", "--output", "t.json",
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_pvalue_catalog_needs_source_ts() {
        assert!(
            Cli::try_parse_from([
                "skytrials", "pvalue", "--ts-map", "ts.json", "--output", "p.json", "--catalog",
                "c.json"
            ])
            .is_err()
        );
    }
}
