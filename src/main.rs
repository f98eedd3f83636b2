use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use clap::Parser;
use prior_sensitivity::summary::SizePanel;
use prior_sensitivity::{ExperimentConfig, ExperimentOrchestrator, SummaryReporter};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "prior-sensitivity")]
#[command(about = "Compare slope posteriors across priors and sample sizes")]
struct Cli {
    /// JSON experiment configuration; unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the comparison artifact as JSON to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write densities.csv and draws.csv into this directory
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Show one progress bar per chain
    #[arg(long)]
    progress: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,

    #[arg(long)]
    seed: Option<u64>,

    /// Comma-separated, e.g. 10,100,1000
    #[arg(long, value_delimiter = ',')]
    sample_sizes: Option<Vec<usize>>,

    /// Comma-separated slope prior sds; `flat` for no slope prior
    #[arg(long, value_delimiter = ',')]
    prior_sds: Option<Vec<PriorSd>>,

    #[arg(long)]
    chains: Option<usize>,

    #[arg(long)]
    warmup: Option<usize>,

    #[arg(long)]
    samples: Option<usize>,

    #[arg(long)]
    target_accept: Option<f64>,

    #[arg(long)]
    max_tree_depth: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct PriorSd(Option<f64>);

impl FromStr for PriorSd {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("flat") {
            return Ok(Self(None));
        }
        s.parse::<f64>()
            .map(|sd| Self(Some(sd)))
            .map_err(|e| format!("expected `flat` or a number, got `{s}`: {e}"))
    }
}

impl Cli {
    fn experiment_config(&self) -> anyhow::Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => ExperimentConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(sizes) = &self.sample_sizes {
            config.sample_sizes = sizes.clone();
        }
        if let Some(sds) = &self.prior_sds {
            config.prior_slope_sds = sds.iter().map(|sd| sd.0).collect();
        }
        if let Some(n) = self.chains {
            config.n_chains = n;
        }
        if let Some(n) = self.warmup {
            config.n_warmup = n;
        }
        if let Some(n) = self.samples {
            config.n_sampling = n;
        }
        if let Some(p) = self.target_accept {
            config.target_accept = p;
        }
        if let Some(d) = self.max_tree_depth {
            config.max_tree_depth = d;
        }
        if let Some(n) = self.workers {
            config.n_parallel_workers = n;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_panel(panel: &SizePanel) {
    match panel.ols_slope {
        Some(ols) => println!("n = {} (OLS slope {ols:.4})", panel.sample_size),
        None => println!("n = {}", panel.sample_size),
    }
    println!(
        "  {:<10} {:>9} {:>9} {:>9} {:>9} {:>7} {:>8}  ok",
        "prior", "mean", "sd", "q05", "q95", "rhat", "ess"
    );
    for curve in &panel.curves {
        if let Some(failure) = &curve.failure {
            println!("  {:<10} FAILED: {}", curve.prior, failure.reason);
            continue;
        }
        let (Some(s), Some(d)) = (&curve.summary, &curve.diagnostics) else {
            continue;
        };
        println!(
            "  {:<10} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>7.3} {:>8.0}  {}",
            curve.prior,
            s.mean,
            s.sd,
            s.q05,
            s.q95,
            d.rhat,
            d.ess,
            if d.ok { "yes" } else { "NO" }
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = cli.experiment_config()?;
    info!(
        "truth: intercept={} slope={} noise_sd={}",
        config.true_intercept, config.true_slope, config.true_noise_sd
    );

    let result = ExperimentOrchestrator::from_config(&config)?
        .with_progress(cli.progress)
        .run()?;
    let artifact = SummaryReporter::new(config.density_grid_points).report(&result);

    println!("true slope {}", artifact.true_slope);
    for panel in &artifact.panels {
        print_panel(panel);
    }

    if let Some(path) = &cli.output {
        fs::write(path, artifact.to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {}", path.display());
    }

    if let Some(dir) = &cli.csv {
        #[cfg(feature = "csv")]
        {
            use prior_sensitivity::io::csv::{save_densities, save_draws};
            fs::create_dir_all(dir)?;
            save_densities(&artifact, dir.join("densities.csv"))
                .map_err(|e| anyhow::anyhow!("writing densities.csv: {e}"))?;
            save_draws(&result, dir.join("draws.csv"))
                .map_err(|e| anyhow::anyhow!("writing draws.csv: {e}"))?;
            info!("wrote CSV files to {}", dir.display());
        }
        #[cfg(not(feature = "csv"))]
        bail!(
            "--csv {} requires building with the `csv` feature",
            dir.display()
        );
    }

    let failed = result.failures().count();
    if failed == result.cells.len() {
        bail!("every cell failed");
    }
    Ok(())
}
