#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use penetrance::config::EngineConfig;
use penetrance::coverage::coverage_diagnostic;
use penetrance::data::{VariantDataset, load_dataset};
use penetrance::em::{Estimate, estimate};
use penetrance::evaluate::{CorrelationTest, correlation_table, cross_validate, empirical_penetrance};
use penetrance::output::{save_correlations, save_coverage, save_cross_validation, save_posterior_table};
use penetrance::smoothing::{DistanceSmoother, LookupSmoother, load_lookup_smoother};

#[derive(Parser)]
#[command(
    name = "penetrance",
    about = "Empirical-Bayes penetrance estimation for ion-channel variants",
    long_about = "Estimates per-variant penetrance from carrier counts and structural \
                 covariates with a Beta-Binomial model whose priors are refined by EM."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct InputArgs {
    /// Tab-separated variant table (variant, position, category, affected, unaffected, covariates...)
    #[arg(value_name = "TABLE")]
    table: PathBuf,

    /// TOML file overriding the default engine settings
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Precomputed residue-distance smoothing (position, value, confidence TSV)
    #[arg(long, value_name = "PATH")]
    smoothing: Option<PathBuf>,

    /// Covariate column refreshed from the smoothing table each iteration
    #[arg(long, value_name = "COLUMN")]
    smoothing_covariate: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the empirical prior, EM loop and final pass
    #[command(about = "Estimate posterior penetrance (outputs: posterior.tsv)")]
    Estimate {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, default_value = "posterior.tsv")]
        out: PathBuf,

        /// Iteration cap for the EM loop
        #[arg(long, value_name = "N")]
        max_iterations: Option<usize>,

        /// Summed absolute change in posterior means that counts as converged
        #[arg(long, value_name = "T")]
        threshold: Option<f64>,

        /// Heterozygote observations the covariate prior is worth in the final pass
        #[arg(long, value_name = "K")]
        equivalent_observations: Option<f64>,
    },

    /// Correlate a target column with every covariate
    #[command(about = "Weighted Spearman and Pearson correlations (outputs: correlations.tsv)")]
    Correlate {
        #[command(flatten)]
        input: InputArgs,

        /// `penetrance`, `posterior`, or the name of a covariate column
        #[arg(long, default_value = "penetrance")]
        target: String,

        #[arg(long, value_name = "N")]
        permutations: Option<usize>,

        #[arg(long, default_value = "correlations.tsv")]
        out: PathBuf,
    },

    /// Score the covariate priors on held-out folds
    #[command(about = "K-fold cross-validation (outputs: cross_validation.tsv)")]
    CrossValidate {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, value_name = "K")]
        folds: Option<usize>,

        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,

        #[arg(long, default_value = "cross_validation.tsv")]
        out: PathBuf,
    },

    /// Simulate credible-interval coverage for every estimated variant
    #[command(about = "Credible-interval coverage simulation (outputs: coverage.tsv)")]
    Coverage {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, value_name = "N")]
        trials: Option<usize>,

        /// Fixed carrier count per simulated study instead of the observed count
        #[arg(long, value_name = "N")]
        carriers: Option<u32>,

        #[arg(long, default_value = "coverage.tsv")]
        out: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Estimate {
            input,
            out,
            max_iterations,
            threshold,
            equivalent_observations,
        }) => run_estimate(input, out, max_iterations, threshold, equivalent_observations),
        Some(Commands::Correlate {
            input,
            target,
            permutations,
            out,
        }) => run_correlate(input, target, permutations, out),
        Some(Commands::CrossValidate {
            input,
            folds,
            seed,
            out,
        }) => run_cross_validate(input, folds, seed, out),
        Some(Commands::Coverage {
            input,
            trials,
            carriers,
            out,
        }) => run_coverage(input, trials, carriers, out),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a subcommand needs before it can run the engine.
struct Loaded {
    config: EngineConfig,
    dataset: VariantDataset,
    smoother: Option<LookupSmoother>,
}

impl Loaded {
    fn smoother(&self) -> Option<&dyn DistanceSmoother> {
        self.smoother.as_ref().map(|s| s as &dyn DistanceSmoother)
    }
}

fn load(input: InputArgs, adjust: impl FnOnce(&mut EngineConfig)) -> Result<Loaded, Box<dyn std::error::Error>> {
    let mut config = match &input.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };
    if input.smoothing_covariate.is_some() {
        config.smoothing_covariate = input.smoothing_covariate;
    }
    adjust(&mut config);
    config.validate()?;

    println!("Loading variant table from: {}", input.table.display());
    let dataset = load_dataset(&input.table, config.weight_epsilon)?;
    println!(
        "Loaded {} variants with {} covariates",
        dataset.len(),
        dataset.covariate_names().len()
    );

    let smoother = match &input.smoothing {
        Some(path) => {
            println!("Loading smoothing table from: {}", path.display());
            Some(load_lookup_smoother(path)?)
        }
        None => None,
    };
    Ok(Loaded {
        config,
        dataset,
        smoother,
    })
}

fn run_estimate(
    input: InputArgs,
    out: PathBuf,
    max_iterations: Option<usize>,
    threshold: Option<f64>,
    equivalent_observations: Option<f64>,
) -> CliResult {
    let loaded = load(input, |config| {
        if let Some(n) = max_iterations {
            config.max_iterations = n;
        }
        if let Some(t) = threshold {
            config.convergence_threshold = t;
        }
        if let Some(k) = equivalent_observations {
            config.prior_equivalent_observations = k;
        }
    })?;

    let Estimate { table, report } = estimate(&loaded.dataset, &loaded.config, loaded.smoother())?;
    println!("{report}");
    save_posterior_table(&out, &table)?;
    println!("Posterior table saved to: {}", out.display());
    Ok(())
}

fn run_correlate(input: InputArgs, target: String, permutations: Option<usize>, out: PathBuf) -> CliResult {
    let loaded = load(input, |config| {
        if let Some(n) = permutations {
            config.permutations.count = n;
        }
    })?;
    let dataset = &loaded.dataset;

    let target_values: Vec<Option<f64>> = match target.as_str() {
        "penetrance" => empirical_penetrance(dataset),
        "posterior" => {
            let run = estimate(dataset, &loaded.config, loaded.smoother())?;
            run.table.rows.iter().map(|r| Some(r.posterior_mean)).collect()
        }
        column => {
            let j = dataset.covariate_index(column)?;
            dataset.records().iter().map(|r| r.covariates[j]).collect()
        }
    };

    println!(
        "Correlating '{}' with {} covariates using {} permutations",
        target,
        dataset.covariate_names().len(),
        loaded.config.permutations.count
    );
    let rows = correlation_table(dataset, &target_values, &loaded.config.permutations);
    for row in &rows {
        let describe = |t: Option<CorrelationTest>| match t {
            Some(t) => format!("{:+.3} (p = {:.3})", t.estimate, t.p_value),
            None => "undefined".to_string(),
        };
        println!(
            "  {:<24} spearman {:<22} pearson {}",
            row.covariate,
            describe(row.spearman),
            describe(row.pearson)
        );
    }
    save_correlations(&out, &rows)?;
    println!("Correlations saved to: {}", out.display());
    Ok(())
}

fn run_cross_validate(input: InputArgs, folds: Option<usize>, seed: Option<u64>, out: PathBuf) -> CliResult {
    let loaded = load(input, |config| {
        if let Some(k) = folds {
            config.cross_validation.folds = k;
        }
        if let Some(s) = seed {
            config.cross_validation.seed = s;
        }
    })?;

    let cv = cross_validate(&loaded.dataset, &loaded.config, loaded.smoother())?;
    let show = |values: Vec<Option<f64>>| {
        values
            .iter()
            .map(|v| v.map_or_else(|| "NA".to_string(), |v| format!("{v:.3}")))
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("Spearman: [{}]", show(cv.spearman()));
    println!("Pearson:  [{}]", show(cv.pearson()));
    println!("Brier:    [{}]", show(cv.brier()));
    let fallback_folds = cv.folds.iter().filter(|f| f.prior_fallback).count();
    let degenerate: usize = cv.folds.iter().map(|f| f.degenerate_fallbacks).sum();
    let carried: usize = cv.folds.iter().map(|f| f.carried).sum();
    println!(
        "Fallbacks: {fallback_folds} of {} folds used the fallback prior, {degenerate} degenerate priors replaced, {carried} carried estimates",
        cv.folds.len()
    );
    save_cross_validation(&out, &cv)?;
    println!("Cross-validation results saved to: {}", out.display());
    Ok(())
}

fn run_coverage(input: InputArgs, trials: Option<usize>, carriers: Option<u32>, out: PathBuf) -> CliResult {
    let loaded = load(input, |config| {
        if let Some(n) = trials {
            config.coverage.trials = n;
        }
    })?;

    let run = estimate(&loaded.dataset, &loaded.config, loaded.smoother())?;
    println!("{}", run.report);
    let rows = coverage_diagnostic(
        &run.table,
        loaded.config.credible_level,
        carriers,
        &loaded.config.coverage,
    )?;
    if !rows.is_empty() {
        let mean = rows.iter().map(|r| r.result.coverage).sum::<f64>() / rows.len() as f64;
        println!(
            "Mean coverage of {:.0}% intervals across {} variants: {:.3}",
            loaded.config.credible_level * 100.0,
            rows.len(),
            mean
        );
    }
    save_coverage(&out, &rows)?;
    println!("Coverage table saved to: {}", out.display());
    Ok(())
}
