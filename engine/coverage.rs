//! Coverage calibration of posterior credible intervals.
//!
//! Given a prior and a true penetrance, draws affected counts for a fixed
//! number of carriers, forms each draw's posterior interval, and reports the
//! fraction of intervals containing the truth.

use crate::beta::{BetaBinomialUpdater, BetaError, credible_interval};
use crate::config::CoverageConfig;
use crate::em::PosteriorTable;
use crate::types::BetaShape;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoverageError {
    #[error("True penetrance {0} is outside [0, 1]")]
    InvalidProbability(f64),
    #[error("At least one trial is required")]
    NoTrials,
    #[error("Interval step {0} must lie in (0, 1]")]
    InvalidStep(f64),
    #[error(transparent)]
    Interval(#[from] BetaError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoverageResult {
    pub trials: usize,
    pub covered: usize,
    pub coverage: f64,
}

/// Rounds `(low, high)` outward to multiples of `step`, clamped to [0, 1].
pub fn round_outward(interval: (f64, f64), step: f64) -> (f64, f64) {
    let low = ((interval.0 / step).floor() * step).max(0.0);
    let high = ((interval.1 / step).ceil() * step).min(1.0);
    (low, high)
}

/// Simulates `trials` studies of `carriers` heterozygotes with penetrance
/// `true_penetrance` and counts how often the posterior interval covers it.
pub fn simulate_coverage(
    prior: BetaShape,
    true_penetrance: f64,
    carriers: u32,
    level: f64,
    config: &CoverageConfig,
) -> Result<CoverageResult, CoverageError> {
    if !(0.0..=1.0).contains(&true_penetrance) {
        return Err(CoverageError::InvalidProbability(true_penetrance));
    }
    if config.trials == 0 {
        return Err(CoverageError::NoTrials);
    }
    if let Some(step) = config.interval_step {
        if !(step > 0.0 && step <= 1.0) {
            return Err(CoverageError::InvalidStep(step));
        }
    }
    let binomial = Binomial::new(carriers as u64, true_penetrance)
        .map_err(|_| CoverageError::InvalidProbability(true_penetrance))?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    // Intervals depend only on the count, so each distinct count is solved once.
    let mut intervals: Vec<Option<(f64, f64)>> = vec![None; carriers as usize + 1];
    let mut covered = 0;
    for _ in 0..config.trials {
        let affected = binomial.sample(&mut rng) as u32;
        let interval = match intervals[affected as usize] {
            Some(interval) => interval,
            None => {
                let posterior = BetaBinomialUpdater::update(prior, affected, carriers).posterior;
                let raw = credible_interval(posterior, level)?;
                let interval = match config.interval_step {
                    Some(step) => round_outward(raw, step),
                    None => raw,
                };
                intervals[affected as usize] = Some(interval);
                interval
            }
        };
        if interval.0 <= true_penetrance && true_penetrance <= interval.1 {
            covered += 1;
        }
    }

    Ok(CoverageResult {
        trials: config.trials,
        covered,
        coverage: covered as f64 / config.trials as f64,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoverageRow {
    pub key: String,
    pub truth: f64,
    pub carriers: u32,
    pub result: CoverageResult,
}

/// Coverage for every eligible variant of an estimate, treating its
/// posterior mean as the truth and its final prior as the prior. `carriers`
/// overrides the observed carrier count. Variant `i` is seeded with
/// `seed + i` so the table is reproducible under any thread count.
pub fn coverage_diagnostic(
    table: &PosteriorTable,
    level: f64,
    carriers: Option<u32>,
    config: &CoverageConfig,
) -> Result<Vec<CoverageRow>, CoverageError> {
    table
        .rows
        .par_iter()
        .enumerate()
        .filter(|(_, row)| row.eligible)
        .map(|(i, row)| -> Result<CoverageRow, CoverageError> {
            let n = carriers.unwrap_or(row.total);
            let row_config = CoverageConfig {
                seed: config.seed.wrapping_add(i as u64),
                ..config.clone()
            };
            let result = simulate_coverage(row.prior_shape(), row.posterior_mean, n, level, &row_config)?;
            Ok(CoverageRow {
                key: row.key.clone(),
                truth: row.posterior_mean,
                carriers: n,
                result,
            })
        })
        .collect()
}
