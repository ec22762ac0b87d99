//! # EM Convergence Loop
//!
//! Alternates the covariate regression step with the Beta-Binomial update
//! until the summed absolute change in posterior means falls below the
//! configured threshold, or the iteration cap is reached.
//!
//! Each iteration consumes an immutable [`EmSnapshot`] and produces the next
//! one; nothing is mutated in place, so a run can be inspected one iteration at
//! a time through [`EmLoop::step`].
//!
//! After the loop a final re-weighting pass gives every covariate-derived
//! prior the strength of `prior_equivalent_observations` carriers, applies the
//! observed counts once more and attaches credible intervals.

use crate::beta::{BetaBinomialUpdater, BetaError, credible_interval};
use crate::config::{ConfigError, EngineConfig};
use crate::data::{DataError, VariantDataset};
use crate::glm::Prediction;
use crate::prior::{EmpiricalPrior, estimate_empirical_prior};
use crate::regression::{CarryReason, RecordPrediction, covariate_regression_step};
use crate::smoothing::{DistanceSmoother, refresh_covariate};
use crate::types::{BetaShape, MutationCategory};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Credible interval failed for variant '{key}': {source}")]
    Interval { key: String, source: BetaError },
    #[error("A distance smoother was supplied but no `smoothing_covariate` is configured.")]
    SmoothingCovariateUnset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Iterating,
    Converged,
    Exhausted,
}

/// How the loop terminated. `Exhausted` is the non-convergence warning: the
/// estimates are returned and the caller decides whether to use them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConvergenceStatus {
    Converged { iterations: usize, delta: f64 },
    Exhausted { iterations: usize, delta: f64 },
}

impl ConvergenceStatus {
    pub fn converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn iterations(&self) -> usize {
        match self {
            Self::Converged { iterations, .. } | Self::Exhausted { iterations, .. } => *iterations,
        }
    }
}

/// Model state for one record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VariantState {
    pub prior: BetaShape,
    pub prior_mean: f64,
    /// Latest regression output, if the record has ever been fitted.
    pub predicted: Option<Prediction>,
    pub posterior_mean: f64,
}

/// The model-state column of the whole table at one iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct EmSnapshot {
    pub version: usize,
    pub states: Vec<VariantState>,
}

/// Per-iteration bookkeeping of locally recovered problems.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepTallies {
    pub fitted: usize,
    pub degenerate_fallbacks: usize,
    pub missing_covariate_carries: usize,
    pub failed_fit_carries: usize,
}

impl std::ops::AddAssign for StepTallies {
    fn add_assign(&mut self, other: Self) {
        self.fitted += other.fitted;
        self.degenerate_fallbacks += other.degenerate_fallbacks;
        self.missing_covariate_carries += other.missing_covariate_carries;
        self.failed_fit_carries += other.failed_fit_carries;
    }
}

#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub snapshot: EmSnapshot,
    pub delta: f64,
    pub tallies: StepTallies,
}

#[derive(Clone, Debug)]
pub struct EmRun {
    pub snapshot: EmSnapshot,
    pub state: LoopState,
    pub status: ConvergenceStatus,
    pub deltas: Vec<f64>,
    pub tallies: StepTallies,
}

/// One row of the output contract.
#[derive(Clone, Debug, PartialEq)]
pub struct PosteriorRow {
    pub key: String,
    pub position: u32,
    pub category: MutationCategory,
    pub eligible: bool,
    pub prior_mean: f64,
    pub posterior_mean: f64,
    /// Prior shape parameters after the final re-weighting pass.
    pub alpha: f64,
    pub beta: f64,
    pub credible_interval_low: f64,
    pub credible_interval_high: f64,
    pub affected: u32,
    pub total: u32,
}

impl PosteriorRow {
    pub fn prior_shape(&self) -> BetaShape {
        BetaShape::new(self.alpha, self.beta)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PosteriorTable {
    pub rows: Vec<PosteriorRow>,
}

impl PosteriorTable {
    pub fn get(&self, key: &str) -> Option<&PosteriorRow> {
        self.rows.iter().find(|r| r.key == key)
    }
}

/// Summary that accompanies every run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub global_prior: BetaShape,
    pub empirical_prior: Option<EmpiricalPrior>,
    /// Why the empirical prior was replaced by the configured fallback.
    pub prior_fallback: Option<String>,
    pub records: usize,
    pub eligible: usize,
    pub status: ConvergenceStatus,
    pub deltas: Vec<f64>,
    pub tallies: StepTallies,
    pub final_degenerate_fallbacks: usize,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Records: {} ({} in the EM working set)", self.records, self.eligible)?;
        match (&self.empirical_prior, &self.prior_fallback) {
            (Some(prior), _) => writeln!(
                f,
                "Global prior: {} (empirical mean {:.4}, variance {:.4e}, {} variants)",
                self.global_prior, prior.mean, prior.variance, prior.records_used
            )?,
            (None, Some(reason)) => writeln!(
                f,
                "Global prior: {} (FALLBACK: {})",
                self.global_prior, reason
            )?,
            (None, None) => writeln!(f, "Global prior: {}", self.global_prior)?,
        }
        match self.status {
            ConvergenceStatus::Converged { iterations, delta } => writeln!(
                f,
                "EM converged after {iterations} iterations (final delta {delta:.4})"
            )?,
            ConvergenceStatus::Exhausted { iterations, delta } => writeln!(
                f,
                "WARNING: EM did not converge within {iterations} iterations (final delta {delta:.4})"
            )?,
        }
        let deltas: Vec<String> = self.deltas.iter().map(|d| format!("{d:.4}")).collect();
        writeln!(f, "Delta history: [{}]", deltas.join(", "))?;
        writeln!(
            f,
            "Fallbacks to the global prior: {} during iterations, {} in the final pass",
            self.tallies.degenerate_fallbacks, self.final_degenerate_fallbacks
        )?;
        write!(
            f,
            "Carried estimates: {} without covariates, {} after failed fits",
            self.tallies.missing_covariate_carries, self.tallies.failed_fit_carries
        )
    }
}

/// Converged table plus the report describing how it was obtained.
#[derive(Clone, Debug)]
pub struct Estimate {
    pub table: PosteriorTable,
    pub report: RunReport,
}

pub struct EmLoop<'a> {
    dataset: &'a VariantDataset,
    config: &'a EngineConfig,
    updater: BetaBinomialUpdater,
    required: Vec<usize>,
    working: Vec<usize>,
    smoother: Option<(usize, &'a dyn DistanceSmoother)>,
}

impl<'a> EmLoop<'a> {
    /// Sets up a loop around a fixed global prior. The working set is every
    /// missense record carrying all required covariates.
    pub fn new(
        dataset: &'a VariantDataset,
        config: &'a EngineConfig,
        global: BetaShape,
    ) -> Result<Self, EngineError> {
        let required = config
            .required_covariates
            .iter()
            .map(|name| dataset.covariate_index(name))
            .collect::<Result<Vec<_>, _>>()?;
        let working = dataset
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_missense() && required.iter().all(|&j| r.covariates[j].is_some()))
            .map(|(i, _)| i)
            .collect();
        Ok(Self {
            dataset,
            config,
            updater: BetaBinomialUpdater::new(global, config.shape_floor),
            required,
            working,
            smoother: None,
        })
    }

    /// Refreshes the configured smoothing covariate from `smoother` before
    /// every regression pass.
    pub fn with_smoother(mut self, smoother: &'a dyn DistanceSmoother) -> Result<Self, EngineError> {
        let name = self
            .config
            .smoothing_covariate
            .as_deref()
            .ok_or(EngineError::SmoothingCovariateUnset)?;
        let column = self.dataset.covariate_index(name)?;
        self.smoother = Some((column, smoother));
        Ok(self)
    }

    pub fn working_set(&self) -> &[usize] {
        &self.working
    }

    pub fn global_prior(&self) -> BetaShape {
        self.updater.global()
    }

    /// Every record starts from the global prior updated with its own counts.
    pub fn initial_snapshot(&self) -> EmSnapshot {
        let global = self.updater.global();
        let states = self
            .dataset
            .records()
            .iter()
            .map(|r| {
                let post = BetaBinomialUpdater::update(global, r.affected, r.total());
                VariantState {
                    prior: global,
                    prior_mean: post.prior_mean,
                    predicted: None,
                    posterior_mean: post.posterior_mean,
                }
            })
            .collect();
        EmSnapshot { version: 0, states }
    }

    /// One regression + update pass. Records outside the working set, and
    /// records the regression could not serve, keep their previous state.
    /// A working record whose required covariate was blanked by the smoothing
    /// refresh is carried for this pass. The change measure sums only over
    /// records with positive weight, so zero-weight records cannot steer
    /// convergence.
    pub fn step(&self, snapshot: &EmSnapshot) -> StepOutcome {
        let refreshed;
        let dataset = match self.smoother {
            Some((column, smoother)) => {
                let outcomes: Vec<f64> = snapshot.states.iter().map(|s| s.posterior_mean).collect();
                refreshed = refresh_covariate(self.dataset, column, &outcomes, smoother);
                &refreshed
            }
            None => self.dataset,
        };

        let (active, blanked): (Vec<usize>, Vec<usize>) = self.working.iter().copied().partition(|&row| {
            let covariates = &dataset.records()[row].covariates;
            self.required.iter().all(|&j| covariates[j].is_some())
        });
        if !blanked.is_empty() {
            log::debug!(
                "{} variants lost a required covariate in the smoothing refresh",
                blanked.len()
            );
        }

        let response: Vec<f64> = active
            .iter()
            .map(|&row| snapshot.states[row].posterior_mean)
            .collect();
        let predictions = covariate_regression_step(dataset, &active, &response, &self.config.glm);

        let mut states = snapshot.states.clone();
        let mut tallies = StepTallies {
            missing_covariate_carries: blanked.len(),
            ..StepTallies::default()
        };
        for (&row, prediction) in active.iter().zip(predictions) {
            let record = &self.dataset.records()[row];
            match prediction {
                RecordPrediction::Fitted(pred) => {
                    let prior = self.updater.prior_shape(pred.mean, pred.variance);
                    if prior.fell_back {
                        tallies.degenerate_fallbacks += 1;
                        log::debug!(
                            "Variant '{}': mean {:.4}, variance {:.3e} give a degenerate Beta; using global prior",
                            record.key,
                            pred.mean,
                            pred.variance
                        );
                    }
                    let post = BetaBinomialUpdater::update(prior.shape, record.affected, record.total());
                    tallies.fitted += 1;
                    states[row] = VariantState {
                        prior: prior.shape,
                        prior_mean: post.prior_mean,
                        predicted: Some(pred),
                        posterior_mean: post.posterior_mean,
                    };
                }
                RecordPrediction::Carried(CarryReason::NoCovariates) => {
                    tallies.missing_covariate_carries += 1;
                }
                RecordPrediction::Carried(CarryReason::FitFailed(_)) => {
                    tallies.failed_fit_carries += 1;
                }
            }
        }

        let records = self.dataset.records();
        let delta: f64 = self
            .working
            .iter()
            .filter(|&&row| records[row].weight > 0.0)
            .map(|&row| (states[row].posterior_mean - snapshot.states[row].posterior_mean).abs())
            .sum();

        StepOutcome {
            snapshot: EmSnapshot {
                version: snapshot.version + 1,
                states,
            },
            delta,
            tallies,
        }
    }

    /// Iterates until converged or exhausted. Always terminates within
    /// `max_iterations` steps.
    pub fn run(&self) -> EmRun {
        let mut state = LoopState::Initializing;
        let mut snapshot = self.initial_snapshot();
        let mut deltas = Vec::with_capacity(self.config.max_iterations);
        let mut tallies = StepTallies::default();
        log::info!(
            "Starting EM over {} of {} variants (threshold {}, cap {})",
            self.working.len(),
            self.dataset.len(),
            self.config.convergence_threshold,
            self.config.max_iterations
        );

        let status = loop {
            if state == LoopState::Initializing {
                state = LoopState::Iterating;
            }
            let outcome = self.step(&snapshot);
            snapshot = outcome.snapshot;
            deltas.push(outcome.delta);
            tallies += outcome.tallies;
            log::debug!(
                "EM iteration {}: delta {:.6}, {} fitted, {} fallbacks",
                snapshot.version,
                outcome.delta,
                outcome.tallies.fitted,
                outcome.tallies.degenerate_fallbacks
            );

            if outcome.delta < self.config.convergence_threshold {
                state = LoopState::Converged;
                break ConvergenceStatus::Converged {
                    iterations: snapshot.version,
                    delta: outcome.delta,
                };
            }
            if snapshot.version >= self.config.max_iterations {
                state = LoopState::Exhausted;
                break ConvergenceStatus::Exhausted {
                    iterations: snapshot.version,
                    delta: outcome.delta,
                };
            }
        };

        match status {
            ConvergenceStatus::Converged { iterations, .. } => {
                log::info!("EM converged after {} iterations", iterations)
            }
            ConvergenceStatus::Exhausted { iterations, delta } => log::warn!(
                "EM did not converge within {} iterations (last delta {:.4})",
                iterations,
                delta
            ),
        }

        EmRun {
            snapshot,
            state,
            status,
            deltas,
            tallies,
        }
    }

    /// Final re-weighting pass and credible intervals. Returns the table and
    /// the number of records that fell back to the global prior here.
    pub fn finalize(&self, snapshot: &EmSnapshot) -> Result<(PosteriorTable, usize), EngineError> {
        let mut working = vec![false; self.dataset.len()];
        for &row in &self.working {
            working[row] = true;
        }

        let mut fallbacks = 0;
        let mut rows = Vec::with_capacity(self.dataset.len());
        for ((record, state), &eligible) in self
            .dataset
            .records()
            .iter()
            .zip(&snapshot.states)
            .zip(&working)
        {
            let prior = match state.predicted {
                Some(pred) if eligible => {
                    let variance = pred.mean * (1.0 - pred.mean)
                        / (1.0 + self.config.prior_equivalent_observations);
                    let prior = self.updater.prior_shape(pred.mean, variance);
                    if prior.fell_back {
                        fallbacks += 1;
                    }
                    prior.shape
                }
                _ => state.prior,
            };
            let post = BetaBinomialUpdater::update(prior, record.affected, record.total());
            let (low, high) = credible_interval(post.posterior, self.config.credible_level)
                .map_err(|source| EngineError::Interval {
                    key: record.key.clone(),
                    source,
                })?;
            rows.push(PosteriorRow {
                key: record.key.clone(),
                position: record.position,
                category: record.category,
                eligible,
                prior_mean: post.prior_mean,
                posterior_mean: post.posterior_mean,
                alpha: prior.alpha,
                beta: prior.beta,
                credible_interval_low: low,
                credible_interval_high: high,
                affected: record.affected,
                total: record.total(),
            });
        }
        if fallbacks > 0 {
            log::warn!("{} variants fell back to the global prior in the final pass", fallbacks);
        }
        Ok((PosteriorTable { rows }, fallbacks))
    }
}

/// Full pipeline: empirical prior, EM loop and final pass.
pub fn estimate(
    dataset: &VariantDataset,
    config: &EngineConfig,
    smoother: Option<&dyn DistanceSmoother>,
) -> Result<Estimate, EngineError> {
    config.validate()?;
    let (empirical_prior, prior_fallback, global) = match estimate_empirical_prior(dataset) {
        Ok(prior) => (Some(prior), None, prior.shape),
        Err(e) => {
            log::warn!(
                "{} Falling back to the configured prior {}.",
                e,
                config.fallback_prior
            );
            (None, Some(e.to_string()), config.fallback_prior)
        }
    };

    let mut em = EmLoop::new(dataset, config, global)?;
    if let Some(smoother) = smoother {
        em = em.with_smoother(smoother)?;
    }
    let run = em.run();
    let (table, final_degenerate_fallbacks) = em.finalize(&run.snapshot)?;

    let report = RunReport {
        global_prior: global,
        empirical_prior,
        prior_fallback,
        records: dataset.len(),
        eligible: em.working_set().len(),
        status: run.status,
        deltas: run.deltas,
        tallies: run.tallies,
        final_degenerate_fallbacks,
    };
    Ok(Estimate { table, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VariantRecord, reliability_weight};
    use approx::assert_abs_diff_eq;

    fn record(key: &str, category: MutationCategory, affected: u32, total: u32, covariates: Vec<Option<f64>>) -> VariantRecord {
        VariantRecord {
            key: key.to_string(),
            position: key.len() as u32,
            category,
            affected,
            unaffected: total - affected,
            weight: reliability_weight(total, 0.01),
            covariates,
        }
    }

    /// Missense variants whose penetrance follows a logistic trend in one
    /// covariate, plus a second covariate that is sometimes missing.
    fn trend_dataset(n: usize) -> VariantDataset {
        let mut records = Vec::with_capacity(n + 2);
        for i in 0..n {
            let x = i as f64 / n as f64 * 4.0 - 2.0;
            let p = 1.0 / (1.0 + (-(1.2 * x - 1.0)).exp());
            let total = 3 + (i * 5) % 17;
            let affected = ((p * total as f64).round() as usize).min(total);
            let second = if i % 3 == 0 { None } else { Some(((i * 11) % 13) as f64 / 13.0) };
            records.push(VariantRecord {
                key: format!("M{i}"),
                position: i as u32 + 1,
                category: MutationCategory::Missense,
                affected: affected as u32,
                unaffected: (total - affected) as u32,
                weight: reliability_weight(total as u32, 0.01),
                covariates: vec![Some(x), second],
            });
        }
        records.push(record("R900X", MutationCategory::Nonsense, 4, 5, vec![None, None]));
        records.push(record("L901L", MutationCategory::Synonymous, 0, 3, vec![Some(0.1), Some(0.2)]));
        VariantDataset::new(vec!["function".to_string(), "revel".to_string()], records).unwrap()
    }

    #[test]
    fn every_snapshot_keeps_proper_shapes_and_interior_means() {
        let dataset = trend_dataset(120);
        let config = EngineConfig::default();
        let em = EmLoop::new(&dataset, &config, BetaShape::new(2.0, 8.0)).unwrap();
        let mut snapshot = em.initial_snapshot();
        for _ in 0..5 {
            let outcome = em.step(&snapshot);
            assert_eq!(outcome.snapshot.version, snapshot.version + 1);
            for state in &outcome.snapshot.states {
                assert!(state.prior.is_proper());
                assert!(state.posterior_mean > 0.0 && state.posterior_mean < 1.0);
                assert!(state.prior_mean > 0.0 && state.prior_mean < 1.0);
            }
            snapshot = outcome.snapshot;
        }
    }

    #[test]
    fn zero_carrier_records_have_posterior_equal_to_prior() {
        let mut records = trend_dataset(90).records().to_vec();
        records.push(record("Z0A", MutationCategory::Missense, 0, 0, vec![Some(0.5), Some(0.3)]));
        let dataset = VariantDataset::new(
            vec!["function".to_string(), "revel".to_string()],
            records,
        )
        .unwrap();
        let estimate = estimate(&dataset, &EngineConfig::default(), None).unwrap();
        for row in estimate.table.rows.iter().filter(|r| r.total == 0) {
            assert_eq!(row.posterior_mean, row.prior_mean, "{}", row.key);
        }
        assert!(estimate.table.get("Z0A").unwrap().eligible);
    }

    #[test]
    fn loop_terminates_within_the_cap() {
        let dataset = trend_dataset(60);
        let config = EngineConfig {
            convergence_threshold: 1e-12,
            max_iterations: 3,
            ..EngineConfig::default()
        };
        let em = EmLoop::new(&dataset, &config, BetaShape::new(2.0, 8.0)).unwrap();
        let run = em.run();
        assert_eq!(run.state, LoopState::Exhausted);
        assert!(!run.status.converged());
        assert_eq!(run.status.iterations(), 3);
        assert_eq!(run.deltas.len(), 3);
    }

    #[test]
    fn default_run_converges_and_reports() {
        let dataset = trend_dataset(150);
        let estimate = estimate(&dataset, &EngineConfig::default(), None).unwrap();
        let report = &estimate.report;
        assert!(report.status.converged(), "{report}");
        assert!(report.status.iterations() <= 25);
        assert_eq!(report.records, 152);
        assert_eq!(report.eligible, 150);
        assert!(report.empirical_prior.is_some());
        assert!(report.to_string().contains("EM converged"));
        for row in &estimate.table.rows {
            assert!(row.alpha > 0.0 && row.beta > 0.0);
            assert!(row.posterior_mean > 0.0 && row.posterior_mean < 1.0);
            assert!(row.credible_interval_low <= row.posterior_mean);
            assert!(row.credible_interval_high >= row.posterior_mean);
        }
        // Covariate-driven priors follow the trend.
        let low = estimate.table.get("M5").unwrap().prior_mean;
        let high = estimate.table.get("M145").unwrap().prior_mean;
        assert!(high > low);
    }

    #[test]
    fn ineligible_records_keep_the_global_prior() {
        let dataset = trend_dataset(100);
        let estimate = estimate(&dataset, &EngineConfig::default(), None).unwrap();
        let global = estimate.report.global_prior;
        let nonsense = estimate.table.get("R900X").unwrap();
        assert!(!nonsense.eligible);
        assert_eq!(nonsense.prior_shape(), global);
        assert_abs_diff_eq!(
            nonsense.posterior_mean,
            (global.alpha + 4.0) / (global.alpha + global.beta + 5.0),
            epsilon = 1e-15
        );
    }

    #[test]
    fn required_covariates_restrict_the_working_set() {
        let dataset = trend_dataset(30);
        let config = EngineConfig {
            required_covariates: vec!["revel".to_string()],
            ..EngineConfig::default()
        };
        let em = EmLoop::new(&dataset, &config, BetaShape::new(2.0, 8.0)).unwrap();
        assert_eq!(em.working_set().len(), 20);

        let unknown = EngineConfig {
            required_covariates: vec!["nope".to_string()],
            ..EngineConfig::default()
        };
        assert!(matches!(
            EmLoop::new(&dataset, &unknown, BetaShape::new(2.0, 8.0)),
            Err(EngineError::Data(DataError::UnknownCovariate(_)))
        ));
    }

    #[test]
    fn records_blanked_by_the_smoothing_refresh_are_carried() {
        use crate::smoothing::{LookupSmoother, SmoothedEstimate};

        let dataset = trend_dataset(60);
        let config = EngineConfig {
            required_covariates: vec!["revel".to_string()],
            smoothing_covariate: Some("revel".to_string()),
            ..EngineConfig::default()
        };
        // Only the first thirty positions have a smoothed value.
        let smoother = LookupSmoother::new((1..=30u32).map(|position| {
            (
                position,
                SmoothedEstimate {
                    value: position as f64 / 30.0,
                    confidence: 1.0,
                },
            )
        }));
        let em = EmLoop::new(&dataset, &config, BetaShape::new(2.0, 8.0))
            .unwrap()
            .with_smoother(&smoother)
            .unwrap();
        assert_eq!(em.working_set().len(), 40);

        let snapshot = em.initial_snapshot();
        let outcome = em.step(&snapshot);
        assert_eq!(outcome.tallies.missing_covariate_carries, 20);
        assert_eq!(outcome.tallies.fitted + outcome.tallies.failed_fit_carries, 20);
        for &row in em.working_set() {
            let record = &dataset.records()[row];
            let state = &outcome.snapshot.states[row];
            if record.position > 30 {
                assert!(state.predicted.is_none(), "{}", record.key);
                assert_eq!(state.posterior_mean, snapshot.states[row].posterior_mean);
            }
        }
    }

    #[test]
    fn zero_weight_counts_do_not_move_the_change_measure() {
        let dataset = trend_dataset(60);
        let config = EngineConfig::default();
        let masked = dataset.with_zeroed_weights(&(0..10).collect::<Vec<_>>());
        let mut records = masked.records().to_vec();
        for record in records.iter_mut().take(10) {
            std::mem::swap(&mut record.affected, &mut record.unaffected);
        }
        let altered = VariantDataset::new(dataset.covariate_names().to_vec(), records).unwrap();

        let global = BetaShape::new(2.0, 8.0);
        let first = EmLoop::new(&masked, &config, global).unwrap();
        let second = EmLoop::new(&altered, &config, global).unwrap();
        let first = first.step(&first.initial_snapshot());
        let second = second.step(&second.initial_snapshot());
        assert!(first.delta > 0.0);
        assert_abs_diff_eq!(first.delta, second.delta, epsilon = 1e-12);
    }

    #[test]
    fn uncovered_variant_reproduces_the_worked_example() {
        let mut records = trend_dataset(60).records().to_vec();
        records.push(record("X", MutationCategory::Missense, 3, 10, vec![None, None]));
        records.push(record("Y", MutationCategory::Missense, 0, 0, vec![None, None]));
        let dataset = VariantDataset::new(
            vec!["function".to_string(), "revel".to_string()],
            records,
        )
        .unwrap();
        let config = EngineConfig::default();
        let em = EmLoop::new(&dataset, &config, BetaShape::new(2.0, 8.0)).unwrap();
        let run = em.run();
        assert!(run.tallies.missing_covariate_carries >= 2);
        let (table, _) = em.finalize(&run.snapshot).unwrap();

        let x = table.get("X").unwrap();
        assert_abs_diff_eq!(x.prior_mean, 0.2, epsilon = 1e-15);
        assert_abs_diff_eq!(x.posterior_mean, 0.25, epsilon = 1e-15);
        let y = table.get("Y").unwrap();
        assert_eq!(y.posterior_mean, BetaShape::new(2.0, 8.0).mean());
    }

    #[test]
    fn degenerate_empirical_prior_uses_the_configured_fallback() {
        let records = vec![
            record("A1V", MutationCategory::Missense, 1, 2, vec![Some(0.1)]),
            record("B2V", MutationCategory::Missense, 2, 4, vec![Some(0.2)]),
            record("C3V", MutationCategory::Missense, 0, 0, vec![Some(0.3)]),
        ];
        let dataset = VariantDataset::new(vec!["function".to_string()], records).unwrap();
        let config = EngineConfig::default();
        let estimate = estimate(&dataset, &config, None).unwrap();
        assert_eq!(estimate.report.global_prior, config.fallback_prior);
        assert!(estimate.report.prior_fallback.is_some());
        assert!(estimate.report.to_string().contains("FALLBACK"));
    }
}
