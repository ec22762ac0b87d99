//! # Calibration and Evaluation Harness
//!
//! Weighted rank and linear correlation with permutation p-values, the Brier
//! score, and k-fold cross-validation of the full EM procedure.
//!
//! Cross-validation does not drop held-out variants from the table. Their
//! reliability weight is set to exactly zero, which removes them from every
//! weighted fit (the empirical prior and each regression) while keeping them
//! in the working set so they still receive a covariate prediction.

use crate::config::{EngineConfig, PermutationConfig};
use crate::data::VariantDataset;
use crate::em::{EngineError, Estimate, estimate};
use crate::smoothing::DistanceSmoother;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorrelationMethod {
    Spearman,
    Pearson,
}

/// Weighted Pearson correlation. `None` when undefined (no weight, fewer
/// than two points, or a constant column).
pub fn weighted_pearson(x: &[f64], y: &[f64], w: &[f64]) -> Option<f64> {
    let total: f64 = w.iter().sum();
    if x.len() < 2 || !(total > 0.0) {
        return None;
    }
    let mean_x = x.iter().zip(w).map(|(v, wi)| v * wi).sum::<f64>() / total;
    let mean_y = y.iter().zip(w).map(|(v, wi)| v * wi).sum::<f64>() / total;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(w) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += wi * dx * dy;
        var_x += wi * dx * dx;
        var_y += wi * dy * dy;
    }
    let denom = (var_x * var_y).sqrt();
    if denom > 0.0 { Some(cov / denom) } else { None }
}

/// Ranks starting at 1, ties sharing their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

/// Weighted Pearson correlation of average ranks.
pub fn weighted_spearman(x: &[f64], y: &[f64], w: &[f64]) -> Option<f64> {
    weighted_pearson(&average_ranks(x), &average_ranks(y), w)
}

pub fn weighted_correlation(method: CorrelationMethod, x: &[f64], y: &[f64], w: &[f64]) -> Option<f64> {
    match method {
        CorrelationMethod::Spearman => weighted_spearman(x, y, w),
        CorrelationMethod::Pearson => weighted_pearson(x, y, w),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrelationTest {
    pub method: CorrelationMethod,
    pub estimate: f64,
    /// Fraction of permutations whose |correlation| is at least the observed.
    pub p_value: f64,
    pub n: usize,
}

/// Correlation with a permutation p-value: `y` is shuffled against fixed
/// `x` and `w`.
pub fn permutation_test(
    method: CorrelationMethod,
    x: &[f64],
    y: &[f64],
    w: &[f64],
    permutations: &PermutationConfig,
) -> Option<CorrelationTest> {
    let observed = weighted_correlation(method, x, y, w)?;
    let mut rng = StdRng::seed_from_u64(permutations.seed);
    let mut shuffled = y.to_vec();
    let mut exceed = 0usize;
    for _ in 0..permutations.count {
        shuffled.shuffle(&mut rng);
        if let Some(r) = weighted_correlation(method, x, &shuffled, w) {
            if r.abs() >= observed.abs() {
                exceed += 1;
            }
        }
    }
    Some(CorrelationTest {
        method,
        estimate: observed,
        p_value: exceed as f64 / permutations.count as f64,
        n: x.len(),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct CovariateCorrelation {
    pub covariate: String,
    pub spearman: Option<CorrelationTest>,
    pub pearson: Option<CorrelationTest>,
}

/// Correlates `target` with each covariate over records where both are
/// present and the reliability weight is positive.
pub fn correlation_table(
    dataset: &VariantDataset,
    target: &[Option<f64>],
    permutations: &PermutationConfig,
) -> Vec<CovariateCorrelation> {
    dataset
        .covariate_names()
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let mut x = Vec::new();
            let mut y = Vec::new();
            let mut w = Vec::new();
            for (record, t) in dataset.records().iter().zip(target) {
                if let (Some(c), Some(t)) = (record.covariates[j], t) {
                    if record.weight > 0.0 {
                        x.push(c);
                        y.push(*t);
                        w.push(record.weight);
                    }
                }
            }
            CovariateCorrelation {
                covariate: name.clone(),
                spearman: permutation_test(CorrelationMethod::Spearman, &x, &y, &w, permutations),
                pearson: permutation_test(CorrelationMethod::Pearson, &x, &y, &w, permutations),
            }
        })
        .collect()
}

/// Empirical penetrance column of a dataset.
pub fn empirical_penetrance(dataset: &VariantDataset) -> Vec<Option<f64>> {
    dataset
        .records()
        .iter()
        .map(|r| r.empirical_penetrance())
        .collect()
}

/// Unweighted mean squared error over rows where both values are present.
pub fn brier_score(predicted: &[Option<f64>], observed: &[Option<f64>]) -> Option<f64> {
    let (sum, n) = predicted
        .iter()
        .zip(observed)
        .filter_map(|(p, o)| Some((p.as_ref()?, o.as_ref()?)))
        .fold((0.0, 0usize), |(sum, n), (p, o)| (sum + (p - o) * (p - o), n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Random partition of `0..n` into `k` disjoint folds of near-equal size.
/// `k == 0` yields no folds.
pub fn kfold_partition(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    if k == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut folds = vec![Vec::with_capacity(n / k + 1); k];
    for (i, row) in order.into_iter().enumerate() {
        folds[i % k].push(row);
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

#[derive(Clone, Debug, PartialEq)]
pub struct FoldMetrics {
    pub fold: usize,
    pub held_out: usize,
    /// Held-out variants that could be scored (eligible, with carriers).
    pub scored: usize,
    pub spearman: Option<f64>,
    pub pearson: Option<f64>,
    pub brier: Option<f64>,
    pub converged: bool,
    /// The fold's empirical prior was degenerate and the configured
    /// fallback prior was used instead.
    pub prior_fallback: bool,
    /// Degenerate per-variant priors replaced by the global prior, over all
    /// iterations and the final pass.
    pub degenerate_fallbacks: usize,
    /// Per-iteration carries, either for a missing covariate or a failed fit.
    pub carried: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CrossValidation {
    pub folds: Vec<FoldMetrics>,
}

impl CrossValidation {
    pub fn spearman(&self) -> Vec<Option<f64>> {
        self.folds.iter().map(|f| f.spearman).collect()
    }

    pub fn pearson(&self) -> Vec<Option<f64>> {
        self.folds.iter().map(|f| f.pearson).collect()
    }

    pub fn brier(&self) -> Vec<Option<f64>> {
        self.folds.iter().map(|f| f.brier).collect()
    }
}

/// Full estimation with the reliability weight of `held_out` zeroed. The
/// held-out rows stay in the table and receive covariate priors fitted on
/// the remaining rows only.
pub fn fold_estimate(
    dataset: &VariantDataset,
    held_out: &[usize],
    config: &EngineConfig,
    smoother: Option<&dyn DistanceSmoother>,
) -> Result<Estimate, EngineError> {
    estimate(&dataset.with_zeroed_weights(held_out), config, smoother)
}

/// Reruns the whole estimation once per fold with that fold's weights
/// zeroed and scores the held-out covariate priors against observed
/// penetrance. Folds run in parallel and are reported in fold order.
pub fn cross_validate(
    dataset: &VariantDataset,
    config: &EngineConfig,
    smoother: Option<&dyn DistanceSmoother>,
) -> Result<CrossValidation, EngineError> {
    config.validate()?;
    let folds = kfold_partition(
        dataset.len(),
        config.cross_validation.folds,
        config.cross_validation.seed,
    );
    log::info!(
        "Cross-validating over {} folds of {} variants",
        folds.len(),
        dataset.len()
    );
    if smoother.is_some() {
        log::warn!(
            "A smoother is supplied to cross-validation. Smoothed values computed outside a fold \
             may carry information from its held-out variants."
        );
    }

    let metrics = folds
        .par_iter()
        .enumerate()
        .map(|(fold, rows)| -> Result<FoldMetrics, EngineError> {
            let run = fold_estimate(dataset, rows, config, smoother)?;

            let mut predicted = Vec::new();
            let mut observed = Vec::new();
            let mut weights = Vec::new();
            for &row in rows {
                let record = &dataset.records()[row];
                let result = &run.table.rows[row];
                if let (true, Some(p)) = (result.eligible, record.empirical_penetrance()) {
                    predicted.push(result.prior_mean);
                    observed.push(p);
                    weights.push(record.weight);
                }
            }
            let brier = brier_score(
                &predicted.iter().copied().map(Some).collect::<Vec<_>>(),
                &observed.iter().copied().map(Some).collect::<Vec<_>>(),
            );
            let report = &run.report;
            if report.prior_fallback.is_some() {
                log::warn!("Fold {fold} used the fallback prior {}", report.global_prior);
            }
            Ok(FoldMetrics {
                fold,
                held_out: rows.len(),
                scored: predicted.len(),
                spearman: weighted_spearman(&predicted, &observed, &weights),
                pearson: weighted_pearson(&predicted, &observed, &weights),
                brier,
                converged: report.status.converged(),
                prior_fallback: report.prior_fallback.is_some(),
                degenerate_fallbacks: report.tallies.degenerate_fallbacks
                    + report.final_degenerate_fallbacks,
                carried: report.tallies.missing_covariate_carries + report.tallies.failed_fit_carries,
            })
        })
        .collect::<Result<Vec<_>, EngineError>>()?;

    Ok(CrossValidation { folds: metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MutationCategory, VariantRecord, reliability_weight};
    use approx::assert_abs_diff_eq;

    #[test]
    fn pearson_matches_textbook_values() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0; 4];
        assert_abs_diff_eq!(weighted_pearson(&x, &[2.0, 4.0, 6.0, 8.0], &w).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weighted_pearson(&x, &[8.0, 6.0, 4.0, 2.0], &w).unwrap(), -1.0, epsilon = 1e-12);
        assert_eq!(weighted_pearson(&x, &[1.0; 4], &w), None);
    }

    #[test]
    fn zero_weight_points_do_not_count() {
        let x = [1.0, 2.0, 3.0, 100.0];
        let y = [1.0, 2.0, 3.0, -100.0];
        let r = weighted_pearson(&x, &y, &[1.0, 1.0, 1.0, 0.0]).unwrap();
        assert_abs_diff_eq!(r, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn ranks_average_ties() {
        assert_eq!(average_ranks(&[10.0, 30.0, 20.0, 20.0]), vec![1.0, 4.0, 2.5, 2.5]);
    }

    #[test]
    fn spearman_sees_monotone_nonlinear_relations() {
        let x: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v.powi(3)).collect();
        let w = vec![1.0; 10];
        assert_abs_diff_eq!(weighted_spearman(&x, &y, &w).unwrap(), 1.0, epsilon = 1e-12);
        assert!(weighted_pearson(&x, &y, &w).unwrap() < 1.0);
    }

    #[test]
    fn permutation_p_value_separates_signal_from_noise() {
        let x: Vec<f64> = (0..60).map(|v| v as f64).collect();
        let strong: Vec<f64> = x.iter().map(|v| v * 0.5 + ((v * 7.0) % 3.0)).collect();
        let noise: Vec<f64> = (0..60).map(|v| ((v * 37) % 11) as f64).collect();
        let w = vec![1.0; 60];
        let config = PermutationConfig { count: 500, seed: 7 };

        let signal = permutation_test(CorrelationMethod::Spearman, &x, &strong, &w, &config).unwrap();
        assert!(signal.p_value < 0.01);
        let null = permutation_test(CorrelationMethod::Pearson, &x, &noise, &w, &config).unwrap();
        assert!(null.p_value > 0.05);
        assert!(null.p_value <= 1.0);
    }

    #[test]
    fn brier_skips_missing_pairs() {
        let predicted = [Some(0.2), None, Some(0.5)];
        let observed = [Some(0.0), Some(1.0), Some(1.0)];
        assert_abs_diff_eq!(brier_score(&predicted, &observed).unwrap(), (0.04 + 0.25) / 2.0);
        assert_eq!(brier_score(&[None], &[Some(1.0)]), None);
    }

    #[test]
    fn kfold_partition_covers_every_row_once() {
        let folds = kfold_partition(103, 10, 3);
        assert_eq!(folds.len(), 10);
        let mut seen: Vec<usize> = folds.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..103).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() == 10 || f.len() == 11));
        assert_eq!(folds, kfold_partition(103, 10, 3));
    }

    #[test]
    fn zero_folds_yield_an_empty_partition() {
        assert!(kfold_partition(10, 0, 3).is_empty());
        assert!(kfold_partition(0, 4, 3).iter().all(Vec::is_empty));
    }

    fn flat_dataset(n: u32) -> VariantDataset {
        let records = (0..n)
            .map(|i| VariantRecord {
                key: format!("F{i}"),
                position: i + 1,
                category: MutationCategory::Missense,
                affected: 2,
                unaffected: 8,
                weight: reliability_weight(10, 0.01),
                covariates: vec![Some(i as f64 / n as f64), None],
            })
            .collect();
        VariantDataset::new(vec!["function".to_string(), "smoothed".to_string()], records).unwrap()
    }

    #[test]
    fn folds_report_the_fallback_prior() {
        let config = EngineConfig {
            cross_validation: crate::config::CrossValidationConfig { folds: 3, seed: 5 },
            ..EngineConfig::default()
        };
        let cv = cross_validate(&flat_dataset(30), &config, None).unwrap();
        assert_eq!(cv.folds.len(), 3);
        assert!(cv.folds.iter().all(|f| f.prior_fallback), "{cv:?}");
    }

    #[test]
    fn cross_validation_accepts_a_lookup_smoother() {
        use crate::smoothing::{LookupSmoother, SmoothedEstimate};

        let mut records = flat_dataset(30).records().to_vec();
        for (i, record) in records.iter_mut().enumerate() {
            record.affected = (i % 7) as u32;
            record.unaffected = 10 - record.affected;
        }
        let dataset = VariantDataset::new(vec!["function".to_string(), "smoothed".to_string()], records).unwrap();
        let smoother = LookupSmoother::new((1..=30u32).map(|position| {
            (
                position,
                SmoothedEstimate {
                    value: (position % 7) as f64 / 7.0,
                    confidence: 1.0,
                },
            )
        }));
        let config = EngineConfig {
            smoothing_covariate: Some("smoothed".to_string()),
            cross_validation: crate::config::CrossValidationConfig { folds: 3, seed: 5 },
            ..EngineConfig::default()
        };
        let cv = cross_validate(&dataset, &config, Some(&smoother)).unwrap();
        assert_eq!(cv.folds.iter().map(|f| f.held_out).sum::<usize>(), 30);
        assert!(cv.folds.iter().all(|f| !f.prior_fallback));
    }

    #[test]
    fn correlation_table_uses_pairwise_complete_rows() {
        let records: Vec<VariantRecord> = (0..40)
            .map(|i| VariantRecord {
                key: format!("V{i}"),
                position: i,
                category: MutationCategory::Missense,
                affected: i % 5,
                unaffected: 10 - i % 5,
                weight: reliability_weight(10, 0.01),
                covariates: vec![Some((i % 5) as f64), if i % 2 == 0 { None } else { Some(1.0) }],
            })
            .collect();
        let dataset = VariantDataset::new(vec!["good".to_string(), "flat".to_string()], records).unwrap();
        let table = correlation_table(&dataset, &empirical_penetrance(&dataset), &PermutationConfig::default());
        assert_eq!(table.len(), 2);
        let good = table[0].spearman.unwrap();
        assert_abs_diff_eq!(good.estimate, 1.0, epsilon = 1e-12);
        assert_eq!(good.n, 40);
        assert_eq!(table[1].pearson, None);
    }
}
