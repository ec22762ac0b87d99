//! Population-level empirical prior.
//!
//! An intercept-only weighted linear model of raw penetrance over missense
//! variants with a positive reliability weight. Its coefficient is the global
//! weighted mean `p`; the weighted mean squared residual `v` stands in for the
//! between-variant variance. Both are mapped to Beta(alpha0, beta0) by method
//! of moments.

use crate::beta::moments_to_shape;
use crate::data::VariantDataset;
use crate::types::BetaShape;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriorError {
    #[error("No missense variant has a positive reliability weight; the empirical prior is undefined.")]
    NoInformativeRecords,
    #[error(
        "Empirical prior is degenerate: weighted mean {mean:.6}, variance {variance:.6e} give {shape}"
    )]
    Degenerate {
        mean: f64,
        variance: f64,
        shape: BetaShape,
    },
}

/// Moments behind the empirical prior, kept for reporting.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmpiricalPrior {
    pub mean: f64,
    pub variance: f64,
    pub shape: BetaShape,
    pub records_used: usize,
}

/// Weighted mean and weighted mean squared residual of `values`.
pub fn weighted_moments(values: &[f64], weights: &[f64]) -> Option<(f64, f64)> {
    let total_weight: f64 = weights.iter().sum();
    if !(total_weight > 0.0) {
        return None;
    }
    let mean = values
        .iter()
        .zip(weights)
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / total_weight;
    let variance = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - mean) * (v - mean))
        .sum::<f64>()
        / total_weight;
    Some((mean, variance))
}

pub fn estimate_empirical_prior(dataset: &VariantDataset) -> Result<EmpiricalPrior, PriorError> {
    let (values, weights): (Vec<f64>, Vec<f64>) = dataset
        .records()
        .iter()
        .filter(|r| r.is_missense() && r.weight > 0.0)
        .filter_map(|r| r.empirical_penetrance().map(|p| (p, r.weight)))
        .unzip();

    let (mean, variance) =
        weighted_moments(&values, &weights).ok_or(PriorError::NoInformativeRecords)?;
    let shape = moments_to_shape(mean, variance);

    let in_unit_interval = mean > 0.0 && mean < 1.0;
    if !in_unit_interval || !(variance > 0.0) || !shape.is_proper() {
        return Err(PriorError::Degenerate {
            mean,
            variance,
            shape,
        });
    }

    log::info!(
        "Empirical prior from {} missense variants: mean {:.4}, variance {:.4e} -> {}",
        values.len(),
        mean,
        variance,
        shape
    );
    Ok(EmpiricalPrior {
        mean,
        variance,
        shape,
        records_used: values.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MutationCategory, VariantRecord, reliability_weight};
    use approx::assert_abs_diff_eq;

    fn record(key: &str, category: MutationCategory, affected: u32, unaffected: u32) -> VariantRecord {
        VariantRecord {
            key: key.to_string(),
            position: 1,
            category,
            affected,
            unaffected,
            weight: reliability_weight(affected + unaffected, 0.01),
            covariates: vec![],
        }
    }

    #[test]
    fn weighted_moments_match_hand_computation() {
        let (mean, variance) = weighted_moments(&[0.0, 1.0], &[1.0, 3.0]).unwrap();
        assert_abs_diff_eq!(mean, 0.75);
        assert_abs_diff_eq!(variance, (0.75 * 0.75 + 3.0 * 0.25 * 0.25) / 4.0);
        assert!(weighted_moments(&[0.5], &[0.0]).is_none());
    }

    #[test]
    fn prior_ignores_non_missense_and_unobserved_variants() {
        let dataset = VariantDataset::new(
            vec![],
            vec![
                record("A1V", MutationCategory::Missense, 2, 8),
                record("B2V", MutationCategory::Missense, 4, 6),
                record("C3V", MutationCategory::Missense, 0, 0),
                record("R4X", MutationCategory::Nonsense, 10, 0),
            ],
        )
        .unwrap();
        let prior = estimate_empirical_prior(&dataset).unwrap();
        assert_eq!(prior.records_used, 2);
        assert_abs_diff_eq!(prior.mean, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.variance, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.shape.mean(), 0.3, epsilon = 1e-9);
        assert!(prior.shape.is_proper());
    }

    #[test]
    fn zero_variance_is_surfaced_as_degenerate() {
        let dataset = VariantDataset::new(
            vec![],
            vec![
                record("A1V", MutationCategory::Missense, 1, 1),
                record("B2V", MutationCategory::Missense, 2, 2),
            ],
        )
        .unwrap();
        assert!(matches!(
            estimate_empirical_prior(&dataset),
            Err(PriorError::Degenerate { .. })
        ));
    }

    #[test]
    fn all_unaffected_is_surfaced_as_degenerate() {
        let dataset = VariantDataset::new(
            vec![],
            vec![
                record("A1V", MutationCategory::Missense, 0, 4),
                record("B2V", MutationCategory::Missense, 0, 9),
            ],
        )
        .unwrap();
        assert!(matches!(
            estimate_empirical_prior(&dataset),
            Err(PriorError::Degenerate { .. })
        ));
    }

    #[test]
    fn no_weighted_missense_records_is_an_error() {
        let dataset =
            VariantDataset::new(vec![], vec![record("R4X", MutationCategory::Nonsense, 1, 1)])
                .unwrap();
        assert_eq!(
            estimate_empirical_prior(&dataset),
            Err(PriorError::NoInformativeRecords)
        );
    }
}
