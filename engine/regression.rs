//! Covariate-conditioned regression step.
//!
//! Each record gets a prediction from a model that uses exactly the
//! covariates that record has. Missing covariates drop out of that record's
//! formula; they are never imputed. The model for a record is fitted on every
//! working-set row that carries the same covariate subset, so records sharing a
//! presence mask share one fit. Distinct masks are fitted in parallel against
//! a read-only view of the working table and merged back by row order.

use crate::config::GlmControl;
use crate::data::VariantDataset;
use crate::glm::{GlmFit, Prediction, fit_quasi_binomial};
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use rayon::prelude::*;

/// Why a record kept its previous estimate for this iteration.
#[derive(Clone, Debug, PartialEq)]
pub enum CarryReason {
    /// The record has no usable covariate.
    NoCovariates,
    /// The model over the record's covariate subset could not be fitted.
    FitFailed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordPrediction {
    Fitted(Prediction),
    Carried(CarryReason),
}

/// Design matrix, response and prior weights for one covariate subset.
fn design_for_mask(
    dataset: &VariantDataset,
    working: &[usize],
    response: &[f64],
    mask: &[bool],
) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let columns: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(j, &present)| present.then_some(j))
        .collect();
    let records = dataset.records();

    let rows: Vec<(usize, &[Option<f64>])> = working
        .iter()
        .enumerate()
        .map(|(slot, &row)| (slot, records[row].covariates.as_slice()))
        .filter(|(_, covariates)| columns.iter().all(|&j| covariates[j].is_some()))
        .collect();

    let mut x = Array2::ones((rows.len(), columns.len() + 1));
    let mut y = Array1::zeros(rows.len());
    let mut w = Array1::zeros(rows.len());
    for (i, (slot, covariates)) in rows.iter().enumerate() {
        for (k, &j) in columns.iter().enumerate() {
            x[[i, k + 1]] = covariates[j].unwrap_or_default();
        }
        y[i] = response[*slot];
        w[i] = records[working[*slot]].weight;
    }
    (x, y, w)
}

fn design_row(covariates: &[Option<f64>]) -> Array1<f64> {
    std::iter::once(1.0)
        .chain(covariates.iter().flatten().copied())
        .collect()
}

/// Runs one regression pass over the working set.
///
/// `working` lists dataset rows taking part; `response` holds the current
/// posterior-mean estimate for each of them, in the same order. The result is
/// aligned with `working`.
pub fn covariate_regression_step(
    dataset: &VariantDataset,
    working: &[usize],
    response: &[f64],
    control: &GlmControl,
) -> Vec<RecordPrediction> {
    assert_eq!(
        working.len(),
        response.len(),
        "response must align with the working set"
    );
    let records = dataset.records();

    let mut mask_ids: AHashMap<Vec<bool>, usize> = AHashMap::new();
    let mut masks: Vec<Vec<bool>> = Vec::new();
    let record_masks: Vec<usize> = working
        .iter()
        .map(|&row| {
            let mask = records[row].covariate_mask();
            *mask_ids.entry(mask.clone()).or_insert_with(|| {
                masks.push(mask);
                masks.len() - 1
            })
        })
        .collect();

    let fits: Vec<Option<Result<GlmFit, String>>> = masks
        .par_iter()
        .map(|mask| {
            if !mask.iter().any(|&present| present) {
                return None;
            }
            let (x, y, w) = design_for_mask(dataset, working, response, mask);
            Some(fit_quasi_binomial(x.view(), y.view(), w.view(), control).map_err(|e| e.to_string()))
        })
        .collect();

    for (mask, fit) in masks.iter().zip(&fits) {
        if let Some(Err(reason)) = fit {
            log::warn!(
                "Regression over covariate subset {:?} failed: {}",
                subset_names(dataset, mask),
                reason
            );
        }
    }

    working
        .iter()
        .zip(&record_masks)
        .map(|(&row, &mask_id)| match &fits[mask_id] {
            None => RecordPrediction::Carried(CarryReason::NoCovariates),
            Some(Err(reason)) => RecordPrediction::Carried(CarryReason::FitFailed(reason.clone())),
            Some(Ok(fit)) => {
                let x_row = design_row(&records[row].covariates);
                RecordPrediction::Fitted(fit.predict(x_row.view()))
            }
        })
        .collect()
}

fn subset_names<'a>(dataset: &'a VariantDataset, mask: &[bool]) -> Vec<&'a str> {
    dataset
        .covariate_names()
        .iter()
        .zip(mask)
        .filter(|(_, present)| **present)
        .map(|(name, _)| name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MutationCategory, VariantRecord, reliability_weight};
    use approx::assert_abs_diff_eq;

    fn record(i: usize, covariates: Vec<Option<f64>>) -> VariantRecord {
        let total = 5 + (i % 7) as u32;
        VariantRecord {
            key: format!("V{i}"),
            position: i as u32,
            category: MutationCategory::Missense,
            affected: (i % 3) as u32,
            unaffected: total - (i % 3) as u32,
            weight: reliability_weight(total, 0.01),
            covariates,
        }
    }

    fn synthetic(n: usize) -> (VariantDataset, Vec<f64>) {
        let mut records = Vec::with_capacity(n);
        let mut response = Vec::with_capacity(n);
        for i in 0..n {
            let a = (i as f64 / n as f64) * 4.0 - 2.0;
            let b = ((i * 7) % n) as f64 / n as f64;
            let p = 1.0 / (1.0 + (-(0.8 * a + 0.5 * b - 1.0)).exp());
            let second = if i % 4 == 0 { None } else { Some(b) };
            records.push(record(i, vec![Some(a), second]));
            response.push(p);
        }
        (
            VariantDataset::new(vec!["a".to_string(), "b".to_string()], records).unwrap(),
            response,
        )
    }

    #[test]
    fn each_record_uses_its_own_covariate_subset() {
        let (dataset, response) = synthetic(80);
        let working: Vec<usize> = (0..dataset.len()).collect();
        let predictions =
            covariate_regression_step(&dataset, &working, &response, &GlmControl::default());
        assert_eq!(predictions.len(), working.len());

        // Full-mask records are fitted on exact logistic data; predictions match.
        match &predictions[1] {
            RecordPrediction::Fitted(p) => {
                assert_abs_diff_eq!(p.mean, response[1], epsilon = 1e-6);
                assert!(p.variance >= 0.0);
            }
            other => panic!("expected a fitted prediction, got {:?}", other),
        }
        // Records missing `b` get an `a`-only model and still a prediction.
        match &predictions[0] {
            RecordPrediction::Fitted(p) => assert!(p.mean > 0.0 && p.mean < 1.0),
            other => panic!("expected a fitted prediction, got {:?}", other),
        }
    }

    #[test]
    fn records_without_covariates_are_carried() {
        let (mut dataset, mut response) = synthetic(40);
        let mut records = dataset.records().to_vec();
        records.push(record(999, vec![None, None]));
        response.push(0.2);
        dataset = VariantDataset::new(dataset.covariate_names().to_vec(), records).unwrap();
        let working: Vec<usize> = (0..dataset.len()).collect();
        let predictions =
            covariate_regression_step(&dataset, &working, &response, &GlmControl::default());
        assert_eq!(
            predictions.last(),
            Some(&RecordPrediction::Carried(CarryReason::NoCovariates))
        );
    }

    #[test]
    fn a_mask_with_too_few_rows_is_carried_not_fatal() {
        let mut records: Vec<VariantRecord> = (0..30).map(|i| record(i, vec![Some(i as f64 / 30.0), None])).collect();
        records.push(record(30, vec![None, Some(0.4)]));
        let dataset =
            VariantDataset::new(vec!["a".to_string(), "b".to_string()], records).unwrap();
        let response: Vec<f64> = (0..dataset.len()).map(|i| 0.1 + i as f64 / 100.0).collect();
        let working: Vec<usize> = (0..dataset.len()).collect();
        let predictions =
            covariate_regression_step(&dataset, &working, &response, &GlmControl::default());
        assert!(matches!(
            predictions.last(),
            Some(RecordPrediction::Carried(CarryReason::FitFailed(_)))
        ));
        assert!(matches!(predictions[0], RecordPrediction::Fitted(_)));
    }

    #[test]
    fn design_row_keeps_intercept_and_present_values_in_order() {
        let row = design_row(&[Some(2.0), None, Some(3.0)]);
        assert_eq!(row.to_vec(), vec![1.0, 2.0, 3.0]);
    }
}
