//! Seam for the residue-distance smoothing service.
//!
//! The kernel computation over the residue-distance matrix lives outside this
//! crate. The EM loop only needs a local penetrance estimate and a confidence
//! weight per residue position, which it broadcasts to every variant sharing
//! that position.

use crate::data::{DataError, VariantDataset};
use ahash::AHashMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

/// One observation handed to the smoother: where a variant sits and the
/// outcome currently attributed to it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionObservation {
    pub position: u32,
    pub outcome: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothedEstimate {
    pub value: f64,
    pub confidence: f64,
}

pub trait DistanceSmoother: Sync {
    /// Smoothed local estimate at `position` given the observation table.
    /// `None` means the service has nothing to say about that residue.
    fn smooth(&self, position: u32, observations: &[PositionObservation]) -> Option<SmoothedEstimate>;
}

/// Serves estimates computed ahead of time by the external service.
#[derive(Clone, Debug, Default)]
pub struct LookupSmoother {
    table: AHashMap<u32, SmoothedEstimate>,
}

impl LookupSmoother {
    pub fn new(entries: impl IntoIterator<Item = (u32, SmoothedEstimate)>) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }
}

#[derive(Deserialize)]
struct LookupEntry {
    position: u32,
    value: f64,
    confidence: f64,
}

/// Reads a `position`, `value`, `confidence` TSV exported by the smoothing
/// service.
pub fn load_lookup_smoother(path: impl AsRef<Path>) -> Result<LookupSmoother, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    let mut entries = Vec::new();
    for row in reader.deserialize() {
        let entry: LookupEntry = row?;
        entries.push((
            entry.position,
            SmoothedEstimate {
                value: entry.value,
                confidence: entry.confidence,
            },
        ));
    }
    Ok(LookupSmoother::new(entries))
}

impl DistanceSmoother for LookupSmoother {
    fn smooth(&self, position: u32, _: &[PositionObservation]) -> Option<SmoothedEstimate> {
        self.table.get(&position).copied()
    }
}

/// Recomputes one covariate column from the smoother. The service is called
/// once per distinct residue position; positions with no estimate or a zero
/// confidence weight leave the covariate missing.
pub fn refresh_covariate(
    dataset: &VariantDataset,
    column: usize,
    outcomes: &[f64],
    smoother: &dyn DistanceSmoother,
) -> VariantDataset {
    let observations: Vec<PositionObservation> = dataset
        .records()
        .iter()
        .zip(outcomes)
        .map(|(record, &outcome)| PositionObservation {
            position: record.position,
            outcome,
            weight: record.weight,
        })
        .collect();

    let positions: BTreeSet<u32> = dataset.records().iter().map(|r| r.position).collect();
    let per_position: AHashMap<u32, Option<f64>> = positions
        .into_iter()
        .map(|position| {
            let value = smoother
                .smooth(position, &observations)
                .filter(|e| e.confidence > 0.0 && e.value.is_finite())
                .map(|e| e.value);
            (position, value)
        })
        .collect();

    let values: Vec<Option<f64>> = dataset
        .records()
        .iter()
        .map(|r| per_position.get(&r.position).copied().flatten())
        .collect();
    log::debug!(
        "Refreshed covariate '{}' at {} residue positions",
        dataset.covariate_names()[column],
        per_position.len()
    );
    dataset.with_covariate_column(column, &values)
}
