//! # Variant Dataset and Input Validation
//!
//! The in-memory table of per-variant records that every other component
//! consumes. Records arrive already deduplicated and merged; this module only
//! checks that what arrives is well formed and rejects malformed counts with
//! the offending variant identified.
//!
//! - Strict Schema: the tab-separated input must carry `variant`, `position`,
//!   `category`, `affected` and `unaffected`. An optional `total` column is
//!   cross-checked. Every other column is a numeric covariate.
//! - Missing covariates are kept as `None`, never imputed or replaced by a
//!   sentinel number.

use crate::types::{MutationCategory, VariantRecord, reliability_weight};
use ahash::AHashSet;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const RESERVED_COLUMNS: [&str; 6] = [
    "variant",
    "position",
    "category",
    "affected",
    "unaffected",
    "total",
];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed delimited input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Invalid record for variant '{key}': {reason}")]
    InvalidRecord { key: String, reason: String },
    #[error("Variant '{0}' appears more than once; counts must be merged upstream.")]
    DuplicateVariant(String),
    #[error("Record '{key}' carries {found} covariate values but the table declares {expected}.")]
    CovariateArity {
        key: String,
        found: usize,
        expected: usize,
    },
    #[error("Unknown covariate '{0}'.")]
    UnknownCovariate(String),
    #[error("The input table contains no variant records.")]
    EmptyDataset,
}

/// Counts as read from an upstream table, before integrality checks.
#[derive(Clone, Debug)]
pub struct RawVariant {
    pub key: String,
    pub position: f64,
    pub category: String,
    pub affected: Option<f64>,
    pub unaffected: Option<f64>,
    pub total: Option<f64>,
    pub covariates: Vec<Option<f64>>,
}

/// The validated per-variant table.
#[derive(Clone, Debug)]
pub struct VariantDataset {
    covariate_names: Vec<String>,
    records: Vec<VariantRecord>,
}

impl VariantDataset {
    /// Builds a dataset from already-typed records, enforcing unique keys,
    /// covariate arity and finite covariate values.
    pub fn new(
        covariate_names: Vec<String>,
        records: Vec<VariantRecord>,
    ) -> Result<Self, DataError> {
        if records.is_empty() {
            return Err(DataError::EmptyDataset);
        }
        let mut seen = AHashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.key.as_str()) {
                return Err(DataError::DuplicateVariant(record.key.clone()));
            }
            if record.covariates.len() != covariate_names.len() {
                return Err(DataError::CovariateArity {
                    key: record.key.clone(),
                    found: record.covariates.len(),
                    expected: covariate_names.len(),
                });
            }
            if record.covariates.iter().flatten().any(|v| !v.is_finite()) {
                return Err(DataError::InvalidRecord {
                    key: record.key.clone(),
                    reason: "covariate values must be finite; use a missing marker instead"
                        .to_string(),
                });
            }
            if !(record.weight >= 0.0 && record.weight <= 1.0) {
                return Err(DataError::InvalidRecord {
                    key: record.key.clone(),
                    reason: format!("reliability weight {} outside [0, 1]", record.weight),
                });
            }
        }
        Ok(Self {
            covariate_names,
            records,
        })
    }

    /// Validates raw upstream rows. Any malformed count aborts with the
    /// offending variant named.
    pub fn from_raw(
        covariate_names: Vec<String>,
        raw: Vec<RawVariant>,
        weight_epsilon: f64,
    ) -> Result<Self, DataError> {
        let mut records = Vec::with_capacity(raw.len());
        for row in raw {
            let invalid = |reason: String| DataError::InvalidRecord {
                key: row.key.clone(),
                reason,
            };
            let category: MutationCategory = row.category.parse().map_err(invalid)?;
            let position = as_count(row.position, "position").map_err(invalid)?;
            let affected = as_count(row.affected.unwrap_or(0.0), "affected").map_err(invalid)?;
            let unaffected =
                as_count(row.unaffected.unwrap_or(0.0), "unaffected").map_err(invalid)?;
            if let Some(total) = row.total {
                let total = as_count(total, "total").map_err(invalid)?;
                if affected > total {
                    return Err(invalid(format!(
                        "affected count {affected} exceeds total {total}"
                    )));
                }
                if affected as u64 + unaffected as u64 != total as u64 {
                    return Err(invalid(format!(
                        "total {total} != affected {affected} + unaffected {unaffected}"
                    )));
                }
            }
            let total = affected.checked_add(unaffected).ok_or_else(|| {
                invalid("carrier total overflows a 32-bit count".to_string())
            })?;
            records.push(VariantRecord {
                key: row.key,
                position,
                category,
                affected,
                unaffected,
                weight: reliability_weight(total, weight_epsilon),
                covariates: row.covariates,
            });
        }
        Self::new(covariate_names, records)
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn records(&self) -> &[VariantRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn covariate_index(&self, name: &str) -> Result<usize, DataError> {
        self.covariate_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DataError::UnknownCovariate(name.to_string()))
    }

    /// Copy of the dataset with the reliability weight of the given rows set
    /// to exactly zero. The rows stay in the table.
    pub fn with_zeroed_weights(&self, rows: &[usize]) -> Self {
        let mut masked = self.clone();
        for &row in rows {
            masked.records[row].weight = 0.0;
        }
        masked
    }

    /// Copy of the dataset with one covariate column replaced.
    pub fn with_covariate_column(&self, column: usize, values: &[Option<f64>]) -> Self {
        let mut replaced = self.clone();
        for (record, value) in replaced.records.iter_mut().zip(values) {
            record.covariates[column] = *value;
        }
        replaced
    }
}

fn as_count(value: f64, what: &str) -> Result<u32, String> {
    if !value.is_finite() {
        return Err(format!("{what} is not a finite number"));
    }
    if value < 0.0 {
        return Err(format!("{what} is negative ({value})"));
    }
    if value.fract() != 0.0 {
        return Err(format!("{what} is not an integer ({value})"));
    }
    if value > u32::MAX as f64 {
        return Err(format!("{what} is too large ({value})"));
    }
    Ok(value as u32)
}

/// Reads a tab-separated variant table. `NA` and empty cells are missing.
pub fn load_dataset(path: impl AsRef<Path>, weight_epsilon: f64) -> Result<VariantDataset, DataError> {
    let path = path.as_ref();
    log::info!("Loading variant table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for required in &RESERVED_COLUMNS[..5] {
        if !columns.iter().any(|c| c == required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }
    let covariate_names: Vec<String> = columns
        .iter()
        .filter(|c| !RESERVED_COLUMNS.contains(&c.as_str()))
        .cloned()
        .collect();

    let keys = extract_string_column(&df, "variant")?;
    let categories = extract_string_column(&df, "category")?;
    let positions = extract_numeric_column(&df, "position")?;
    let affected = extract_numeric_column(&df, "affected")?;
    let unaffected = extract_numeric_column(&df, "unaffected")?;
    let totals = if columns.iter().any(|c| c == "total") {
        Some(extract_numeric_column(&df, "total")?)
    } else {
        None
    };
    let covariate_columns = covariate_names
        .iter()
        .map(|name| extract_numeric_column(&df, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut raw = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let key = keys[row]
            .clone()
            .unwrap_or_else(|| format!("row{}", row + 1));
        let position = positions[row].ok_or_else(|| DataError::InvalidRecord {
            key: key.clone(),
            reason: "missing residue position".to_string(),
        })?;
        let category = categories[row].clone().ok_or_else(|| DataError::InvalidRecord {
            key: key.clone(),
            reason: "missing mutation category".to_string(),
        })?;
        raw.push(RawVariant {
            key,
            position,
            category,
            affected: affected[row],
            unaffected: unaffected[row],
            total: totals.as_ref().and_then(|t| t[row]),
            covariates: covariate_columns.iter().map(|c| c[row]).collect(),
        });
    }

    let dataset = VariantDataset::from_raw(covariate_names, raw, weight_epsilon)?;
    log::info!(
        "Loaded {} variants with {} covariates: {:?}",
        dataset.len(),
        dataset.covariate_names().len(),
        dataset.covariate_names()
    );
    Ok(dataset)
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(column_name)?;
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    // A failed string-to-number cast shows up as extra nulls.
    if casted.null_count() > series.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }
    Ok(casted.f64()?.into_iter().collect())
}

fn extract_string_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<String>>, DataError> {
    let casted = df.column(column_name)?.cast(&DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string).filter(|s| !s.is_empty()))
        .collect())
}
