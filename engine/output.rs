//! Tab-separated writers for posterior tables and diagnostics.

use crate::coverage::CoverageRow;
use crate::em::PosteriorTable;
use crate::evaluate::{CorrelationTest, CovariateCorrelation, CrossValidation};
use csv::WriterBuilder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode output row: {0}")]
    Csv(#[from] csv::Error),
}

fn create_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, OutputError> {
    let file = File::create(path)?;
    Ok(WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file)))
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.6}"))
}

/// Writes one row per variant with its prior and posterior summaries.
pub fn write_posterior_table<W: Write>(sink: W, table: &PosteriorTable) -> Result<(), OutputError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(sink);
    writer.write_record([
        "variant",
        "position",
        "category",
        "eligible",
        "affected",
        "total",
        "prior_mean",
        "posterior_mean",
        "alpha",
        "beta",
        "credible_interval_low",
        "credible_interval_high",
    ])?;
    for row in &table.rows {
        writer.write_record([
            row.key.clone(),
            row.position.to_string(),
            row.category.to_string(),
            row.eligible.to_string(),
            row.affected.to_string(),
            row.total.to_string(),
            format!("{:.6}", row.prior_mean),
            format!("{:.6}", row.posterior_mean),
            format!("{:.6}", row.alpha),
            format!("{:.6}", row.beta),
            format!("{:.6}", row.credible_interval_low),
            format!("{:.6}", row.credible_interval_high),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_posterior_table(path: &Path, table: &PosteriorTable) -> Result<(), OutputError> {
    let file = File::create(path)?;
    write_posterior_table(BufWriter::new(file), table)
}

pub fn save_coverage(path: &Path, rows: &[CoverageRow]) -> Result<(), OutputError> {
    let mut writer = create_writer(path)?;
    writer.write_record(["variant", "truth", "carriers", "trials", "covered", "coverage"])?;
    for row in rows {
        writer.write_record([
            row.key.clone(),
            format!("{:.6}", row.truth),
            row.carriers.to_string(),
            row.result.trials.to_string(),
            row.result.covered.to_string(),
            format!("{:.4}", row.result.coverage),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_correlations(path: &Path, rows: &[CovariateCorrelation]) -> Result<(), OutputError> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "covariate",
        "n",
        "spearman",
        "spearman_p",
        "pearson",
        "pearson_p",
    ])?;
    let estimate = |t: Option<CorrelationTest>| format_optional(t.map(|t| t.estimate));
    let p_value = |t: Option<CorrelationTest>| format_optional(t.map(|t| t.p_value));
    for row in rows {
        let n = row.spearman.or(row.pearson).map_or(0, |t| t.n);
        writer.write_record([
            row.covariate.clone(),
            n.to_string(),
            estimate(row.spearman),
            p_value(row.spearman),
            estimate(row.pearson),
            p_value(row.pearson),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_cross_validation(path: &Path, cv: &CrossValidation) -> Result<(), OutputError> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "fold",
        "held_out",
        "scored",
        "spearman",
        "pearson",
        "brier",
        "converged",
        "prior_fallback",
        "degenerate_fallbacks",
        "carried",
    ])?;
    for fold in &cv.folds {
        writer.write_record([
            fold.fold.to_string(),
            fold.held_out.to_string(),
            fold.scored.to_string(),
            format_optional(fold.spearman),
            format_optional(fold.pearson),
            format_optional(fold.brier),
            fold.converged.to_string(),
            fold.prior_fallback.to_string(),
            fold.degenerate_fallbacks.to_string(),
            fold.carried.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
