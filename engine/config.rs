//! Run configuration for the penetrance engine.
//!
//! Every knob has a documented default, so an empty TOML file (or no file at
//! all) yields the reference procedure. The CLI loads an optional TOML file
//! first and then applies its own flag overrides on top.

use crate::types::BetaShape;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Control parameters for the inner IRLS solver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlmControl {
    pub max_iterations: usize,
    /// Relative deviance change below which IRLS stops.
    pub tolerance: f64,
}

impl Default for GlmControl {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrossValidationConfig {
    pub folds: usize,
    pub seed: u64,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self { folds: 10, seed: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoverageConfig {
    pub trials: usize,
    pub seed: u64,
    /// Reporting granularity; interval bounds are rounded outward to a
    /// multiple of this step. `None` reports the raw quantiles.
    pub interval_step: Option<f64>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            trials: 1000,
            seed: 1,
            interval_step: Some(0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PermutationConfig {
    pub count: usize,
    pub seed: u64,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self {
            count: 1000,
            seed: 1,
        }
    }
}

/// The complete set of tuning constants for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// `eps` in the reliability weight `1 - 1/(eps + total)`.
    pub weight_epsilon: f64,
    /// Summed absolute change in posterior means that counts as converged.
    pub convergence_threshold: f64,
    pub max_iterations: usize,
    /// Shape parameters below this floor are replaced by the global prior.
    pub shape_floor: f64,
    /// How many heterozygote observations the covariate prior is worth in
    /// the final re-weighting pass.
    pub prior_equivalent_observations: f64,
    pub credible_level: f64,
    /// Covariates a missense record must carry to enter the EM loop.
    pub required_covariates: Vec<String>,
    /// Used when the empirical prior cannot be derived from the data.
    pub fallback_prior: BetaShape,
    pub glm: GlmControl,
    /// Covariate column refreshed from the distance smoother each iteration.
    pub smoothing_covariate: Option<String>,
    pub cross_validation: CrossValidationConfig,
    pub coverage: CoverageConfig,
    pub permutations: PermutationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weight_epsilon: 0.01,
            convergence_threshold: 1.0,
            max_iterations: 25,
            shape_floor: 0.01,
            prior_equivalent_observations: 10.0,
            credible_level: 0.95,
            required_covariates: Vec::new(),
            fallback_prior: BetaShape::new(1.0, 1.0),
            glm: GlmControl::default(),
            smoothing_covariate: None,
            cross_validation: CrossValidationConfig::default(),
            coverage: CoverageConfig::default(),
            permutations: PermutationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if !(self.weight_epsilon > 0.0 && self.weight_epsilon.is_finite()) {
            return Err(invalid("weight_epsilon", "must be a positive finite number"));
        }
        if !(self.convergence_threshold > 0.0) {
            return Err(invalid("convergence_threshold", "must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1"));
        }
        if !(self.shape_floor > 0.0) {
            return Err(invalid("shape_floor", "must be positive"));
        }
        if !(self.prior_equivalent_observations > 0.0) {
            return Err(invalid(
                "prior_equivalent_observations",
                "must be positive",
            ));
        }
        if !(self.credible_level > 0.0 && self.credible_level < 1.0) {
            return Err(invalid("credible_level", "must lie strictly between 0 and 1"));
        }
        if !self.fallback_prior.is_proper() {
            return Err(invalid(
                "fallback_prior",
                format!("{} is not a proper Beta distribution", self.fallback_prior),
            ));
        }
        if self.glm.max_iterations == 0 || !(self.glm.tolerance > 0.0) {
            return Err(invalid("glm", "needs max_iterations >= 1 and tolerance > 0"));
        }
        if self.cross_validation.folds < 2 {
            return Err(invalid("cross_validation.folds", "need at least 2 folds"));
        }
        if self.coverage.trials == 0 {
            return Err(invalid("coverage.trials", "must be at least 1"));
        }
        if let Some(step) = self.coverage.interval_step {
            if !(step > 0.0 && step < 1.0) {
                return Err(invalid("coverage.interval_step", "must lie in (0, 1)"));
            }
        }
        if self.permutations.count == 0 {
            return Err(invalid("permutations.count", "must be at least 1"));
        }
        Ok(())
    }
}
