//! Method-of-moments Beta parameterisation and the conjugate Beta-Binomial
//! update.

use crate::types::BetaShape;
use statrs::distribution::{Beta, ContinuousCDF};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BetaError {
    #[error("Beta({alpha}, {beta}) is not a proper distribution")]
    InvalidShape { alpha: f64, beta: f64 },
}

/// Raw method-of-moments shape parameters for a (mean, variance) pair.
/// The result may be negative or non-finite; callers decide what to do.
pub fn moments_to_shape(mean: f64, variance: f64) -> BetaShape {
    let alpha = ((1.0 - mean) / variance - 1.0 / mean) * mean * mean;
    let beta = alpha * (1.0 / mean - 1.0);
    BetaShape { alpha, beta }
}

/// Shape parameters that put `equivalent_observations` pseudo-carriers
/// behind `mean`, i.e. variance `mean(1-mean)/(1+k)`.
pub fn shape_with_strength(mean: f64, equivalent_observations: f64) -> BetaShape {
    let variance = mean * (1.0 - mean) / (1.0 + equivalent_observations);
    moments_to_shape(mean, variance)
}

/// A prior shape plus whether it had to be replaced by the global prior.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriorShape {
    pub shape: BetaShape,
    pub fell_back: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Posterior {
    pub prior: BetaShape,
    pub prior_mean: f64,
    pub posterior: BetaShape,
    pub posterior_mean: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct BetaBinomialUpdater {
    global: BetaShape,
    floor: f64,
}

impl BetaBinomialUpdater {
    pub fn new(global: BetaShape, floor: f64) -> Self {
        Self { global, floor }
    }

    pub fn global(&self) -> BetaShape {
        self.global
    }

    /// Converts a (mean, variance) pair to a prior. Shapes below the floor
    /// (or undefined) are replaced wholesale by the global empirical prior.
    /// The 0.01 floor is a heuristic guard kept as-is; it has no principled
    /// derivation.
    pub fn prior_shape(&self, mean: f64, variance: f64) -> PriorShape {
        let derived = moments_to_shape(mean, variance);
        let degenerate = !(derived.alpha.is_finite() && derived.beta.is_finite())
            || derived.alpha < self.floor
            || derived.beta < self.floor;
        if degenerate {
            PriorShape {
                shape: self.global,
                fell_back: true,
            }
        } else {
            PriorShape {
                shape: derived,
                fell_back: false,
            }
        }
    }

    /// Folds observed counts into a prior.
    pub fn update(prior: BetaShape, affected: u32, total: u32) -> Posterior {
        let k = affected as f64;
        let n = total as f64;
        let posterior = BetaShape::new(prior.alpha + k, prior.beta + n - k);
        Posterior {
            prior,
            prior_mean: prior.mean(),
            posterior,
            posterior_mean: (prior.alpha + k) / (prior.alpha + prior.beta + n),
        }
    }
}

/// Equal-tailed credible interval of a Beta distribution.
pub fn credible_interval(shape: BetaShape, level: f64) -> Result<(f64, f64), BetaError> {
    let dist = Beta::new(shape.alpha, shape.beta).map_err(|_| BetaError::InvalidShape {
        alpha: shape.alpha,
        beta: shape.beta,
    })?;
    let tail = (1.0 - level) / 2.0;
    Ok((dist.inverse_cdf(tail), dist.inverse_cdf(1.0 - tail)))
}
