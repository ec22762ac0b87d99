//! Weighted quasi-binomial regression with a logit link, fitted by IRLS.
//!
//! The response is a proportion in (0, 1). Prior weights are the reliability
//! weights; rows with zero weight contribute nothing to the fit or to the
//! residual degrees of freedom. The dispersion is the Pearson estimate, so it
//! may exceed 1.

use crate::config::GlmControl;
use crate::types::Coefficients;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{Inverse, Solve};
use thiserror::Error;

const PROB_EPS: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "Only {observations} weighted observations for {parameters} parameters; the dispersion is not estimable."
    )]
    TooFewObservations {
        observations: usize,
        parameters: usize,
    },
    #[error("A linear system solve failed. The weighted normal equations may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
    #[error("IRLS produced non-finite values at iteration {iteration}.")]
    NonFinite { iteration: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrlsStatus {
    Converged,
    MaxIterationsReached,
}

/// A fitted model: coefficients plus what is needed for standard errors of
/// fitted values.
#[derive(Clone, Debug)]
pub struct GlmFit {
    pub coefficients: Coefficients,
    /// `(X'WX)^-1` at convergence, before scaling by the dispersion.
    pub unscaled_covariance: Array2<f64>,
    pub dispersion: f64,
    pub deviance: f64,
    pub df_residual: usize,
    pub iterations: usize,
    pub status: IrlsStatus,
}

/// Fitted mean on the response scale and the squared standard error of that
/// fitted value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prediction {
    pub mean: f64,
    pub variance: f64,
}

fn logistic(eta: f64) -> f64 {
    let mu = 1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp());
    mu.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

impl GlmFit {
    /// Prediction for one design row (intercept column included).
    pub fn predict(&self, row: ArrayView1<f64>) -> Prediction {
        let eta = row.dot(&self.coefficients.as_view());
        let mean = logistic(eta);
        let link_variance = self.dispersion * row.dot(&self.unscaled_covariance.dot(&row));
        let d_mu = mean * (1.0 - mean);
        Prediction {
            mean,
            variance: link_variance * d_mu * d_mu,
        }
    }
}

/// Recomputes mean, IRLS weights and working response for the logit link.
/// The IRLS weights already include the prior weights.
pub fn update_logit_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    prior_weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let mu = eta.mapv(logistic);
    let variance = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
    let weights = &prior_weights * &variance;
    let z = eta + &((&y - &mu) / &variance);
    (mu, weights, z)
}

/// Binomial deviance of a proportion response.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, prior_weights: ArrayView1<f64>) -> f64 {
    let total_residual = Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui_c = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let term1 = if yi > PROB_EPS {
                yi * (yi.ln() - mui_c.ln())
            } else {
                0.0
            };
            let term2 = if yi < 1.0 - PROB_EPS {
                (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui_c).ln())
            } else {
                0.0
            };
            acc + wi * (term1 + term2)
        });
    2.0 * total_residual
}

fn weighted_cross_products(
    x: ArrayView2<f64>,
    weights: &Array1<f64>,
    z: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let wx = &x * &weights.view().insert_axis(Axis(1));
    (x.t().dot(&wx), wx.t().dot(z))
}

/// Fits `logit(E[y]) = X beta` with quasi-binomial variance.
///
/// `x` must already contain the intercept column.
pub fn fit_quasi_binomial(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_weights: ArrayView1<f64>,
    control: &GlmControl,
) -> Result<GlmFit, FitError> {
    let parameters = x.ncols();
    let observations = prior_weights.iter().filter(|&&w| w > 0.0).count();
    if observations <= parameters {
        return Err(FitError::TooFewObservations {
            observations,
            parameters,
        });
    }

    // Start from the binomial family's customary mustart.
    let eta = Zip::from(y).and(prior_weights).map_collect(|&yi, &wi| {
        let m = (wi * yi + 0.5) / (wi + 1.0);
        (m / (1.0 - m)).ln()
    });
    let mut coefficients = Coefficients::zeros(parameters);
    let (mut mu, mut weights, mut z) = update_logit_vectors(y, &eta, prior_weights);
    let mut deviance = calculate_deviance(y, &mu, prior_weights);
    let mut status = IrlsStatus::MaxIterationsReached;
    let mut iterations = 0;

    for iter in 1..=control.max_iterations {
        iterations = iter;
        let (xtwx, xtwz) = weighted_cross_products(x, &weights, &z);
        let beta = xtwx
            .solve(&xtwz)
            .map_err(FitError::LinearSystemSolveFailed)?;
        if !beta.iter().all(|b| b.is_finite()) {
            return Err(FitError::NonFinite { iteration: iter });
        }

        let mut candidate_eta = x.dot(&beta);
        let mut candidate = update_logit_vectors(y, &candidate_eta, prior_weights);
        let mut candidate_deviance = calculate_deviance(y, &candidate.0, prior_weights);

        // Step halving towards the previous coefficients on a bad step.
        let mut beta = beta;
        let mut halvings = 0;
        while !candidate_deviance.is_finite() && halvings < 20 {
            beta = (&beta + &coefficients.0) / 2.0;
            candidate_eta = x.dot(&beta);
            candidate = update_logit_vectors(y, &candidate_eta, prior_weights);
            candidate_deviance = calculate_deviance(y, &candidate.0, prior_weights);
            halvings += 1;
        }
        if !candidate_deviance.is_finite() {
            return Err(FitError::NonFinite { iteration: iter });
        }

        let change = (candidate_deviance - deviance).abs() / (candidate_deviance.abs() + 0.1);
        coefficients = Coefficients::from(beta);
        (mu, weights, z) = candidate;
        deviance = candidate_deviance;

        if change < control.tolerance {
            status = IrlsStatus::Converged;
            break;
        }
    }

    if status == IrlsStatus::MaxIterationsReached {
        log::debug!(
            "IRLS stopped after {} iterations without meeting tolerance {:.1e}",
            iterations,
            control.tolerance
        );
    }

    let (xtwx, _) = weighted_cross_products(x, &weights, &z);
    let unscaled_covariance = xtwx.inv().map_err(FitError::LinearSystemSolveFailed)?;
    if !unscaled_covariance.iter().all(|v| v.is_finite()) {
        return Err(FitError::NonFinite {
            iteration: iterations,
        });
    }

    let df_residual = observations - parameters;
    let pearson: f64 = Zip::from(y)
        .and(&mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mi, &wi| {
            acc + wi * (yi - mi) * (yi - mi) / (mi * (1.0 - mi)).max(MIN_WEIGHT)
        });
    let dispersion = pearson / df_residual as f64;

    Ok(GlmFit {
        coefficients,
        unscaled_covariance,
        dispersion,
        deviance,
        df_residual,
        iterations,
        status,
    })
}
