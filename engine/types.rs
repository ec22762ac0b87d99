use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

/// Functional class of a single-nucleotide variant. Only missense variants
/// take part in the covariate regression and in the empirical prior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationCategory {
    Missense,
    Nonsense,
    Synonymous,
}

impl FromStr for MutationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "missense" | "missense_variant" => Ok(Self::Missense),
            "nonsense" | "stop_gained" | "stop-gain" => Ok(Self::Nonsense),
            "synonymous" | "synonymous_variant" | "silent" => Ok(Self::Synonymous),
            other => Err(format!("unknown mutation category '{other}'")),
        }
    }
}

impl fmt::Display for MutationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Missense => "missense",
            Self::Nonsense => "nonsense",
            Self::Synonymous => "synonymous",
        };
        f.write_str(label)
    }
}

/// Reliability weight `1 - 1/(eps + total)`, floored at zero so that variants
/// with no carriers carry no influence in weighted fits.
pub fn reliability_weight(total: u32, epsilon: f64) -> f64 {
    (1.0 - 1.0 / (epsilon + total as f64)).max(0.0)
}

/// One distinct variant of the gene: identity, fixed carrier counts and
/// covariates. Model state lives in the EM snapshot, never here.
#[derive(Clone, Debug, PartialEq)]
pub struct VariantRecord {
    pub key: String,
    pub position: u32,
    pub category: MutationCategory,
    pub affected: u32,
    pub unaffected: u32,
    /// Reliability weight. Cross-validation zeroes it for held-out folds.
    pub weight: f64,
    /// Covariate values aligned with `VariantDataset::covariate_names`.
    pub covariates: Vec<Option<f64>>,
}

impl VariantRecord {
    pub fn total(&self) -> u32 {
        self.affected + self.unaffected
    }

    /// Raw empirical penetrance; undefined without carriers.
    pub fn empirical_penetrance(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            n => Some(self.affected as f64 / n as f64),
        }
    }

    pub fn is_missense(&self) -> bool {
        self.category == MutationCategory::Missense
    }

    /// Presence mask over the covariate columns.
    pub fn covariate_mask(&self) -> Vec<bool> {
        self.covariates.iter().map(Option::is_some).collect()
    }
}

/// Shape parameters of a Beta distribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BetaShape {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaShape {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        self.alpha * self.beta / (s * s * (s + 1.0))
    }

    pub fn is_proper(&self) -> bool {
        self.alpha.is_finite() && self.beta.is_finite() && self.alpha > 0.0 && self.beta > 0.0
    }
}

impl fmt::Display for BetaShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Beta({:.4}, {:.4})", self.alpha, self.beta)
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Coefficients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for Coefficients {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}
