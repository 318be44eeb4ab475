use crate::basis::N_NONLINEAR;
use crate::error::FitError;

use enum_dispatch::enum_dispatch;
use nalgebra::{DMatrix, DVector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod mixture;
pub use mixture::{MixtureComponent, MixturePrior, RESPONSIBILITY_FLOOR};

/// Penalty added to `chi^2 / 2` and its derivatives with respect to the nonlinear parameters
#[derive(Clone, Debug)]
pub struct PriorEvaluation {
    /// `-ln p(x) + const`, never negative
    pub penalty: f64,
    /// Gradient of `penalty`, length [N_NONLINEAR]
    pub gradient: DVector<f64>,
    /// Positive semi-definite approximation of the Hessian of `penalty`
    pub curvature: DMatrix<f64>,
}

impl PriorEvaluation {
    pub fn zeros() -> Self {
        Self {
            penalty: 0.0,
            gradient: DVector::zeros(N_NONLINEAR),
            curvature: DMatrix::zeros(N_NONLINEAR, N_NONLINEAR),
        }
    }
}

#[enum_dispatch]
pub trait PriorTrait {
    /// Number of nonlinear parameters the prior constrains
    fn dimension(&self) -> usize;

    /// Evaluate at the nonlinear parameters `[x, y, eta1, eta2, radius]`
    fn evaluate(&self, nonlinear: &[f64]) -> Result<PriorEvaluation, FitError>;
}

/// Bayesian prior on the nonlinear parameters
#[enum_dispatch(PriorTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum Prior {
    None(NonePrior),
    Mixture(MixturePrior),
}

impl Prior {
    pub fn none() -> Self {
        NonePrior {}.into()
    }

    pub fn mixture(prior: MixturePrior) -> Self {
        prior.into()
    }
}

impl Default for Prior {
    fn default() -> Self {
        Self::none()
    }
}

/// Flat prior, maximum likelihood fit
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct NonePrior {}

impl PriorTrait for NonePrior {
    fn dimension(&self) -> usize {
        0
    }

    fn evaluate(&self, nonlinear: &[f64]) -> Result<PriorEvaluation, FitError> {
        FitError::check_len("nonlinear parameters", N_NONLINEAR, nonlinear.len())?;
        Ok(PriorEvaluation::zeros())
    }
}
