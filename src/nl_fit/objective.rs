use crate::basis::{BasisTrait, N_NONLINEAR};
use crate::error::FitError;
use crate::nl_fit::bounds::ParameterBounds;
use crate::nl_fit::likelihood::Likelihood;
use crate::nl_fit::prior::{Prior, PriorEvaluation, PriorTrait};
use crate::nl_fit::trust_region::{LeastSquaresProblem, Linearization};

use nalgebra::{DMatrix, DVector};

/// Prior rows with smaller residual get a zero Jacobian row
const MIN_PRIOR_RESIDUAL: f64 = 1e-150;

/// Penalized sum of squares $\chi^2 + 2 \cdot \mathrm{penalty}$, i.e. $-2 \ln$ posterior up to
/// a constant
///
/// The prior enters as one extra residual $e = \sqrt{2 \cdot \mathrm{penalty}}$ appended to the
/// pixel residuals, with Jacobian row $\nabla \mathrm{penalty} / e$.
#[derive(Clone, Debug)]
pub struct Objective<'a> {
    likelihood: Likelihood<'a>,
    prior: &'a Prior,
    bounds: &'a ParameterBounds,
}

impl<'a> Objective<'a> {
    pub fn new(likelihood: Likelihood<'a>, prior: &'a Prior, bounds: &'a ParameterBounds) -> Self {
        Self {
            likelihood,
            prior,
            bounds,
        }
    }

    pub fn likelihood(&self) -> &Likelihood<'a> {
        &self.likelihood
    }

    pub fn prior(&self) -> &Prior {
        self.prior
    }

    pub fn prior_evaluation(&self, params: &[f64]) -> Result<PriorEvaluation, FitError> {
        FitError::check_len("parameters", self.n_params(), params.len())?;
        self.prior.evaluate(&params[..N_NONLINEAR])
    }

    /// `chi^2 + 2 penalty`
    pub fn value(&self, params: &[f64]) -> Result<f64, FitError> {
        Ok(self.residuals(params)?.norm_squared())
    }
}

impl LeastSquaresProblem for Objective<'_> {
    fn n_params(&self) -> usize {
        self.likelihood.n_params()
    }

    fn residuals(&self, x: &[f64]) -> Result<DVector<f64>, FitError> {
        let pixel_residuals = self.likelihood.residuals(x)?;
        let prior = self.prior_evaluation(x)?;
        let n = pixel_residuals.len();
        let mut residuals = pixel_residuals.resize_vertically(n + 1, 0.0);
        residuals[n] = (2.0 * prior.penalty).sqrt();
        Ok(residuals)
    }

    fn linearize(&self, x: &[f64]) -> Result<Linearization, FitError> {
        let likelihood = self.likelihood.evaluate(x)?;
        let prior = self.prior_evaluation(x)?;
        let n = likelihood.residuals.len();
        let mut residuals = likelihood.residuals.resize_vertically(n + 1, 0.0);
        let mut jacobian: DMatrix<f64> = likelihood.jacobian.resize_vertically(n + 1, 0.0);
        let e = (2.0 * prior.penalty).sqrt();
        residuals[n] = e;
        if e >= MIN_PRIOR_RESIDUAL {
            for (j, g) in prior.gradient.iter().enumerate() {
                jacobian[(n, j)] = g / e;
            }
        }
        Ok(Linearization {
            residuals,
            jacobian,
        })
    }

    fn project(&self, x: &mut [f64]) {
        self.bounds.project(x);
    }

    fn check_domain(&self, x: &[f64]) -> Result<(), FitError> {
        self.bounds.check(x)
    }

    fn bounds(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        Some(self.bounds.expand(self.likelihood.basis().size()))
    }
}
