//! Mixture of multivariate Gaussian or Student's T distributions.

use crate::basis::N_NONLINEAR;
use crate::error::FitError;
use crate::nl_fit::prior::{PriorEvaluation, PriorTrait};

use itertools::Itertools;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Components with smaller responsibility are skipped in gradient and curvature
pub const RESPONSIBILITY_FLOOR: f64 = 1e-12;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// One weighted component of a [MixturePrior]
#[derive(Clone, Debug)]
pub struct MixtureComponent {
    weight: f64,
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    cholesky: Cholesky<f64, Dyn>,
    /// `ln det(covariance)`
    ln_det: f64,
}

impl MixtureComponent {
    pub fn new(weight: f64, mean: Vec<f64>, covariance: DMatrix<f64>) -> Result<Self, FitError> {
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(FitError::invalid_domain(
                "mixture component weight must be positive and finite",
            ));
        }
        if !covariance.is_square() {
            return Err(FitError::invalid_domain(
                "mixture component covariance must be square",
            ));
        }
        FitError::check_len("mixture component mean", covariance.nrows(), mean.len())?;
        if mean.iter().chain(covariance.iter()).any(|x| !x.is_finite()) {
            return Err(FitError::invalid_domain(
                "mixture component parameters must be finite",
            ));
        }
        let cholesky = covariance.clone().cholesky().ok_or_else(|| {
            FitError::invalid_domain("mixture component covariance must be positive definite")
        })?;
        let ln_det = 2.0 * cholesky.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Ok(Self {
            weight,
            mean: DVector::from_vec(mean),
            covariance,
            cholesky,
            ln_det,
        })
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Mahalanobis distance squared and `covariance^-1 (x - mean)`
    fn mahalanobis(&self, x: &DVector<f64>) -> (f64, DVector<f64>) {
        let dx = x - &self.mean;
        let lambda_dx = self.cholesky.solve(&dx);
        (dx.dot(&lambda_dx), lambda_dx)
    }

    fn marginal(&self, dims: &[usize]) -> Result<Self, FitError> {
        let mean = dims.iter().map(|&i| self.mean[i]).collect();
        let covariance =
            DMatrix::from_fn(dims.len(), dims.len(), |i, j| self.covariance[(dims[i], dims[j])]);
        Self::new(self.weight, mean, covariance)
    }
}

impl PartialEq for MixtureComponent {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
            && self.mean == other.mean
            && self.covariance == other.covariance
    }
}

/// Mixture prior over a subset of the nonlinear parameters
///
/// The density is $p(x) = \sum_k w_k p_k(x)$ with Gaussian components, or Student's T
/// components sharing `degrees_of_freedom` $\nu$. The penalty is
/// $-\ln p(x) + \ln p_\mathrm{max}$ with $p_\mathrm{max} = \sum_k w_k p_k(\mu_k)$, which bounds
/// the density from above, so the penalty is never negative.
///
/// The curvature is $\sum_k \rho_k \gamma_k \Sigma_k^{-1}$ with responsibilities $\rho_k$ and
/// $\gamma_k = (\nu + d) / (\nu + z_k)$ ($\gamma_k = 1$ for Gaussians), i.e. the Hessian without
/// the negative between-component term.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(into = "MixturePriorParameters", try_from = "MixturePriorParameters")]
pub struct MixturePrior {
    components: Vec<MixtureComponent>,
    indices: Vec<usize>,
    degrees_of_freedom: Option<f64>,
}

impl MixturePrior {
    /// Create a mixture over the nonlinear parameters listed in `indices`
    ///
    /// Weights are normalized to sum to one. `degrees_of_freedom` of `None` or infinity means
    /// Gaussian components.
    pub fn new(
        components: Vec<MixtureComponent>,
        indices: Vec<usize>,
        degrees_of_freedom: Option<f64>,
    ) -> Result<Self, FitError> {
        if components.is_empty() {
            return Err(FitError::invalid_domain(
                "mixture must have at least one component",
            ));
        }
        if indices.is_empty() || !indices.iter().all_unique() {
            return Err(FitError::invalid_domain(
                "mixture indices must be non-empty and unique",
            ));
        }
        if indices.iter().any(|&i| i >= N_NONLINEAR) {
            return Err(FitError::invalid_domain(
                "mixture index is beyond the nonlinear parameters",
            ));
        }
        for c in &components {
            FitError::check_len("mixture component dimension", indices.len(), c.dimension())?;
        }
        let degrees_of_freedom = match degrees_of_freedom {
            Some(nu) if nu.is_infinite() && nu > 0.0 => None,
            Some(nu) if !(nu > 0.0) => {
                return Err(FitError::invalid_domain(
                    "degrees of freedom must be positive",
                ));
            }
            nu => nu,
        };
        let mut prior = Self {
            components,
            indices,
            degrees_of_freedom,
        };
        prior.normalize();
        Ok(prior)
    }

    /// Single Gaussian over `indices`
    pub fn gaussian(
        mean: Vec<f64>,
        covariance: DMatrix<f64>,
        indices: Vec<usize>,
    ) -> Result<Self, FitError> {
        Self::new(
            vec![MixtureComponent::new(1.0, mean, covariance)?],
            indices,
            None,
        )
    }

    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn degrees_of_freedom(&self) -> Option<f64> {
        self.degrees_of_freedom
    }

    /// Rescale weights to sum to one
    pub fn normalize(&mut self) {
        let total: f64 = self.components.iter().map(|c| c.weight).sum();
        for c in self.components.iter_mut() {
            c.weight /= total;
        }
        debug_assert!(
            (self.components.iter().map(|c| c.weight).sum::<f64>() - 1.0).abs()
                <= WEIGHT_SUM_TOLERANCE
        );
    }

    /// Drop components with weight below `threshold` and renormalize
    pub fn clip(&self, threshold: f64) -> Result<Self, FitError> {
        let components = self
            .components
            .iter()
            .filter(|c| c.weight >= threshold)
            .cloned()
            .collect_vec();
        if components.is_empty() {
            return Err(FitError::invalid_domain(
                "clipping threshold removes every mixture component",
            ));
        }
        Self::new(components, self.indices.clone(), self.degrees_of_freedom)
    }

    /// Marginalize onto a subset of the prior's own dimensions
    ///
    /// `dims` are positions in [MixturePrior::indices], not nonlinear parameter indices.
    pub fn project(&self, dims: &[usize]) -> Result<Self, FitError> {
        if let Some(&d) = dims.iter().find(|&&d| d >= self.indices.len()) {
            return Err(FitError::invalid_domain(format!(
                "projection dimension {d} is out of range"
            )));
        }
        let components = self
            .components
            .iter()
            .map(|c| c.marginal(dims))
            .collect::<Result<Vec<_>, _>>()?;
        let indices = dims.iter().map(|&d| self.indices[d]).collect();
        Self::new(components, indices, self.degrees_of_freedom)
    }

    fn select(&self, nonlinear: &[f64]) -> Result<DVector<f64>, FitError> {
        FitError::check_len("nonlinear parameters", N_NONLINEAR, nonlinear.len())?;
        Ok(DVector::from_iterator(
            self.indices.len(),
            self.indices.iter().map(|&i| nonlinear[i]),
        ))
    }

    /// Log density of each component without its weight, given the Mahalanobis distance
    fn ln_component_density(&self, component: &MixtureComponent, z: f64) -> f64 {
        let d = component.dimension() as f64;
        match self.degrees_of_freedom {
            None => -0.5 * (d * (2.0 * PI).ln() + component.ln_det + z),
            Some(nu) => {
                libm::lgamma(0.5 * (nu + d))
                    - libm::lgamma(0.5 * nu)
                    - 0.5 * d * (nu * PI).ln()
                    - 0.5 * component.ln_det
                    - 0.5 * (nu + d) * (z / nu).ln_1p()
            }
        }
    }

    /// Unweighted density of every component at the nonlinear parameters
    pub fn component_densities(&self, nonlinear: &[f64]) -> Result<Vec<f64>, FitError> {
        let x = self.select(nonlinear)?;
        Ok(self
            .components
            .iter()
            .map(|c| self.ln_component_density(c, c.mahalanobis(&x).0).exp())
            .collect())
    }

    /// Mixture density at the nonlinear parameters
    pub fn density(&self, nonlinear: &[f64]) -> Result<f64, FitError> {
        let x = self.select(nonlinear)?;
        let ln_terms = self
            .components
            .iter()
            .map(|c| c.weight.ln() + self.ln_component_density(c, c.mahalanobis(&x).0))
            .collect_vec();
        Ok(log_sum_exp(&ln_terms).exp())
    }

    /// Logarithm of the density upper bound used as the penalty offset
    fn ln_peak(&self) -> f64 {
        let ln_terms = self
            .components
            .iter()
            .map(|c| c.weight.ln() + self.ln_component_density(c, 0.0))
            .collect_vec();
        log_sum_exp(&ln_terms)
    }

    fn gamma(&self, dimension: usize, z: f64) -> f64 {
        match self.degrees_of_freedom {
            None => 1.0,
            Some(nu) => (nu + dimension as f64) / (nu + z),
        }
    }
}

impl PriorTrait for MixturePrior {
    fn dimension(&self) -> usize {
        self.indices.len()
    }

    fn evaluate(&self, nonlinear: &[f64]) -> Result<PriorEvaluation, FitError> {
        let x = self.select(nonlinear)?;
        let terms = self
            .components
            .iter()
            .map(|c| {
                let (z, lambda_dx) = c.mahalanobis(&x);
                (c.weight.ln() + self.ln_component_density(c, z), z, lambda_dx)
            })
            .collect_vec();
        let ln_p = log_sum_exp(&terms.iter().map(|t| t.0).collect_vec());
        // Round-off may push a point at the peak slightly below zero
        let penalty = (self.ln_peak() - ln_p).max(0.0);

        let mut evaluation = PriorEvaluation::zeros();
        evaluation.penalty = penalty;
        for (c, (ln_term, z, lambda_dx)) in self.components.iter().zip(terms) {
            let rho = (ln_term - ln_p).exp();
            if !(rho >= RESPONSIBILITY_FLOOR) {
                continue;
            }
            let factor = rho * self.gamma(c.dimension(), z);
            let precision = c.cholesky.inverse();
            for (a, &i) in self.indices.iter().enumerate() {
                evaluation.gradient[i] += factor * lambda_dx[a];
                for (b, &j) in self.indices.iter().enumerate() {
                    evaluation.curvature[(i, j)] += factor * precision[(a, b)];
                }
            }
        }
        Ok(evaluation)
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl JsonSchema for MixturePrior {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        MixturePriorParameters::schema_name()
    }

    fn json_schema(r#gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        MixturePriorParameters::json_schema(r#gen)
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "MixturePrior")]
struct MixturePriorParameters {
    /// Nonlinear parameter indices: 0 x, 1 y, 2 eta1, 3 eta2, 4 radius
    indices: Vec<usize>,
    /// Student's T degrees of freedom, Gaussian if absent
    degrees_of_freedom: Option<f64>,
    components: Vec<MixtureComponentParameters>,
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "MixtureComponent")]
struct MixtureComponentParameters {
    weight: f64,
    mean: Vec<f64>,
    /// Row-major covariance matrix
    covariance: Vec<Vec<f64>>,
}

impl From<MixturePrior> for MixturePriorParameters {
    fn from(value: MixturePrior) -> Self {
        Self {
            indices: value.indices,
            degrees_of_freedom: value.degrees_of_freedom,
            components: value
                .components
                .into_iter()
                .map(|c| MixtureComponentParameters {
                    weight: c.weight,
                    mean: c.mean.iter().copied().collect(),
                    covariance: c
                        .covariance
                        .row_iter()
                        .map(|row| row.iter().copied().collect())
                        .collect(),
                })
                .collect(),
        }
    }
}

impl TryFrom<MixturePriorParameters> for MixturePrior {
    type Error = FitError;

    fn try_from(value: MixturePriorParameters) -> Result<Self, Self::Error> {
        let components = value
            .components
            .into_iter()
            .map(|c| {
                let n = c.mean.len();
                if c.covariance.len() != n || c.covariance.iter().any(|row| row.len() != n) {
                    return Err(FitError::invalid_domain(
                        "mixture component covariance must be a square matrix matching the mean",
                    ));
                }
                let covariance = DMatrix::from_row_iterator(n, n, c.covariance.into_iter().flatten());
                MixtureComponent::new(c.weight, c.mean, covariance)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(components, value.indices, value.degrees_of_freedom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nl_fit::prior::Prior;

    use approx::assert_relative_eq;
    use rand::prelude::*;
    use rand_distr::StandardNormal;

    fn ellipse_prior(degrees_of_freedom: Option<f64>) -> MixturePrior {
        MixturePrior::new(
            vec![
                MixtureComponent::new(
                    2.0,
                    vec![0.0, 0.0, 1.0],
                    DMatrix::from_row_slice(3, 3, &[0.3, 0.05, 0.0, 0.05, 0.3, 0.0, 0.0, 0.0, 0.5]),
                )
                .unwrap(),
                MixtureComponent::new(
                    1.0,
                    vec![0.5, -0.2, 3.0],
                    DMatrix::from_row_slice(3, 3, &[0.1, 0.0, 0.02, 0.0, 0.2, 0.0, 0.02, 0.0, 2.0]),
                )
                .unwrap(),
            ],
            vec![2, 3, 4],
            degrees_of_freedom,
        )
        .unwrap()
    }

    #[test]
    fn weights_sum_to_one() {
        let prior = ellipse_prior(None);
        let total: f64 = prior.components().iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() <= 1e-9);
        assert_relative_eq!(prior.components()[0].weight(), 2.0 / 3.0);
    }

    #[test]
    fn penalty_is_nonnegative() {
        let mut rng = StdRng::seed_from_u64(0);
        for prior in [ellipse_prior(None), ellipse_prior(Some(3.0))] {
            for _ in 0..200 {
                let x: Vec<f64> = (0..N_NONLINEAR)
                    .map(|_| 3.0 * rng.sample::<f64, _>(StandardNormal))
                    .collect();
                let evaluation = prior.evaluate(&x).unwrap();
                assert!(evaluation.penalty >= 0.0);
                assert!(evaluation.penalty.is_finite());
            }
        }
    }

    #[test]
    fn single_gaussian_penalty() {
        let prior =
            MixturePrior::gaussian(vec![1.0, 2.0], DMatrix::from_diagonal_element(2, 2, 4.0), vec![0, 4])
                .unwrap();
        let evaluation = prior.evaluate(&[3.0, 9.0, 9.0, 9.0, 2.0]).unwrap();
        // z = (2^2 + 0^2) / 4
        assert_relative_eq!(evaluation.penalty, 0.5, epsilon = 1e-12);
        assert_relative_eq!(evaluation.gradient[0], 0.5, epsilon = 1e-12);
        assert_eq!(evaluation.gradient[1], 0.0);
        assert_relative_eq!(evaluation.curvature[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(evaluation.curvature[(4, 4)], 0.25, epsilon = 1e-12);
        assert_eq!(evaluation.curvature[(2, 2)], 0.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        for prior in [ellipse_prior(None), ellipse_prior(Some(4.0))] {
            let x = [0.7, -0.3, 0.2, 0.1, 2.0];
            let evaluation = prior.evaluate(&x).unwrap();
            let h = 1e-6;
            for i in 0..N_NONLINEAR {
                let mut plus = x;
                let mut minus = x;
                plus[i] += h;
                minus[i] -= h;
                let numeric = (prior.evaluate(&plus).unwrap().penalty
                    - prior.evaluate(&minus).unwrap().penalty)
                    / (2.0 * h);
                assert_relative_eq!(evaluation.gradient[i], numeric, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn curvature_is_positive_semidefinite() {
        let prior = ellipse_prior(Some(2.0));
        let evaluation = prior.evaluate(&[0.0, 0.0, 0.3, -0.1, 1.5]).unwrap();
        let eigenvalues = evaluation.curvature.symmetric_eigenvalues();
        assert!(eigenvalues.iter().all(|&e| e >= -1e-12));
    }

    #[test]
    fn far_away_point_does_not_underflow() {
        let prior = ellipse_prior(None);
        let evaluation = prior.evaluate(&[0.0, 0.0, 40.0, -40.0, 100.0]).unwrap();
        assert!(evaluation.penalty.is_finite());
        assert!(evaluation.penalty > 1e3);
        assert!(evaluation.gradient.iter().all(|g| g.is_finite()));
        assert!(evaluation.gradient.norm() > 0.0);
    }

    #[test]
    fn density_matches_penalty() {
        let prior = ellipse_prior(None);
        let x = [0.0, 0.0, 0.2, 0.1, 1.5];
        let density = prior.density(&x).unwrap();
        let weighted: f64 = prior
            .components()
            .iter()
            .zip(prior.component_densities(&x).unwrap())
            .map(|(c, p)| c.weight() * p)
            .sum();
        assert_relative_eq!(density, weighted, max_relative = 1e-12);
        let penalty = prior.evaluate(&x).unwrap().penalty;
        assert_relative_eq!(penalty, prior.ln_peak() - density.ln(), epsilon = 1e-12);
    }

    #[test]
    fn student_t_has_heavier_tails() {
        let gaussian = ellipse_prior(None);
        let student = ellipse_prior(Some(2.0));
        let x = [0.0, 0.0, 3.0, 3.0, 10.0];
        assert!(student.evaluate(&x).unwrap().penalty < gaussian.evaluate(&x).unwrap().penalty);
    }

    #[test]
    fn clip_and_project() {
        let prior = ellipse_prior(None);
        let clipped = prior.clip(0.5).unwrap();
        assert_eq!(clipped.components().len(), 1);
        assert_relative_eq!(clipped.components()[0].weight(), 1.0);
        assert!(prior.clip(0.9).is_err());

        let projected = prior.project(&[2]).unwrap();
        assert_eq!(projected.indices(), &[4]);
        assert_eq!(projected.components()[1].covariance()[(0, 0)], 2.0);
        assert_eq!(projected.components()[1].mean()[0], 3.0);
        assert!(prior.project(&[3]).is_err());
    }

    #[test]
    fn invalid_construction() {
        let covariance = DMatrix::identity(2, 2);
        let component = MixtureComponent::new(1.0, vec![0.0, 0.0], covariance.clone()).unwrap();
        assert!(MixtureComponent::new(0.0, vec![0.0, 0.0], covariance.clone()).is_err());
        assert!(MixtureComponent::new(1.0, vec![0.0, 0.0], -covariance.clone()).is_err());
        assert!(MixtureComponent::new(1.0, vec![0.0], covariance).is_err());
        assert!(MixturePrior::new(vec![component.clone()], vec![2, 2], None).is_err());
        assert!(MixturePrior::new(vec![component.clone()], vec![2, 5], None).is_err());
        assert!(MixturePrior::new(vec![component.clone()], vec![2], None).is_err());
        assert!(MixturePrior::new(vec![component], vec![2, 3], Some(-1.0)).is_err());
    }

    #[test]
    fn serialization() {
        let prior: Prior = ellipse_prior(Some(5.0)).into();
        let json = serde_json::to_string(&prior).unwrap();
        let restored: Prior = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, prior);

        let not_pd = r#"{"Mixture":{"indices":[4],"degrees_of_freedom":null,"components":[{"weight":1.0,"mean":[1.0],"covariance":[[-1.0]]}]}}"#;
        assert!(serde_json::from_str::<Prior>(not_pd).is_err());
    }
}
