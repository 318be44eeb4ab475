use crate::basis::{Basis, BasisTrait, N_NONLINEAR};
use crate::data::{ImagePatch, PixelData};
use crate::ellipse::EllipseCore;
use crate::error::FitError;
use crate::nl_fit::bounds::ParameterBounds;
use crate::nl_fit::likelihood::Likelihood;
use crate::nl_fit::objective::Objective;
use crate::nl_fit::prior::Prior;
use crate::nl_fit::trust_region::{
    CancellationToken, FitStatus, IterationRecord, TrustRegionConfig, TrustRegionSolver,
};
use crate::psf::PsfModel;

use nalgebra::DMatrix;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Singular values below this fraction of the largest one are dropped by the covariance
/// pseudo-inverse
const COVARIANCE_RCOND: f64 = 1e-14;

/// Everything that defines a fit except the data
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct FitterConfig {
    pub basis: Basis,
    pub prior: Prior,
    pub solver: TrustRegionConfig,
    pub bounds: ParameterBounds,
    /// Replace the initial amplitudes by the linear least-squares solution at the initial
    /// nonlinear parameters
    pub refine_linear_init: bool,
}

impl FitterConfig {
    #[inline]
    pub fn default_basis() -> Basis {
        Basis::gaussian()
    }

    #[inline]
    pub fn default_prior() -> Prior {
        Prior::none()
    }

    #[inline]
    pub fn default_solver() -> TrustRegionConfig {
        TrustRegionConfig::default()
    }

    #[inline]
    pub fn default_bounds() -> ParameterBounds {
        ParameterBounds::default()
    }

    #[inline]
    pub fn default_refine_linear_init() -> bool {
        true
    }

    pub fn with_basis(mut self, basis: Basis) -> Self {
        self.basis = basis;
        self
    }

    pub fn with_prior(mut self, prior: Prior) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_solver(mut self, solver: TrustRegionConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_bounds(mut self, bounds: ParameterBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_refine_linear_init(mut self, refine_linear_init: bool) -> Self {
        self.refine_linear_init = refine_linear_init;
        self
    }
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            basis: Self::default_basis(),
            prior: Self::default_prior(),
            solver: Self::default_solver(),
            bounds: Self::default_bounds(),
            refine_linear_init: Self::default_refine_linear_init(),
        }
    }
}

/// Starting point of a fit
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InitialGuess {
    pub center: [f64; 2],
    pub ellipse: EllipseCore,
    pub flux: f64,
}

impl InitialGuess {
    pub fn new(center: [f64; 2], ellipse: EllipseCore, flux: f64) -> Self {
        Self {
            center,
            ellipse,
            flux,
        }
    }

    /// Guess from the image centroid, second moments with the PSF moments subtracted and the
    /// image sum
    ///
    /// If the PSF is wider than the image moments suggest, a circle with the remaining trace
    /// is used, or a zero radius if nothing remains.
    pub fn from_moments(patch: &ImagePatch, psf: &PsfModel) -> Result<Self, FitError> {
        let (center, image_moments) = patch.moments()?;
        let psf_moments = psf.moments();
        let source_moments = [
            image_moments[0] - psf_moments[0],
            image_moments[1] - psf_moments[1],
            image_moments[2] - psf_moments[2],
        ];
        let ellipse = EllipseCore::from_quadrupole(source_moments).unwrap_or_else(|| {
            let half_trace = 0.5 * (source_moments[0] + source_moments[1]);
            EllipseCore::circle(half_trace.max(0.0).sqrt())
        });
        let flux = patch.image.iter().filter(|v| v.is_finite()).sum();
        Ok(Self::new(center, ellipse, flux))
    }

    pub fn nonlinear(&self) -> [f64; N_NONLINEAR] {
        [
            self.center[0],
            self.center[1],
            self.ellipse.eta1,
            self.ellipse.eta2,
            self.ellipse.radius,
        ]
    }
}

/// Result of [SourceFitter::fit]
#[derive(Clone, Debug)]
pub struct FitResult {
    /// `[x, y, eta1, eta2, radius, amplitudes...]` at the best point found
    pub parameters: Vec<f64>,
    /// Inverse of the Gauss-Newton curvature of `-ln posterior`, absent if the final point could
    /// not be evaluated
    pub covariance: Option<DMatrix<f64>>,
    pub status: FitStatus,
    pub iterations: usize,
    pub objective_evaluations: usize,
    pub jacobian_evaluations: usize,
    /// `chi^2 + 2 penalty`
    pub objective: f64,
    pub chi2: f64,
    pub history: Vec<IterationRecord>,
    /// Error that made the fit fail
    pub failure: Option<FitError>,
    /// Amplitude indices of the zeroth-order terms
    pub flux_indices: Vec<usize>,
    pub n_pixels: usize,
}

impl FitResult {
    pub fn center(&self) -> [f64; 2] {
        [self.parameters[0], self.parameters[1]]
    }

    pub fn ellipse(&self) -> EllipseCore {
        EllipseCore::new(self.parameters[2], self.parameters[3], self.parameters[4])
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.parameters[N_NONLINEAR..]
    }

    /// Sum of the zeroth-order amplitudes, all other terms have zero flux
    pub fn flux(&self) -> f64 {
        self.flux_indices
            .iter()
            .map(|&i| self.amplitudes()[i])
            .sum()
    }

    pub fn flux_err(&self) -> Option<f64> {
        let covariance = self.covariance.as_ref()?;
        let variance: f64 = self
            .flux_indices
            .iter()
            .flat_map(|&i| {
                self.flux_indices
                    .iter()
                    .map(move |&j| covariance[(N_NONLINEAR + i, N_NONLINEAR + j)])
            })
            .sum();
        Some(variance.max(0.0).sqrt())
    }

    pub fn determinant_radius(&self) -> f64 {
        self.ellipse().determinant_radius()
    }

    /// `chi^2` per degree of freedom, `None` without spare pixels
    pub fn reduced_chi2(&self) -> Option<f64> {
        let dof = self.n_pixels.checked_sub(self.parameters.len()).filter(|&dof| dof > 0)?;
        Some(self.chi2 / dof as f64)
    }
}

/// Fits one configured model to image patches
///
/// The fitter holds no per-fit state, one instance may run many fits concurrently.
#[derive(Clone, Debug)]
pub struct SourceFitter {
    config: FitterConfig,
    solver: TrustRegionSolver,
}

impl SourceFitter {
    pub fn new(config: FitterConfig) -> Self {
        let solver = TrustRegionSolver::new(config.solver.clone());
        Self { config, solver }
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    pub fn fit(
        &self,
        patch: &ImagePatch,
        psf: &PsfModel,
        guess: &InitialGuess,
    ) -> Result<FitResult, FitError> {
        self.fit_pixels(&PixelData::from_patch(patch)?, psf, guess, None)
    }

    pub fn fit_with_cancellation(
        &self,
        patch: &ImagePatch,
        psf: &PsfModel,
        guess: &InitialGuess,
        cancellation: &CancellationToken,
    ) -> Result<FitResult, FitError> {
        self.fit_pixels(
            &PixelData::from_patch(patch)?,
            psf,
            guess,
            Some(cancellation),
        )
    }

    /// Fit already flattened pixels
    pub fn fit_pixels(
        &self,
        pixels: &PixelData,
        psf: &PsfModel,
        guess: &InitialGuess,
        cancellation: Option<&CancellationToken>,
    ) -> Result<FitResult, FitError> {
        let basis = &self.config.basis;
        let likelihood = Likelihood::new(pixels, basis, psf);
        let x0 = self.initial_parameters(&likelihood, guess)?;
        let objective = Objective::new(likelihood, &self.config.prior, &self.config.bounds);
        let outcome = self.solver.solve(&objective, &x0, cancellation)?;

        let chi2 = objective.likelihood().chi2(&outcome.x).unwrap_or(f64::NAN);
        let covariance = match covariance(&objective, &outcome.x) {
            Ok(covariance) => Some(covariance),
            Err(err) => {
                log::debug!("covariance is not available: {err}");
                None
            }
        };
        Ok(FitResult {
            parameters: outcome.x,
            covariance,
            status: outcome.status,
            iterations: outcome.iterations,
            objective_evaluations: outcome.objective_evaluations,
            jacobian_evaluations: outcome.jacobian_evaluations,
            objective: outcome.objective,
            chi2,
            history: outcome.history,
            failure: outcome.failure,
            flux_indices: basis.flux_terms().into_iter().map(|(i, _)| i).collect(),
            n_pixels: pixels.len(),
        })
    }

    fn initial_parameters(
        &self,
        likelihood: &Likelihood,
        guess: &InitialGuess,
    ) -> Result<Vec<f64>, FitError> {
        if !guess.flux.is_finite() {
            return Err(FitError::invalid_domain("initial flux must be finite"));
        }
        let nonlinear = guess.nonlinear();
        let basis = likelihood.basis();
        let mut amplitudes = vec![0.0; basis.size()];
        for (i, fraction) in basis.flux_terms() {
            amplitudes[i] = guess.flux * fraction;
        }
        if self.config.refine_linear_init {
            match likelihood.solve_amplitudes(&nonlinear) {
                Ok(solution) => amplitudes = solution,
                Err(err) if err.is_hard_failure() => return Err(err),
                Err(err) => log::debug!("keeping flux-based initial amplitudes: {err}"),
            }
        }
        Ok(nonlinear.into_iter().chain(amplitudes).collect())
    }
}

/// `(J^T J + prior curvature)^-1` at `params`, pseudo-inverse if singular
fn covariance(objective: &Objective, params: &[f64]) -> Result<DMatrix<f64>, FitError> {
    let likelihood = objective.likelihood().evaluate(params)?;
    let prior = objective.prior_evaluation(params)?;
    let mut curvature = likelihood.jacobian.tr_mul(&likelihood.jacobian);
    let mut nonlinear_block = curvature.view_mut((0, 0), (N_NONLINEAR, N_NONLINEAR));
    nonlinear_block += &prior.curvature;
    if !curvature.iter().all(|x| x.is_finite()) {
        return Err(FitError::NumericalOverflow);
    }
    if let Some(cholesky) = curvature.clone().cholesky() {
        return Ok(cholesky.inverse());
    }
    let svd = curvature.svd(true, true);
    let eps = COVARIANCE_RCOND * svd.singular_values.max();
    svd.pseudo_inverse(eps)
        .map_err(|e| FitError::invalid_domain(e.to_string()))
}
