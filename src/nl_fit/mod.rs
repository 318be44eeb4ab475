//! Nonlinear fitting of source models to pixel data.
//!
//! # Parameter vector
//!
//! A fit works on `[x, y, eta1, eta2, radius, a_0, ..., a_{m-1}]`: the first
//! [N_NONLINEAR](crate::basis::N_NONLINEAR) entries are the center and the
//! [EllipseCore](crate::EllipseCore), the remaining `m = basis.size()` entries are linear
//! amplitudes of the [Basis](crate::Basis) functions. Only the nonlinear part is bounded, see
//! [ParameterBounds].
//!
//! # Objective
//!
//! [Likelihood] produces noise-weighted residuals `(model - data) / sigma` and their Jacobian.
//! [Objective] appends a single residual carrying the prior penalty, so the solver minimizes
//!
//! ```text
//! |r|^2 = chi^2 + 2 penalty = -2 ln(posterior) + const
//! ```
//!
//! with one code path for priors and plain maximum likelihood.
//!
//! # Solver
//!
//! [TrustRegionSolver] runs on any [LeastSquaresProblem]. [SourceFitter] wires everything up for
//! an [ImagePatch](crate::ImagePatch) and reports a [FitResult] with the covariance
//! `(J^T J + prior curvature)^-1` at the best point.

mod bounds;
pub use bounds::ParameterBounds;

mod driver;
pub use driver::{FitResult, FitterConfig, InitialGuess, SourceFitter};

mod likelihood;
pub use likelihood::{Likelihood, LikelihoodEvaluation};

mod objective;
pub use objective::Objective;

pub mod prior;
pub use prior::{MixtureComponent, MixturePrior, Prior, PriorEvaluation, PriorTrait};

pub mod trust_region;
pub use trust_region::{
    CancellationToken, ConvergenceCriterion, FitStatus, IterationRecord, LeastSquaresProblem,
    SubproblemMethod, TrustRegionConfig, TrustRegionSolver,
};
