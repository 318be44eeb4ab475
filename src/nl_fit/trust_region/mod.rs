//! Trust-region nonlinear least squares.
//!
//! Each iteration minimizes the Gauss-Newton model $|r + J p|^2$ over the ball $|p| \le \Delta$,
//! projects the trial point onto the parameter bounds and compares the actual objective
//! decrease with the predicted one. Their ratio $\rho$ decides whether the step is accepted
//! and how the radius $\Delta$ changes. Every sub-problem solve is one iteration, accepted or
//! not.

mod config;
pub use config::{SubproblemMethod, TrustRegionConfig};

mod solver;
pub use solver::{
    CancellationToken, ConvergenceCriterion, FitStatus, IterationRecord, LeastSquaresProblem,
    Linearization, SolverOutcome, SolverState, TrustRegionRun, TrustRegionSolver,
    TrustRegionState,
};

pub mod subproblem;
