use crate::error::FitError;
use crate::nl_fit::trust_region::config::{SubproblemMethod, TrustRegionConfig};
use crate::nl_fit::trust_region::subproblem::{
    SubproblemStep, dogleg, predicted_decrease, steihaug_cg,
};

use itertools::izip;
use log::Level;
use nalgebra::{DMatrix, DVector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Residuals and Jacobian at one point
#[derive(Clone, Debug)]
pub struct Linearization {
    pub residuals: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

impl Linearization {
    fn is_finite(&self) -> bool {
        self.residuals.iter().chain(self.jacobian.iter()).all(|x| x.is_finite())
    }
}

/// Sum-of-squares problem: minimize $|r(x)|^2$
pub trait LeastSquaresProblem {
    fn n_params(&self) -> usize;

    fn residuals(&self, x: &[f64]) -> Result<DVector<f64>, FitError>;

    fn linearize(&self, x: &[f64]) -> Result<Linearization, FitError>;

    /// Move a trial point onto the feasible set
    fn project(&self, _x: &mut [f64]) {}

    /// Check that a starting point is feasible
    fn check_domain(&self, _x: &[f64]) -> Result<(), FitError> {
        Ok(())
    }

    /// Lower and upper limits of every parameter, `None` if unbounded
    ///
    /// Must agree with [LeastSquaresProblem::project]. Parameters sitting on a limit with the
    /// gradient pushing outwards are held fixed in the sub-problem.
    fn bounds(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        None
    }
}

/// Shared flag to abort fits between iterations
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConvergenceCriterion {
    GradientTolerance,
    StepTolerance,
    ObjectiveTolerance,
    /// A step was rejected while the radius was already at its minimum
    MinimumRadius,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum FitStatus {
    Converged(ConvergenceCriterion),
    /// Not an error: the best point found is reported
    MaxIterationsReached,
    Failed,
    Cancelled,
}

impl FitStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    Initializing,
    Iterating,
    Terminated(FitStatus),
}

/// Mutable state of one solve
#[derive(Clone, Debug)]
pub struct TrustRegionState {
    pub x: Vec<f64>,
    pub objective: f64,
    pub radius: f64,
    pub iteration: usize,
}

/// Diagnostics of one sub-problem solve
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Objective at the point the step was taken from
    pub objective: f64,
    pub gradient_norm: f64,
    pub step_norm: f64,
    /// Ratio of actual to predicted decrease, absent if the trial point was not evaluated
    pub rho: Option<f64>,
    /// Radius after the update
    pub radius: f64,
    pub accepted: bool,
}

#[derive(Clone, Debug)]
pub struct SolverOutcome {
    /// Last accepted point
    pub x: Vec<f64>,
    pub objective: f64,
    pub status: FitStatus,
    pub iterations: usize,
    pub objective_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub history: Vec<IterationRecord>,
    /// Error that made the fit fail
    pub failure: Option<FitError>,
}

/// Trust-region Gauss-Newton solver for [LeastSquaresProblem]s
#[derive(Clone, Debug, Default)]
pub struct TrustRegionSolver {
    config: TrustRegionConfig,
}

impl TrustRegionSolver {
    pub fn new(config: TrustRegionConfig) -> Self {
        config.validate();
        Self { config }
    }

    pub fn config(&self) -> &TrustRegionConfig {
        &self.config
    }

    /// Validate the starting point and evaluate the problem there
    ///
    /// Invalid starting points are errors, a non-finite objective gives an already terminated
    /// run with [FitStatus::Failed].
    pub fn start<'a, P>(
        &'a self,
        problem: &'a P,
        x0: &[f64],
    ) -> Result<TrustRegionRun<'a, P>, FitError>
    where
        P: LeastSquaresProblem,
    {
        FitError::check_len("initial parameters", problem.n_params(), x0.len())?;
        if x0.iter().any(|x| !x.is_finite()) {
            return Err(FitError::invalid_domain("initial parameters must be finite"));
        }
        problem.check_domain(x0)?;

        let radius = self.config.initial_radius.unwrap_or_else(|| {
            let x_norm = x0.iter().map(|x| x * x).sum::<f64>().sqrt();
            self.config.initial_radius_factor * x_norm.max(1.0)
        });
        let radius = radius.clamp(self.config.min_radius, self.config.max_radius);

        let mut run = TrustRegionRun {
            config: &self.config,
            problem,
            solver_state: SolverState::Initializing,
            state: TrustRegionState {
                x: x0.to_vec(),
                objective: f64::NAN,
                radius,
                iteration: 0,
            },
            bounds: problem.bounds(),
            linearization: None,
            objective_evaluations: 0,
            jacobian_evaluations: 0,
            history: vec![],
            failure: None,
        };
        run.objective_evaluations += 1;
        run.jacobian_evaluations += 1;
        match problem.linearize(x0) {
            Ok(linearization) if linearization.is_finite() => {
                run.state.objective = linearization.residuals.norm_squared();
                run.linearization = Some(linearization);
                run.solver_state = SolverState::Iterating;
            }
            Ok(_) => run.fail(FitError::NumericalOverflow),
            Err(err) if err.is_hard_failure() => return Err(err),
            Err(err) => run.fail(err),
        }
        Ok(run)
    }

    pub fn solve<P>(
        &self,
        problem: &P,
        x0: &[f64],
        cancellation: Option<&CancellationToken>,
    ) -> Result<SolverOutcome, FitError>
    where
        P: LeastSquaresProblem,
    {
        let mut run = self.start(problem, x0)?;
        while !matches!(run.solver_state(), SolverState::Terminated(_)) {
            if cancellation.is_some_and(|token| token.is_cancelled()) {
                run.terminate(FitStatus::Cancelled);
                break;
            }
            run.step();
        }
        Ok(run.finish())
    }
}

/// One solve in progress, advanced by [TrustRegionRun::step]
#[derive(Debug)]
pub struct TrustRegionRun<'a, P> {
    config: &'a TrustRegionConfig,
    problem: &'a P,
    solver_state: SolverState,
    state: TrustRegionState,
    bounds: Option<(Vec<f64>, Vec<f64>)>,
    /// Linearization at `state.x`
    linearization: Option<Linearization>,
    objective_evaluations: usize,
    jacobian_evaluations: usize,
    history: Vec<IterationRecord>,
    failure: Option<FitError>,
}

impl<P> TrustRegionRun<'_, P>
where
    P: LeastSquaresProblem,
{
    pub fn solver_state(&self) -> SolverState {
        self.solver_state
    }

    pub fn state(&self) -> &TrustRegionState {
        &self.state
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    fn iteration_log_level(&self) -> Level {
        if self.config.log_iterations {
            Level::Debug
        } else {
            Level::Trace
        }
    }

    fn terminate(&mut self, status: FitStatus) {
        self.solver_state = SolverState::Terminated(status);
    }

    fn fail(&mut self, err: FitError) {
        log::debug!("trust-region fit failed: {err}");
        self.failure = Some(err);
        self.terminate(FitStatus::Failed);
    }

    /// Parameters on a bound whose descent direction points out of the box
    fn active_bounds(&self, g: &DVector<f64>) -> Vec<bool> {
        match &self.bounds {
            Some((lower, upper)) => izip!(&self.state.x, lower, upper, g.iter())
                .map(|(x, lower, upper, &g)| (x <= lower && g > 0.0) || (x >= upper && g < 0.0))
                .collect(),
            None => vec![false; g.len()],
        }
    }

    /// Perform one iteration, returns the state after it
    pub fn step(&mut self) -> SolverState {
        if self.solver_state != SolverState::Iterating {
            return self.solver_state;
        }
        if self.state.iteration >= self.config.max_iterations {
            self.terminate(FitStatus::MaxIterationsReached);
            return self.solver_state;
        }
        let Some(linearization) = &self.linearization else {
            self.fail(FitError::NumericalOverflow);
            return self.solver_state;
        };
        let jt = linearization.jacobian.transpose();
        let mut g = &jt * &linearization.residuals;
        let mut h = &jt * &linearization.jacobian;
        // Active parameters are decoupled with a zero gradient, so every step leaves them in place
        for (i, _) in self.active_bounds(&g).into_iter().enumerate().filter(|&(_, a)| a) {
            g[i] = 0.0;
            h.row_mut(i).fill(0.0);
            h.column_mut(i).fill(0.0);
            h[(i, i)] = 1.0;
        }
        let gradient_norm = g.amax();
        if gradient_norm <= self.config.gradient_tolerance {
            self.terminate(FitStatus::Converged(ConvergenceCriterion::GradientTolerance));
            return self.solver_state;
        }

        let SubproblemStep { step, kind } = match self.config.subproblem {
            SubproblemMethod::Dogleg => match dogleg(&h, &g, self.state.radius) {
                Ok(step) => step,
                Err(err) => {
                    self.fail(err);
                    return self.solver_state;
                }
            },
            SubproblemMethod::SteihaugCg => steihaug_cg(&h, &g, self.state.radius),
        };
        self.state.iteration += 1;
        let subproblem_norm = step.norm();
        let x_norm = self.state.x.iter().map(|x| x * x).sum::<f64>().sqrt();
        let mut record = IterationRecord {
            iteration: self.state.iteration,
            objective: self.state.objective,
            gradient_norm,
            step_norm: subproblem_norm,
            rho: None,
            radius: self.state.radius,
            accepted: false,
        };

        let tolerance = self.config.step_tolerance;
        if subproblem_norm <= tolerance * (x_norm + tolerance) {
            self.history.push(record);
            self.terminate(FitStatus::Converged(ConvergenceCriterion::StepTolerance));
            return self.solver_state;
        }

        let mut trial: Vec<f64> = self.state.x.iter().zip(step.iter()).map(|(x, p)| x + p).collect();
        self.problem.project(&mut trial);
        let step = DVector::from_iterator(
            trial.len(),
            trial.iter().zip(self.state.x.iter()).map(|(t, x)| t - x),
        );
        record.step_norm = step.norm();
        let predicted = predicted_decrease(&h, &g, &step);
        if predicted > 0.0 && predicted <= self.config.objective_tolerance * self.state.objective {
            self.history.push(record);
            self.terminate(FitStatus::Converged(ConvergenceCriterion::ObjectiveTolerance));
            return self.solver_state;
        }

        // A projected step without predicted decrease is rejected without evaluation
        let trial_objective = if predicted > 0.0 {
            self.objective_evaluations += 1;
            let trial_objective = match self.problem.residuals(&trial) {
                Ok(residuals) => residuals.norm_squared(),
                Err(err) => {
                    self.history.push(record);
                    self.fail(err);
                    return self.solver_state;
                }
            };
            if !trial_objective.is_finite() {
                self.history.push(record);
                self.fail(FitError::NumericalOverflow);
                return self.solver_state;
            }
            Some(trial_objective)
        } else {
            None
        };

        let rho = trial_objective.map_or(0.0, |f| (self.state.objective - f) / predicted);
        let radius_before = self.state.radius;
        if rho < self.config.shrink_threshold {
            self.state.radius =
                (self.state.radius * self.config.shrink_factor).max(self.config.min_radius);
        } else if rho > self.config.grow_threshold && subproblem_norm >= 0.9 * self.state.radius {
            self.state.radius =
                (self.state.radius * self.config.grow_factor).min(self.config.max_radius);
        }
        let accepted = rho > self.config.acceptance_threshold;
        record.rho = Some(rho);
        record.radius = self.state.radius;
        record.accepted = accepted;
        log::log!(
            self.iteration_log_level(),
            "iteration {}: objective {:.6e} -> {:?}, |g| {:.3e}, |p| {:.3e} ({:?}), rho {:.3}, radius {:.3e}, {}",
            self.state.iteration,
            self.state.objective,
            trial_objective,
            gradient_norm,
            record.step_norm,
            kind,
            rho,
            self.state.radius,
            if accepted { "accepted" } else { "rejected" },
        );
        self.history.push(record);

        if accepted {
            self.jacobian_evaluations += 1;
            let linearization = match self.problem.linearize(&trial) {
                Ok(linearization) if linearization.is_finite() => linearization,
                Ok(_) => {
                    self.fail(FitError::NumericalOverflow);
                    return self.solver_state;
                }
                Err(err) => {
                    self.fail(err);
                    return self.solver_state;
                }
            };
            let previous = self.state.objective;
            self.state.x = trial;
            self.state.objective = linearization.residuals.norm_squared();
            self.linearization = Some(linearization);
            if previous - self.state.objective <= self.config.objective_tolerance * previous {
                self.terminate(FitStatus::Converged(ConvergenceCriterion::ObjectiveTolerance));
            }
        } else if radius_before <= self.config.min_radius {
            self.terminate(FitStatus::Converged(ConvergenceCriterion::MinimumRadius));
        }
        self.solver_state
    }

    pub fn finish(self) -> SolverOutcome {
        let status = match self.solver_state {
            SolverState::Terminated(status) => status,
            // Abandoned before termination
            SolverState::Initializing | SolverState::Iterating => FitStatus::Cancelled,
        };
        log::debug!(
            "trust-region fit finished with {:?} after {} iterations, objective {:.6e}",
            status,
            self.state.iteration,
            self.state.objective,
        );
        SolverOutcome {
            x: self.state.x,
            objective: self.state.objective,
            status,
            iterations: self.state.iteration,
            objective_evaluations: self.objective_evaluations,
            jacobian_evaluations: self.jacobian_evaluations,
            history: self.history,
            failure: self.failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    /// Rosenbrock function as residuals `[10 (y - x^2), 1 - x]`
    struct Rosenbrock;

    impl LeastSquaresProblem for Rosenbrock {
        fn n_params(&self) -> usize {
            2
        }

        fn residuals(&self, x: &[f64]) -> Result<DVector<f64>, FitError> {
            Ok(DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]))
        }

        fn linearize(&self, x: &[f64]) -> Result<Linearization, FitError> {
            Ok(Linearization {
                residuals: self.residuals(x)?,
                jacobian: DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0]),
            })
        }
    }

    /// Exponential decay `a exp(-b t)` with `b >= 0`
    struct Decay {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl Decay {
        fn new(a: f64, b: f64) -> Self {
            let t: Vec<f64> = (0..20).map(|i| 0.25 * i as f64).collect();
            let y = t.iter().map(|t| a * f64::exp(-b * t)).collect();
            Self { t, y }
        }
    }

    impl LeastSquaresProblem for Decay {
        fn n_params(&self) -> usize {
            2
        }

        fn residuals(&self, x: &[f64]) -> Result<DVector<f64>, FitError> {
            Ok(DVector::from_iterator(
                self.t.len(),
                self.t
                    .iter()
                    .zip(&self.y)
                    .map(|(t, y)| x[0] * f64::exp(-x[1] * t) - y),
            ))
        }

        fn linearize(&self, x: &[f64]) -> Result<Linearization, FitError> {
            let jacobian = DMatrix::from_fn(self.t.len(), 2, |i, j| {
                let e = f64::exp(-x[1] * self.t[i]);
                if j == 0 { e } else { -x[0] * self.t[i] * e }
            });
            Ok(Linearization {
                residuals: self.residuals(x)?,
                jacobian,
            })
        }

        fn project(&self, x: &mut [f64]) {
            x[1] = x[1].max(0.0);
        }

        fn check_domain(&self, x: &[f64]) -> Result<(), FitError> {
            if x[1] < 0.0 {
                Err(FitError::invalid_domain("negative decay rate"))
            } else {
                Ok(())
            }
        }

        fn bounds(&self) -> Option<(Vec<f64>, Vec<f64>)> {
            Some((vec![f64::NEG_INFINITY, 0.0], vec![f64::INFINITY; 2]))
        }
    }

    struct Overflowing;

    impl LeastSquaresProblem for Overflowing {
        fn n_params(&self) -> usize {
            1
        }

        fn residuals(&self, x: &[f64]) -> Result<DVector<f64>, FitError> {
            let value = if x[0] > 0.5 { f64::INFINITY } else { 1.0 - x[0] };
            Ok(DVector::from_element(1, value))
        }

        fn linearize(&self, x: &[f64]) -> Result<Linearization, FitError> {
            Ok(Linearization {
                residuals: self.residuals(x)?,
                jacobian: DMatrix::from_element(1, 1, -1.0),
            })
        }
    }

    #[test]
    fn rosenbrock_converges() {
        for subproblem in [SubproblemMethod::Dogleg, SubproblemMethod::SteihaugCg] {
            let solver = TrustRegionSolver::new(TrustRegionConfig::default().with_subproblem(subproblem));
            let outcome = solver.solve(&Rosenbrock, &[-1.2, 1.0], None).unwrap();
            assert!(outcome.status.is_converged(), "{subproblem:?}: {:?}", outcome.status);
            assert_relative_eq!(outcome.x[0], 1.0, epsilon = 1e-6);
            assert_relative_eq!(outcome.x[1], 1.0, epsilon = 1e-6);
            assert_eq!(outcome.iterations, outcome.history.len());
        }
    }

    #[test]
    fn accepted_objectives_never_increase() {
        let solver = TrustRegionSolver::default();
        let outcome = solver.solve(&Rosenbrock, &[-1.2, 1.0], None).unwrap();
        let accepted = outcome
            .history
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.objective)
            .collect::<Vec<_>>();
        assert!(accepted.len() > 1);
        for pair in accepted.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(outcome.objective <= accepted[accepted.len() - 1]);
    }

    #[test]
    fn steps_respect_radius() {
        let config = TrustRegionConfig::default().with_initial_radius(0.05);
        let solver = TrustRegionSolver::new(config);
        let mut run = solver.start(&Rosenbrock, &[-1.2, 1.0]).unwrap();
        while run.solver_state() == SolverState::Iterating {
            let radius = run.state().radius;
            let n_records = run.history().len();
            run.step();
            if run.history().len() > n_records {
                let record = &run.history()[n_records];
                assert!(record.step_norm <= radius * (1.0 + 1e-10));
            }
        }
        assert!(run.finish().status.is_converged());
    }

    #[test]
    fn bounded_optimum_is_reached() {
        // The unconstrained optimum has a negative rate, so the bounded one is a constant
        let problem = Decay::new(2.0, -0.3);
        let n = problem.y.len() as f64;
        let mean = problem.y.iter().sum::<f64>() / n;
        let objective = problem.y.iter().map(|y| (y - mean).powi(2)).sum::<f64>();
        for subproblem in [SubproblemMethod::Dogleg, SubproblemMethod::SteihaugCg] {
            let solver = TrustRegionSolver::new(TrustRegionConfig::default().with_subproblem(subproblem));
            for x0 in [[1.0, 0.5], [1.0, 0.05], [5.0, 0.0]] {
                let outcome = solver.solve(&problem, &x0, None).unwrap();
                assert!(outcome.status.is_converged(), "{subproblem:?} {x0:?}: {:?}", outcome.status);
                assert_eq!(outcome.x[1], 0.0);
                assert_relative_eq!(outcome.x[0], mean, max_relative = 1e-6);
                assert_relative_eq!(outcome.objective, objective, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn infeasible_start_is_rejected() {
        let problem = Decay::new(2.0, -0.3);
        assert!(matches!(
            TrustRegionSolver::default().solve(&problem, &[1.0, -0.5], None),
            Err(FitError::InvalidDomain(_))
        ));
    }

    #[test]
    fn decay_recovers_parameters() {
        let problem = Decay::new(3.0, 0.7);
        let outcome = TrustRegionSolver::default().solve(&problem, &[1.0, 0.1], None).unwrap();
        assert!(outcome.status.is_converged());
        assert_relative_eq!(outcome.x[0], 3.0, max_relative = 1e-6);
        assert_relative_eq!(outcome.x[1], 0.7, max_relative = 1e-6);
    }

    #[test]
    fn converged_start_stops_immediately() {
        let outcome = TrustRegionSolver::default().solve(&Rosenbrock, &[1.0, 1.0], None).unwrap();
        assert_eq!(
            outcome.status,
            FitStatus::Converged(ConvergenceCriterion::GradientTolerance)
        );
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn max_iterations() {
        let solver = TrustRegionSolver::new(TrustRegionConfig::default().with_max_iterations(2));
        let outcome = solver.solve(&Rosenbrock, &[-1.2, 1.0], None).unwrap();
        assert_eq!(outcome.status, FitStatus::MaxIterationsReached);
        assert_eq!(outcome.iterations, 2);
    }

    #[test]
    fn cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = TrustRegionSolver::default()
            .solve(&Rosenbrock, &[-1.2, 1.0], Some(&token))
            .unwrap();
        assert_eq!(outcome.status, FitStatus::Cancelled);
        assert_eq!(outcome.x, vec![-1.2, 1.0]);
    }

    #[test]
    fn overflow_keeps_last_valid_point() {
        let solver = TrustRegionSolver::new(TrustRegionConfig::default().with_initial_radius(10.0));
        let outcome = solver.solve(&Overflowing, &[0.0], None).unwrap();
        assert_eq!(outcome.status, FitStatus::Failed);
        assert_eq!(outcome.failure, Some(FitError::NumericalOverflow));
        assert!(outcome.objective.is_finite());
        assert!(outcome.x[0] <= 0.5);
    }

    #[test]
    fn wrong_start_length() {
        assert!(matches!(
            TrustRegionSolver::default().solve(&Rosenbrock, &[1.0], None),
            Err(FitError::DimensionMismatch { .. })
        ));
    }
}
