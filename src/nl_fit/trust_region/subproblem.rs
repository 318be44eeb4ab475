//! Approximate minimizers of the Gauss-Newton model $m(p) = |r + J p|^2$ within $|p| \le \Delta$.
//!
//! Everything here works with the normal-equation quantities $H = J^T J$ and $g = J^T r$, so
//! $m(p) = |r|^2 + 2 g^T p + p^T H p$.

use crate::error::FitError;

use nalgebra::{DMatrix, DVector};

/// Number of Levenberg regularization attempts before the sub-problem is declared singular
const MAX_REGULARIZATION_ATTEMPTS: usize = 20;
/// First Levenberg damping relative to the largest diagonal element of `H`
const INITIAL_DAMPING: f64 = 1e-12;
const DAMPING_GROWTH: f64 = 10.0;
/// Floor of the Levenberg scaling, relative to the largest diagonal element of `H`
const MIN_SCALING: f64 = 1e-12;

/// How a sub-problem step was obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Full Gauss-Newton step, inside the trust region
    GaussNewton,
    /// Steepest descent truncated at the boundary
    SteepestDescent,
    /// Interpolation between the Cauchy point and the Gauss-Newton step
    Dogleg,
    /// Conjugate-gradient iterate, interior or on the boundary
    ConjugateGradient,
    /// Zero gradient
    Zero,
}

#[derive(Clone, Debug)]
pub struct SubproblemStep {
    pub step: DVector<f64>,
    pub kind: StepKind,
}

/// Decrease of the model from `p = 0` to `p`
pub fn predicted_decrease(h: &DMatrix<f64>, g: &DVector<f64>, p: &DVector<f64>) -> f64 {
    -(2.0 * g.dot(p) + p.dot(&(h * p)))
}

/// Solve `H p = -g`, regularizing with growing Levenberg damping if `H` is singular
pub fn gauss_newton_step(h: &DMatrix<f64>, g: &DVector<f64>) -> Result<DVector<f64>, FitError> {
    if let Some(cholesky) = h.clone().cholesky() {
        let step = cholesky.solve(&(-g));
        if step.iter().all(|x| x.is_finite()) {
            return Ok(step);
        }
    }

    let scale = h.diagonal().max();
    if !(scale > 0.0 && scale.is_finite()) {
        return Err(FitError::SingularSubproblem);
    }
    let scaling = h.diagonal().map(|d| d.max(MIN_SCALING * scale));
    let mut damping = INITIAL_DAMPING;
    for _ in 0..MAX_REGULARIZATION_ATTEMPTS {
        let mut regularized = h.clone();
        for (i, s) in scaling.iter().enumerate() {
            regularized[(i, i)] += damping * s;
        }
        if let Some(cholesky) = regularized.cholesky() {
            let step = cholesky.solve(&(-g));
            if step.iter().all(|x| x.is_finite()) {
                log::trace!("Gauss-Newton step regularized with damping {damping:e}");
                return Ok(step);
            }
        }
        damping *= DAMPING_GROWTH;
    }
    Err(FitError::SingularSubproblem)
}

/// Powell's dogleg step
pub fn dogleg(
    h: &DMatrix<f64>,
    g: &DVector<f64>,
    radius: f64,
) -> Result<SubproblemStep, FitError> {
    let g_norm = g.norm();
    if g_norm == 0.0 {
        return Ok(SubproblemStep {
            step: DVector::zeros(g.len()),
            kind: StepKind::Zero,
        });
    }

    let gn = gauss_newton_step(h, g)?;
    if gn.norm() <= radius {
        return Ok(SubproblemStep {
            step: gn,
            kind: StepKind::GaussNewton,
        });
    }

    // Cauchy point: minimizer of the model along -g
    let g_h_g = g.dot(&(h * g));
    let steepest = |radius: f64| SubproblemStep {
        step: g * (-radius / g_norm),
        kind: StepKind::SteepestDescent,
    };
    if !(g_h_g > 0.0) {
        return Ok(steepest(radius));
    }
    let cauchy = g * (-g_norm * g_norm / g_h_g);
    let cauchy_norm = cauchy.norm();
    if cauchy_norm >= radius {
        return Ok(steepest(radius));
    }

    let v = &gn - &cauchy;
    let beta = boundary_intersection(&cauchy, &v, radius).clamp(0.0, 1.0);
    Ok(SubproblemStep {
        step: cauchy + v * beta,
        kind: StepKind::Dogleg,
    })
}

/// Steihaug's truncated conjugate gradients on `H p = -g`
pub fn steihaug_cg(h: &DMatrix<f64>, g: &DVector<f64>, radius: f64) -> SubproblemStep {
    let n = g.len();
    let g_norm = g.norm();
    let mut z = DVector::zeros(n);
    if g_norm == 0.0 {
        return SubproblemStep {
            step: z,
            kind: StepKind::Zero,
        };
    }
    let tolerance = g_norm.sqrt().min(0.5) * g_norm;
    let mut r = g.clone();
    let mut d = -g;
    let mut r_norm2 = r.norm_squared();
    // Exact arithmetic needs at most n iterations, allow some slack for round-off
    for _ in 0..2 * n {
        let hd = h * &d;
        let d_h_d = d.dot(&hd);
        if !(d_h_d > 0.0) {
            let tau = boundary_intersection(&z, &d, radius);
            return SubproblemStep {
                step: z + d * tau,
                kind: StepKind::ConjugateGradient,
            };
        }
        let alpha = r_norm2 / d_h_d;
        let z_next = &z + &d * alpha;
        if z_next.norm() >= radius {
            let tau = boundary_intersection(&z, &d, radius);
            return SubproblemStep {
                step: z + d * tau,
                kind: StepKind::ConjugateGradient,
            };
        }
        z = z_next;
        r += hd * alpha;
        let r_norm2_next = r.norm_squared();
        if r_norm2_next.sqrt() < tolerance {
            break;
        }
        d = &d * (r_norm2_next / r_norm2) - &r;
        r_norm2 = r_norm2_next;
    }
    SubproblemStep {
        step: z,
        kind: StepKind::ConjugateGradient,
    }
}

/// Largest `tau >= 0` with `|z + tau d| = radius`, for `|z| <= radius`
fn boundary_intersection(z: &DVector<f64>, d: &DVector<f64>, radius: f64) -> f64 {
    let a = d.norm_squared();
    if a == 0.0 {
        return 0.0;
    }
    let b = z.dot(d);
    let c = (z.norm_squared() - radius * radius).min(0.0);
    let discriminant = (b * b - a * c).max(0.0).sqrt();
    // Pick the form without cancellation
    if b <= 0.0 {
        (-b + discriminant) / a
    } else {
        -c / (b + discriminant)
    }
}
