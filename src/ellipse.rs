//! Ellipse core parametrization used for the nonlinear shape parameters.
//!
//! The core is "separable": conformal shear $(\eta_1, \eta_2)$ times trace radius $r$. The
//! quadrupole moment matrix is
//!
//! $$
//! Q = r^2 \left(I + \frac{\tanh|\eta|}{|\eta|}\begin{pmatrix}\eta_1 & \eta_2 \\ \eta_2 & -\eta_1\end{pmatrix}\right),
//! $$
//!
//! so $\mathrm{tr}\,Q / 2 = r^2$ and the eigenvalues $r^2 (1 \pm \tanh|\eta|)$ are never
//! negative: every real parameter triple maps onto a valid ellipse.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Symmetric 2x2 matrix stored as `[xx, yy, xy]`
pub type Quadrupole = [f64; 3];

/// Below this shear amplitude the Taylor series of `tanh(n)/n` is used
const SMALL_SHEAR: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EllipseCore {
    pub eta1: f64,
    pub eta2: f64,
    pub radius: f64,
}

impl EllipseCore {
    pub fn new(eta1: f64, eta2: f64, radius: f64) -> Self {
        Self { eta1, eta2, radius }
    }

    pub fn circle(radius: f64) -> Self {
        Self::new(0.0, 0.0, radius)
    }

    /// Shear amplitude $|\eta|$
    pub fn shear(&self) -> f64 {
        f64::hypot(self.eta1, self.eta2)
    }

    /// Returns `(g, h)` with `g = tanh(n)/n` and `h = g'(n)/n`
    fn shear_factors(&self) -> (f64, f64) {
        let n = self.shear();
        if n < SMALL_SHEAR {
            let n2 = n * n;
            (
                1.0 - n2 / 3.0 + 2.0 * n2 * n2 / 15.0,
                -2.0 / 3.0 + 8.0 * n2 / 15.0,
            )
        } else {
            let t = n.tanh();
            let sech2 = 1.0 - t * t;
            (t / n, (n * sech2 - t) / n.powi(3))
        }
    }

    pub fn quadrupole(&self) -> Quadrupole {
        let (g, _) = self.shear_factors();
        let r2 = self.radius * self.radius;
        [
            r2 * (1.0 + g * self.eta1),
            r2 * (1.0 - g * self.eta1),
            r2 * g * self.eta2,
        ]
    }

    /// Derivatives of [EllipseCore::quadrupole] with respect to `eta1`, `eta2` and `radius`
    pub fn quadrupole_derivatives(&self) -> [Quadrupole; 3] {
        let (g, h) = self.shear_factors();
        let (e1, e2, r) = (self.eta1, self.eta2, self.radius);
        let r2 = r * r;
        let d_eta1 = [
            r2 * (g + h * e1 * e1),
            -r2 * (g + h * e1 * e1),
            r2 * h * e1 * e2,
        ];
        let d_eta2 = [r2 * h * e1 * e2, -r2 * h * e1 * e2, r2 * (g + h * e2 * e2)];
        let d_radius = [
            2.0 * r * (1.0 + g * e1),
            2.0 * r * (1.0 - g * e1),
            2.0 * r * g * e2,
        ];
        [d_eta1, d_eta2, d_radius]
    }

    /// $\det(Q)^{1/4}$
    pub fn determinant_radius(&self) -> f64 {
        self.radius.abs() / self.shear().cosh().sqrt()
    }

    /// Inverse of [EllipseCore::quadrupole]
    ///
    /// Returns `None` if the moments are not positive semi-definite.
    pub fn from_quadrupole(q: Quadrupole) -> Option<Self> {
        let [xx, yy, xy] = q;
        let r2 = 0.5 * (xx + yy);
        if !r2.is_finite() || r2 < 0.0 || xx * yy - xy * xy < 0.0 {
            return None;
        }
        if r2 == 0.0 {
            return Some(Self::circle(0.0));
        }
        let g_eta1 = 0.5 * (xx - yy) / r2;
        let g_eta2 = xy / r2;
        // tanh|eta|, strictly below one for a non-degenerate ellipse
        let e = f64::hypot(g_eta1, g_eta2).min(1.0 - f64::EPSILON);
        let scale = if e < SMALL_SHEAR {
            1.0 + e * e / 3.0
        } else {
            e.atanh() / e
        };
        Some(Self::new(g_eta1 * scale, g_eta2 * scale, r2.sqrt()))
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.eta1, self.eta2, self.radius]
    }
}

impl From<[f64; 3]> for EllipseCore {
    fn from(a: [f64; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }
}

pub(crate) fn quadrupole_add(a: Quadrupole, b: Quadrupole) -> Quadrupole {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub(crate) fn quadrupole_scale(a: Quadrupole, factor: f64) -> Quadrupole {
    [a[0] * factor, a[1] * factor, a[2] * factor]
}

pub(crate) fn quadrupole_det(q: Quadrupole) -> f64 {
    q[0] * q[1] - q[2] * q[2]
}
