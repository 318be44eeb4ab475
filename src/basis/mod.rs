//! PSF-convolved basis functions and their parameter derivatives.
//!
//! Every basis is built from Gauss-Hermite terms. For a component with relative scale $f$ and
//! order $n$, the term $(p, q)$, $k = p + q \le n$, is
//!
//! $$
//! B_{pq}(u) = \sum_j w_j (-s)^k \partial_x^p \partial_y^q G_{f^2 Q + P_j}(u), \qquad s = f r,
//! $$
//!
//! where $G_C$ is the unit-flux Gaussian with covariance $C$, $Q$ the source quadrupole and
//! $(w_j, P_j)$ the PSF mixture. Differentiation commutes with convolution, so this is the exact
//! convolution of the unconvolved terms with the PSF. $B_{00}$ has unit flux and all higher terms
//! integrate to zero, so amplitudes of zeroth-order terms are fluxes. For a circular source the
//! terms reduce to Hermite polynomials $He_p(x/s) He_q(y/s)$ times the Gaussian.
//!
//! Nonlinear derivatives reuse the same derivative table: translating the center is
//! $-\partial_u$, and changing the covariance obeys the heat equation
//! $\partial G / \partial C_{ij} = \frac12 \partial_i \partial_j G$.

use crate::data::PixelData;
use crate::ellipse::{EllipseCore, Quadrupole, quadrupole_add, quadrupole_det, quadrupole_scale};
use crate::error::FitError;
use crate::psf::PsfModel;

use enum_dispatch::enum_dispatch;
use nalgebra::{DMatrix, DVector, DVectorView};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

mod compound;
pub use compound::{BasisComponent, CompoundBasis};

mod gaussian;
pub use gaussian::GaussianBasis;

mod gaussian_derivatives;
use gaussian_derivatives::GaussianDerivatives;
pub use gaussian_derivatives::{n_terms, term_index, terms};

mod point_source;
pub use point_source::PointSourceBasis;

mod shapelet;
pub use shapelet::ShapeletBasis;

/// Number of nonlinear parameters: `x`, `y`, `eta1`, `eta2`, `radius`
pub const N_NONLINEAR: usize = 5;

/// Names of the nonlinear parameters in the order they appear in parameter vectors
pub const NONLINEAR_NAMES: [&str; N_NONLINEAR] = ["x", "y", "eta1", "eta2", "radius"];

#[enum_dispatch]
pub trait BasisTrait {
    /// Number of linear amplitudes
    fn size(&self) -> usize;

    /// Amplitude indices of the flux-carrying zeroth-order terms with their initial flux fractions
    fn flux_terms(&self) -> Vec<(usize, f64)>;

    /// Render the design matrix and its nonlinear derivatives at the pixel centers
    fn evaluate(
        &self,
        pixels: &PixelData,
        nonlinear: &[f64],
        psf: &PsfModel,
    ) -> Result<BasisEvaluation, FitError>;
}

/// Family of elementary profiles a source model is expanded in
#[enum_dispatch(BasisTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum Basis {
    PointSource(PointSourceBasis),
    Gaussian(GaussianBasis),
    Shapelet(ShapeletBasis),
    Compound(CompoundBasis),
}

impl Basis {
    pub fn point_source() -> Self {
        PointSourceBasis {}.into()
    }

    pub fn gaussian() -> Self {
        GaussianBasis {}.into()
    }

    pub fn shapelet(order: usize) -> Self {
        ShapeletBasis::new(order).into()
    }

    pub fn compound(components: Vec<BasisComponent>) -> Result<Self, FitError> {
        Ok(CompoundBasis::new(components)?.into())
    }
}

/// Output of [BasisTrait::evaluate]
#[derive(Clone, Debug)]
pub struct BasisEvaluation {
    /// `npix x size`, column `k` is basis function `k` rendered at every pixel
    pub design: DMatrix<f64>,
    /// Derivative of [BasisEvaluation::design] with respect to each nonlinear parameter
    pub design_derivatives: [DMatrix<f64>; N_NONLINEAR],
}

impl BasisEvaluation {
    fn zeros(npix: usize, size: usize) -> Self {
        Self {
            design: DMatrix::zeros(npix, size),
            design_derivatives: std::array::from_fn(|_| DMatrix::zeros(npix, size)),
        }
    }

    pub fn npix(&self) -> usize {
        self.design.nrows()
    }

    pub fn size(&self) -> usize {
        self.design.ncols()
    }

    /// Model image, linear in the amplitudes
    pub fn model(&self, amplitudes: &[f64]) -> Result<DVector<f64>, FitError> {
        FitError::check_len("amplitudes", self.size(), amplitudes.len())?;
        Ok(&self.design * DVectorView::from_slice(amplitudes, amplitudes.len()))
    }

    /// `npix x N_NONLINEAR` derivative of the model at fixed amplitudes
    pub fn nonlinear_jacobian(&self, amplitudes: &[f64]) -> Result<DMatrix<f64>, FitError> {
        FitError::check_len("amplitudes", self.size(), amplitudes.len())?;
        let a = DVectorView::from_slice(amplitudes, amplitudes.len());
        let mut jac = DMatrix::zeros(self.npix(), N_NONLINEAR);
        for (j, derivative) in self.design_derivatives.iter().enumerate() {
            jac.set_column(j, &(derivative * a));
        }
        Ok(jac)
    }
}

/// Center and ellipse decoded from the nonlinear part of a parameter vector
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NonlinearParams {
    pub center: [f64; 2],
    pub ellipse: EllipseCore,
}

impl NonlinearParams {
    pub fn new(center: [f64; 2], ellipse: EllipseCore) -> Self {
        Self { center, ellipse }
    }

    pub fn from_slice(nonlinear: &[f64]) -> Result<Self, FitError> {
        FitError::check_len("nonlinear parameters", N_NONLINEAR, nonlinear.len())?;
        if nonlinear.iter().any(|x| !x.is_finite()) {
            return Err(FitError::invalid_domain(
                "nonlinear parameters must be finite",
            ));
        }
        Ok(Self {
            center: [nonlinear[0], nonlinear[1]],
            ellipse: EllipseCore::new(nonlinear[2], nonlinear[3], nonlinear[4]),
        })
    }

    pub fn to_array(&self) -> [f64; N_NONLINEAR] {
        [
            self.center[0],
            self.center[1],
            self.ellipse.eta1,
            self.ellipse.eta2,
            self.ellipse.radius,
        ]
    }
}

/// Unconvolved geometry of one rendered component
struct ComponentShape {
    quadrupole: Quadrupole,
    /// Derivatives of `quadrupole` with respect to `eta1`, `eta2`, `radius`
    quadrupole_derivatives: [Quadrupole; 3],
    /// Hermite length scale `s` and its derivative with respect to `radius`
    scale: f64,
    scale_derivative: f64,
}

impl ComponentShape {
    fn scaled(ellipse: &EllipseCore, factor: f64) -> Self {
        let f2 = factor * factor;
        Self {
            quadrupole: quadrupole_scale(ellipse.quadrupole(), f2),
            quadrupole_derivatives: ellipse
                .quadrupole_derivatives()
                .map(|dq| quadrupole_scale(dq, f2)),
            scale: factor * ellipse.radius,
            scale_derivative: factor,
        }
    }

    fn delta() -> Self {
        Self {
            quadrupole: [0.0; 3],
            quadrupole_derivatives: [[0.0; 3]; 3],
            scale: 0.0,
            scale_derivative: 0.0,
        }
    }
}

fn check_pixels(pixels: &PixelData) -> Result<(), FitError> {
    if pixels.is_empty() {
        return Err(FitError::invalid_domain("pixel grid is empty"));
    }
    FitError::check_len("pixel y coordinates", pixels.x.len(), pixels.y.len())
}

/// Add the terms of one component of the given order to columns starting at `offset`
fn render_component(
    pixels: &PixelData,
    center: [f64; 2],
    shape: &ComponentShape,
    order: usize,
    psf: &PsfModel,
    offset: usize,
    out: &mut BasisEvaluation,
) -> Result<(), FitError> {
    let mut table = GaussianDerivatives::new(order + 2);
    for psf_component in psf.components() {
        let c = quadrupole_add(shape.quadrupole, psf_component.moments);
        let det = quadrupole_det(c);
        if !(det > 0.0 && det.is_finite()) {
            return Err(FitError::invalid_domain(
                "PSF-convolved component covariance is not positive definite",
            ));
        }
        let lambda = [c[1] / det, c[0] / det, -c[2] / det];
        let amplitude = psf_component.weight / (TAU * det.sqrt());
        for (i, (&x, &y)) in pixels.x.iter().zip(pixels.y.iter()).enumerate() {
            table.compute([x - center[0], y - center[1]], lambda, amplitude);
            for (p, q) in terms(order) {
                let k = p + q;
                let col = offset + term_index(p, q);
                let sk = (-shape.scale).powi(k as i32);
                let d = table.get(p, q);

                out.design[(i, col)] += sk * d;
                out.design_derivatives[0][(i, col)] -= sk * table.get(p + 1, q);
                out.design_derivatives[1][(i, col)] -= sk * table.get(p, q + 1);

                let d_xx = 0.5 * table.get(p + 2, q);
                let d_yy = 0.5 * table.get(p, q + 2);
                let d_xy = table.get(p + 1, q + 1);
                for (theta, dq) in shape.quadrupole_derivatives.iter().enumerate() {
                    out.design_derivatives[2 + theta][(i, col)] +=
                        sk * (d_xx * dq[0] + d_yy * dq[1] + d_xy * dq[2]);
                }
                if k > 0 {
                    let dsk = -(k as f64)
                        * (-shape.scale).powi(k as i32 - 1)
                        * shape.scale_derivative;
                    out.design_derivatives[4][(i, col)] += dsk * d;
                }
            }
        }
    }
    Ok(())
}

/// Render an ordered list of components sharing the source ellipse
fn render_components(
    pixels: &PixelData,
    nonlinear: &[f64],
    psf: &PsfModel,
    components: &[BasisComponent],
) -> Result<BasisEvaluation, FitError> {
    check_pixels(pixels)?;
    let params = NonlinearParams::from_slice(nonlinear)?;
    let size = components.iter().map(|c| n_terms(c.order)).sum();
    let mut out = BasisEvaluation::zeros(pixels.len(), size);
    let mut offset = 0;
    for component in components {
        let shape = ComponentShape::scaled(&params.ellipse, component.scale);
        render_component(
            pixels,
            params.center,
            &shape,
            component.order,
            psf,
            offset,
            &mut out,
        )?;
        offset += n_terms(component.order);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::Array1;

    pub(crate) fn grid(half_size: i32) -> PixelData {
        let coords: Vec<(f64, f64)> = (-half_size..=half_size)
            .flat_map(|y| (-half_size..=half_size).map(move |x| (x as f64, y as f64)))
            .collect();
        let n = coords.len();
        PixelData::new(
            coords.iter().map(|c| c.0).collect(),
            coords.iter().map(|c| c.1).collect(),
            Array1::zeros(n),
            Array1::ones(n),
        )
        .unwrap()
    }

    fn check_derivatives(basis: &Basis, psf: &PsfModel, nonlinear: [f64; N_NONLINEAR]) {
        let pixels = grid(8);
        let evaluation = basis.evaluate(&pixels, &nonlinear, psf).unwrap();
        let h = 1e-6;
        for j in 0..N_NONLINEAR {
            let mut plus = nonlinear;
            let mut minus = nonlinear;
            plus[j] += h;
            minus[j] -= h;
            let ep = basis.evaluate(&pixels, &plus, psf).unwrap();
            let em = basis.evaluate(&pixels, &minus, psf).unwrap();
            let numeric = (ep.design - em.design) / (2.0 * h);
            let scale = numeric.amax().max(evaluation.design.amax());
            let diff = (&evaluation.design_derivatives[j] - &numeric).amax();
            assert!(
                diff <= 1e-5 * scale,
                "{}: analytic and numeric derivatives differ by {diff}",
                NONLINEAR_NAMES[j]
            );
        }
    }

    #[test]
    fn gaussian_has_unit_flux() {
        let pixels = grid(20);
        let psf = PsfModel::circular_gaussian(2.0);
        let evaluation = Basis::gaussian()
            .evaluate(&pixels, &[0.3, -0.2, 0.2, 0.1, 1.5], &psf)
            .unwrap();
        assert_relative_eq!(evaluation.design.column(0).sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn higher_order_terms_carry_no_flux() {
        let pixels = grid(25);
        let psf = PsfModel::circular_gaussian(1.5);
        let evaluation = Basis::shapelet(2)
            .evaluate(&pixels, &[0.0, 0.0, 0.1, 0.0, 2.0], &psf)
            .unwrap();
        assert_relative_eq!(evaluation.design.column(0).sum(), 1.0, epsilon = 1e-6);
        for col in 1..evaluation.size() {
            assert!(evaluation.design.column(col).sum().abs() < 1e-6);
        }
    }

    #[test]
    fn point_source_is_psf() {
        let pixels = grid(10);
        let psf = PsfModel::circular_gaussian(2.0);
        let point = Basis::point_source()
            .evaluate(&pixels, &[0.5, 0.5, 0.3, 0.3, 3.0], &psf)
            .unwrap();
        let gaussian = Basis::gaussian()
            .evaluate(&pixels, &[0.5, 0.5, 0.0, 0.0, 0.0], &psf)
            .unwrap();
        assert_relative_eq!(point.design, gaussian.design, epsilon = 1e-14);
        assert_eq!(point.design_derivatives[4].amax(), 0.0);
    }

    #[test]
    fn derivatives_gaussian() {
        check_derivatives(
            &Basis::gaussian(),
            &PsfModel::circular_gaussian(2.0),
            [0.4, -0.3, 0.3, -0.2, 1.8],
        );
    }

    #[test]
    fn derivatives_shapelet() {
        check_derivatives(
            &Basis::shapelet(3),
            &PsfModel::double_gaussian(1.2, 3.0, 0.2),
            [-0.6, 0.2, -0.5, 0.4, 2.2],
        );
    }

    #[test]
    fn derivatives_compound() {
        let basis = Basis::compound(vec![
            BasisComponent::new(0, 0.5, 0.7),
            BasisComponent::new(2, 1.0, 0.2),
            BasisComponent::new(1, 3.0, 0.1),
        ])
        .unwrap();
        check_derivatives(
            &basis,
            &PsfModel::circular_gaussian(1.0),
            [0.1, 0.1, 0.2, 0.6, 1.1],
        );
    }

    #[test]
    fn model_is_linear_in_amplitudes() {
        let pixels = grid(6);
        let psf = PsfModel::circular_gaussian(1.0);
        let evaluation = Basis::shapelet(1)
            .evaluate(&pixels, &[0.0, 0.0, 0.0, 0.0, 1.0], &psf)
            .unwrap();
        let a = evaluation.model(&[1.0, 2.0, 3.0]).unwrap();
        let b = evaluation.model(&[2.0, 4.0, 6.0]).unwrap();
        assert_relative_eq!(2.0 * a, b, epsilon = 1e-14);
        assert!(matches!(
            evaluation.model(&[1.0]),
            Err(FitError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn tiny_and_huge_scales_are_finite() {
        let pixels = grid(5);
        let psf = PsfModel::circular_gaussian(2.0);
        for radius in [1e-6, 1e-3, 1e3, 1e5] {
            let evaluation = Basis::shapelet(2)
                .evaluate(&pixels, &[0.0, 0.0, 0.2, 0.0, radius], &psf)
                .unwrap();
            assert!(evaluation.design.iter().all(|v| v.is_finite()));
            assert!(
                evaluation
                    .design_derivatives
                    .iter()
                    .all(|d| d.iter().all(|v| v.is_finite()))
            );
        }
    }

    #[test]
    fn invalid_inputs() {
        let pixels = grid(2);
        let psf = PsfModel::circular_gaussian(1.0);
        assert!(matches!(
            Basis::gaussian().evaluate(&pixels, &[0.0; 4], &psf),
            Err(FitError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            Basis::gaussian().evaluate(&pixels, &[0.0, 0.0, 0.0, f64::NAN, 1.0], &psf),
            Err(FitError::InvalidDomain(_))
        ));
        assert!(matches!(
            Basis::point_source().evaluate(&pixels, &[0.0; 5], &PsfModel::delta()),
            Err(FitError::InvalidDomain(_))
        ));
    }
}
