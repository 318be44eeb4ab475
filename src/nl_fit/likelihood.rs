use crate::basis::{Basis, BasisTrait, N_NONLINEAR};
use crate::data::PixelData;
use crate::error::FitError;
use crate::psf::PsfModel;

use nalgebra::{DMatrix, DVector};

/// Singular values below this fraction of the largest one are dropped by linear solves
const LINEAR_SOLVE_RCOND: f64 = 1e-12;

/// Noise-weighted residuals of a PSF-convolved basis model against pixel data
///
/// Residuals are `(model - data) / sigma`, so their squared norm is `chi^2`.
#[derive(Clone, Debug)]
pub struct Likelihood<'a> {
    pixels: &'a PixelData,
    basis: &'a Basis,
    psf: &'a PsfModel,
}

#[derive(Clone, Debug)]
pub struct LikelihoodEvaluation {
    pub residuals: DVector<f64>,
    /// `npix x (N_NONLINEAR + size)`, nonlinear columns first
    pub jacobian: DMatrix<f64>,
}

impl<'a> Likelihood<'a> {
    pub fn new(pixels: &'a PixelData, basis: &'a Basis, psf: &'a PsfModel) -> Self {
        Self { pixels, basis, psf }
    }

    pub fn n_params(&self) -> usize {
        N_NONLINEAR + self.basis.size()
    }

    pub fn n_data(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &PixelData {
        self.pixels
    }

    pub fn basis(&self) -> &Basis {
        self.basis
    }

    fn split<'p>(&self, params: &'p [f64]) -> Result<(&'p [f64], &'p [f64]), FitError> {
        FitError::check_len("parameters", self.n_params(), params.len())?;
        Ok(params.split_at(N_NONLINEAR))
    }

    fn weighted_residuals(&self, model: &DVector<f64>) -> Result<DVector<f64>, FitError> {
        FitError::check_len("model pixels", self.n_data(), model.len())?;
        Ok(DVector::from_iterator(
            model.len(),
            model
                .iter()
                .zip(self.pixels.z.iter().zip(self.pixels.inv_err.iter()))
                .map(|(&m, (&z, &w))| (m - z) * w),
        ))
    }

    pub fn residuals(&self, params: &[f64]) -> Result<DVector<f64>, FitError> {
        let (nonlinear, amplitudes) = self.split(params)?;
        let evaluation = self.basis.evaluate(self.pixels, nonlinear, self.psf)?;
        self.weighted_residuals(&evaluation.model(amplitudes)?)
    }

    pub fn evaluate(&self, params: &[f64]) -> Result<LikelihoodEvaluation, FitError> {
        let (nonlinear, amplitudes) = self.split(params)?;
        let evaluation = self.basis.evaluate(self.pixels, nonlinear, self.psf)?;
        FitError::check_len("design matrix rows", self.n_data(), evaluation.npix())?;
        let residuals = self.weighted_residuals(&evaluation.model(amplitudes)?)?;

        let mut jacobian = DMatrix::zeros(self.n_data(), self.n_params());
        jacobian
            .columns_mut(0, N_NONLINEAR)
            .copy_from(&evaluation.nonlinear_jacobian(amplitudes)?);
        jacobian
            .columns_mut(N_NONLINEAR, self.basis.size())
            .copy_from(&evaluation.design);
        for (mut row, &w) in jacobian.row_iter_mut().zip(self.pixels.inv_err.iter()) {
            row *= w;
        }
        Ok(LikelihoodEvaluation {
            residuals,
            jacobian,
        })
    }

    pub fn chi2(&self, params: &[f64]) -> Result<f64, FitError> {
        Ok(self.residuals(params)?.norm_squared())
    }

    /// Weighted linear least-squares amplitudes at fixed nonlinear parameters
    pub fn solve_amplitudes(&self, nonlinear: &[f64]) -> Result<Vec<f64>, FitError> {
        let evaluation = self.basis.evaluate(self.pixels, nonlinear, self.psf)?;
        let mut design = evaluation.design;
        for (mut row, &w) in design.row_iter_mut().zip(self.pixels.inv_err.iter()) {
            row *= w;
        }
        let rhs = DVector::from_iterator(
            self.n_data(),
            self.pixels
                .z
                .iter()
                .zip(self.pixels.inv_err.iter())
                .map(|(&z, &w)| z * w),
        );
        let svd = design.svd(true, true);
        let eps = LINEAR_SOLVE_RCOND * svd.singular_values.max();
        let amplitudes = svd
            .solve(&rhs, eps)
            .map_err(|e| FitError::invalid_domain(e.to_string()))?;
        if amplitudes.iter().all(|a| a.is_finite()) {
            Ok(amplitudes.iter().copied().collect())
        } else {
            Err(FitError::NumericalOverflow)
        }
    }
}
