use crate::basis::{BasisComponent, BasisEvaluation, BasisTrait, render_components};
use crate::data::PixelData;
use crate::error::FitError;
use crate::psf::PsfModel;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Single elliptical Gaussian with the source ellipse as its second moments
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GaussianBasis {}

impl BasisTrait for GaussianBasis {
    fn size(&self) -> usize {
        1
    }

    fn flux_terms(&self) -> Vec<(usize, f64)> {
        vec![(0, 1.0)]
    }

    fn evaluate(
        &self,
        pixels: &PixelData,
        nonlinear: &[f64],
        psf: &PsfModel,
    ) -> Result<BasisEvaluation, FitError> {
        render_components(pixels, nonlinear, psf, &[BasisComponent::new(0, 1.0, 1.0)])
    }
}
