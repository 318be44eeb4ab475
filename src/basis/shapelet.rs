use crate::basis::{BasisComponent, BasisEvaluation, BasisTrait, n_terms, render_components};
use crate::data::PixelData;
use crate::error::FitError;
use crate::psf::PsfModel;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Gauss-Hermite (shapelet) expansion of the given order at the source ellipse
///
/// Amplitudes are ordered by [crate::basis::term_index], the first one is the flux.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ShapeletBasis {
    pub order: usize,
}

impl ShapeletBasis {
    pub fn new(order: usize) -> Self {
        Self { order }
    }

    pub fn default_order() -> usize {
        2
    }
}

impl Default for ShapeletBasis {
    fn default() -> Self {
        Self::new(Self::default_order())
    }
}

impl BasisTrait for ShapeletBasis {
    fn size(&self) -> usize {
        n_terms(self.order)
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
        render_components(
            pixels,
            nonlinear,
            psf,
            &[BasisComponent::new(self.order, 1.0, 1.0)],
        )
    }
}
