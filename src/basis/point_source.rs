use crate::basis::{
    BasisEvaluation, BasisTrait, ComponentShape, NonlinearParams, check_pixels, render_component,
};
use crate::data::PixelData;
use crate::error::FitError;
use crate::psf::PsfModel;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Unresolved source: the PSF itself, with a single flux amplitude
///
/// The ellipse parameters are carried in the parameter vector but do not change the model.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PointSourceBasis {}

impl BasisTrait for PointSourceBasis {
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
        check_pixels(pixels)?;
        let params = NonlinearParams::from_slice(nonlinear)?;
        let mut out = BasisEvaluation::zeros(pixels.len(), 1);
        render_component(
            pixels,
            params.center,
            &ComponentShape::delta(),
            0,
            psf,
            0,
            &mut out,
        )?;
        Ok(out)
    }
}
