use crate::data::ImagePatch;
use crate::error::FitError;

use itertools::izip;
use ndarray::Array1;

/// Unmasked pixels of an [ImagePatch] flattened for fitting
///
/// `x` and `y` are pixel centers, `z` the observed values and `inv_err` the inverse noise
/// standard deviations. Pixels with zero, negative or non-finite variance never get here.
#[derive(Clone, Debug)]
pub struct PixelData {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub z: Array1<f64>,
    pub inv_err: Array1<f64>,
}

impl PixelData {
    pub fn new(
        x: Array1<f64>,
        y: Array1<f64>,
        z: Array1<f64>,
        inv_err: Array1<f64>,
    ) -> Result<Self, FitError> {
        FitError::check_len("pixel y coordinates", x.len(), y.len())?;
        FitError::check_len("pixel values", x.len(), z.len())?;
        FitError::check_len("pixel inverse errors", x.len(), inv_err.len())?;
        if x.is_empty() {
            return Err(FitError::invalid_domain("no pixels to fit"));
        }
        Ok(Self { x, y, z, inv_err })
    }

    pub fn from_patch(patch: &ImagePatch) -> Result<Self, FitError> {
        let (x_grid, y_grid) = patch.coordinates()?;
        let mut x = vec![];
        let mut y = vec![];
        let mut z = vec![];
        let mut inv_err = vec![];
        for (&xv, &yv, &value, &variance) in
            izip!(&x_grid, &y_grid, &patch.image, &patch.variance)
        {
            if variance > 0.0 && variance.is_finite() && value.is_finite() {
                x.push(xv);
                y.push(yv);
                z.push(value);
                inv_err.push(variance.sqrt().recip());
            }
        }
        Self::new(x.into(), y.into(), z.into(), inv_err.into())
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{Array2, array};

    #[test]
    fn masks_bad_variance() {
        let image = Array2::from_elem((3, 3), 1.0);
        let mut variance = Array2::from_elem((3, 3), 4.0);
        variance[[0, 0]] = 0.0;
        variance[[1, 1]] = -1.0;
        variance[[2, 2]] = f64::NAN;
        let patch = ImagePatch::new(image, variance, [0, 0]).unwrap();
        let data = PixelData::from_patch(&patch).unwrap();
        assert_eq!(data.len(), 6);
        assert!(data.inv_err.iter().all(|&w| w == 0.5));
    }

    #[test]
    fn fully_masked_patch_is_invalid() {
        let patch = ImagePatch::new(Array2::ones((2, 2)), Array2::zeros((2, 2)), [0, 0]).unwrap();
        assert!(matches!(
            PixelData::from_patch(&patch),
            Err(FitError::InvalidDomain(_))
        ));
    }

    #[test]
    fn length_mismatch() {
        let err = PixelData::new(
            array![0.0, 1.0],
            array![0.0, 1.0],
            array![1.0],
            array![1.0, 1.0],
        )
        .unwrap_err();
        assert_eq!(
            err,
            FitError::DimensionMismatch {
                what: "pixel values",
                expected: 2,
                actual: 1
            }
        );
    }
}
