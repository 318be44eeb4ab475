use crate::ellipse::Quadrupole;
use crate::error::FitError;

use conv::prelude::*;
use ndarray::{Array2, Zip};
use ndarray_stats::SummaryStatisticsExt;

/// Rectangular cutout of an exposure with its per-pixel variance
///
/// Element `[i, j]` is the pixel centered at `(origin[0] + j, origin[1] + i)`, so rows run
/// along `y` and columns along `x`.
#[derive(Clone, Debug)]
pub struct ImagePatch {
    pub image: Array2<f64>,
    pub variance: Array2<f64>,
    pub origin: [i64; 2],
}

impl ImagePatch {
    pub fn new(image: Array2<f64>, variance: Array2<f64>, origin: [i64; 2]) -> Result<Self, FitError> {
        if image.shape() != variance.shape() {
            return Err(FitError::DimensionMismatch {
                what: "variance plane",
                expected: image.len(),
                actual: variance.len(),
            });
        }
        if image.is_empty() {
            return Err(FitError::invalid_domain("image patch is empty"));
        }
        Ok(Self {
            image,
            variance,
            origin,
        })
    }

    /// Patch with constant variance, centered on the coordinate origin
    pub fn centered(image: Array2<f64>, variance: f64) -> Result<Self, FitError> {
        let (ny, nx) = image.dim();
        let origin = [-((nx / 2) as i64), -((ny / 2) as i64)];
        let variance = Array2::from_elem((ny, nx), variance);
        Self::new(image, variance, origin)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.image.dim()
    }

    /// Pixel-center coordinates of every element, `(x, y)` grids shaped as the image
    pub fn coordinates(&self) -> Result<(Array2<f64>, Array2<f64>), FitError> {
        let x0 = pixel_coordinate(self.origin[0], 0)?;
        let y0 = pixel_coordinate(self.origin[1], 0)?;
        let (ny, nx) = self.shape();
        let mut x = Array2::zeros((ny, nx));
        let mut y = Array2::zeros((ny, nx));
        for (((i, j), xv), yv) in x.indexed_iter_mut().zip(y.iter_mut()) {
            *xv = x0 + pixel_coordinate(0, j)?;
            *yv = y0 + pixel_coordinate(0, i)?;
        }
        Ok((x, y))
    }

    /// Unweighted first and second moments of the positive part of the image
    ///
    /// Returns the centroid and the second moments about it.
    pub fn moments(&self) -> Result<([f64; 2], Quadrupole), FitError> {
        let (x, y) = self.coordinates()?;
        let weights = self.image.mapv(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
        if !(weights.sum() > 0.0) {
            return Err(FitError::invalid_domain(
                "image has no positive flux to compute moments from",
            ));
        }
        let cx = x
            .weighted_mean(&weights)
            .map_err(|e| FitError::invalid_domain(e.to_string()))?;
        let cy = y
            .weighted_mean(&weights)
            .map_err(|e| FitError::invalid_domain(e.to_string()))?;
        let total = weights.sum();
        let mut q = [0.0; 3];
        Zip::from(&x).and(&y).and(&weights).for_each(|&x, &y, &w| {
            let (dx, dy) = (x - cx, y - cy);
            q[0] += w * dx * dx;
            q[1] += w * dy * dy;
            q[2] += w * dx * dy;
        });
        Ok(([cx, cy], q.map(|v| v / total)))
    }
}

fn pixel_coordinate(origin: i64, index: usize) -> Result<f64, FitError> {
    let origin = origin
        .approx_as::<f64>()
        .map_err(|e| FitError::invalid_domain(e.to_string()))?;
    let index = index
        .approx_as::<f64>()
        .map_err(|e| FitError::invalid_domain(e.to_string()))?;
    Ok(origin + index)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn centered_coordinates() {
        let patch = ImagePatch::centered(Array2::zeros((5, 7)), 1.0).unwrap();
        let (x, y) = patch.coordinates().unwrap();
        assert_eq!(x[[0, 0]], -3.0);
        assert_eq!(x[[0, 6]], 3.0);
        assert_eq!(y[[0, 0]], -2.0);
        assert_eq!(y[[4, 0]], 2.0);
    }

    #[test]
    fn moments_of_single_pixel() {
        let mut image = Array2::zeros((5, 5));
        image[[1, 3]] = 2.0;
        let patch = ImagePatch::new(image, Array2::ones((5, 5)), [10, 20]).unwrap();
        let (center, q) = patch.moments().unwrap();
        assert_relative_eq!(center[0], 13.0);
        assert_relative_eq!(center[1], 21.0);
        assert_relative_eq!(q[0], 0.0);
    }

    #[test]
    fn shape_mismatch() {
        let err = ImagePatch::new(Array2::zeros((3, 3)), Array2::zeros((3, 4)), [0, 0]).unwrap_err();
        assert!(matches!(err, FitError::DimensionMismatch { .. }));
    }

    #[test]
    fn empty_patch() {
        let err = ImagePatch::new(Array2::zeros((0, 3)), Array2::zeros((0, 3)), [0, 0]).unwrap_err();
        assert!(matches!(err, FitError::InvalidDomain(_)));
    }
}
