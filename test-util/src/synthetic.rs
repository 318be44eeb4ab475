use conv::prelude::*;
use itertools::iproduct;
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::Normal;
use std::f64::consts::TAU;

/// Elliptical Gaussian with second moments `[xx, yy, xy]`
///
/// A point source convolved with a Gaussian PSF is the PSF moments with the source flux.
#[derive(Clone, Copy, Debug)]
pub struct GaussianSource {
    pub center: [f64; 2],
    pub moments: [f64; 3],
    pub flux: f64,
}

impl GaussianSource {
    pub fn new(center: [f64; 2], moments: [f64; 3], flux: f64) -> Self {
        Self {
            center,
            moments,
            flux,
        }
    }

    pub fn circular(center: [f64; 2], sigma: f64, flux: f64) -> Self {
        Self::new(center, [sigma * sigma, sigma * sigma, 0.0], flux)
    }

    /// Same source seen through a Gaussian PSF with the given moments
    pub fn convolved(&self, psf_moments: [f64; 3]) -> Self {
        Self::new(
            self.center,
            [
                self.moments[0] + psf_moments[0],
                self.moments[1] + psf_moments[1],
                self.moments[2] + psf_moments[2],
            ],
            self.flux,
        )
    }

    /// Surface brightness at a point
    pub fn value(&self, x: f64, y: f64) -> f64 {
        let [xx, yy, xy] = self.moments;
        let det = xx * yy - xy * xy;
        let (dx, dy) = (x - self.center[0], y - self.center[1]);
        let z = (yy * dx * dx - 2.0 * xy * dx * dy + xx * dy * dy) / det;
        self.flux * f64::exp(-0.5 * z) / (TAU * det.sqrt())
    }
}

/// Pixel-center coordinate of index `i` along an axis of length `n` centered on zero
pub fn centered_coordinates(n: usize) -> Vec<f64> {
    let half = (n / 2).approx_as::<f64>().unwrap();
    (0..n).map(|i| i.approx_as::<f64>().unwrap() - half).collect()
}

/// Noise-free image of a sum of sources with a constant variance plane
#[derive(Clone, Debug)]
pub struct SyntheticPatch {
    pub image: Array2<f64>,
    pub variance: f64,
}

impl SyntheticPatch {
    /// `shape` is `(ny, nx)`, pixel `[i, j]` is centered at `(j - nx / 2, i - ny / 2)`
    pub fn new(shape: (usize, usize), sources: &[GaussianSource], variance: f64) -> Self {
        let (ny, nx) = shape;
        let xs = centered_coordinates(nx);
        let ys = centered_coordinates(ny);
        let mut image = Array2::zeros(shape);
        for (i, j) in iproduct!(0..ny, 0..nx) {
            image[[i, j]] = sources.iter().map(|s| s.value(xs[j], ys[i])).sum();
        }
        Self { image, variance }
    }

    pub fn with_noise(mut self, seed: u64) -> Self {
        add_gaussian_noise(&mut self.image, self.variance.sqrt(), seed);
        self
    }
}

pub fn add_gaussian_noise(image: &mut Array2<f64>, sigma: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    image.mapv_inplace(|v| v + normal.sample(&mut rng));
}
