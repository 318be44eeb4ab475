use crate::ellipse::{EllipseCore, Quadrupole, quadrupole_det};
use crate::error::FitError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One elliptical Gaussian of a [PsfModel]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PsfComponent {
    /// Fraction of the PSF flux carried by this component
    pub weight: f64,
    /// Second moments `[xx, yy, xy]` in pixels squared
    pub moments: Quadrupole,
}

/// PSF kernel represented as a normalized mixture of centered elliptical Gaussians
///
/// Convolving a Gauss-Hermite basis with this kernel is exact, see [crate::basis].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PsfModel {
    components: Vec<PsfComponent>,
}

impl PsfModel {
    /// Create a PSF from unnormalized components, weights are rescaled to sum to one
    pub fn new(components: Vec<PsfComponent>) -> Result<Self, FitError> {
        if components.is_empty() {
            return Err(FitError::invalid_domain("PSF must have at least one component"));
        }
        let total: f64 = components.iter().map(|c| c.weight).sum();
        for c in &components {
            if !(c.weight > 0.0 && c.weight.is_finite()) {
                return Err(FitError::invalid_domain(
                    "PSF component weights must be positive and finite",
                ));
            }
            let [xx, yy, _] = c.moments;
            if !(xx >= 0.0 && yy >= 0.0 && quadrupole_det(c.moments) >= 0.0) {
                return Err(FitError::invalid_domain(
                    "PSF component moments must be positive semi-definite",
                ));
            }
        }
        Ok(Self {
            components: components
                .into_iter()
                .map(|c| PsfComponent {
                    weight: c.weight / total,
                    moments: c.moments,
                })
                .collect(),
        })
    }

    pub fn circular_gaussian(sigma: f64) -> Self {
        assert!(sigma > 0.0, "sigma must be positive");
        Self {
            components: vec![PsfComponent {
                weight: 1.0,
                moments: EllipseCore::circle(sigma).quadrupole(),
            }],
        }
    }

    /// Core plus wings, a common approximation of seeing-limited PSFs
    pub fn double_gaussian(sigma_core: f64, sigma_wings: f64, wings_fraction: f64) -> Self {
        assert!(
            sigma_core > 0.0 && sigma_wings > 0.0,
            "sigmas must be positive"
        );
        assert!(
            wings_fraction > 0.0 && wings_fraction < 1.0,
            "wings_fraction must be in (0, 1)"
        );
        Self::new(vec![
            PsfComponent {
                weight: 1.0 - wings_fraction,
                moments: EllipseCore::circle(sigma_core).quadrupole(),
            },
            PsfComponent {
                weight: wings_fraction,
                moments: EllipseCore::circle(sigma_wings).quadrupole(),
            },
        ])
        .expect("components are valid")
    }

    /// A delta-function PSF, i.e. no convolution
    pub fn delta() -> Self {
        Self {
            components: vec![PsfComponent {
                weight: 1.0,
                moments: [0.0; 3],
            }],
        }
    }

    pub fn components(&self) -> &[PsfComponent] {
        &self.components
    }

    /// Flux-weighted second moments of the whole PSF
    pub fn moments(&self) -> Quadrupole {
        self.components.iter().fold([0.0; 3], |acc, c| {
            [
                acc[0] + c.weight * c.moments[0],
                acc[1] + c.weight * c.moments[1],
                acc[2] + c.weight * c.moments[2],
            ]
        })
    }
}
