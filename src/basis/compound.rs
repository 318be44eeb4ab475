use crate::basis::{BasisEvaluation, BasisTrait, n_terms, render_components, term_index};
use crate::data::PixelData;
use crate::error::FitError;
use crate::psf::PsfModel;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Gauss-Hermite expansion sharing the source ellipse, scaled by `scale`
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BasisComponent {
    /// Maximum total order `p + q` of the expansion
    pub order: usize,
    /// Component radius relative to the source radius
    pub scale: f64,
    /// Fraction of the initial flux guess put into this component
    pub weight: f64,
}

impl BasisComponent {
    pub fn new(order: usize, scale: f64, weight: f64) -> Self {
        Self {
            order,
            scale,
            weight,
        }
    }
}

/// Ordered concatenation of [BasisComponent]s, e.g. a multi-Gaussian approximation of a Sersic
/// profile
///
/// The amplitudes of each component follow the previous component's, and its zeroth-order
/// amplitude is its flux.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(into = "CompoundBasisParameters", try_from = "CompoundBasisParameters")]
pub struct CompoundBasis {
    components: Vec<BasisComponent>,
    size: usize,
}

impl CompoundBasis {
    pub fn new(components: Vec<BasisComponent>) -> Result<Self, FitError> {
        if components.is_empty() {
            return Err(FitError::invalid_domain(
                "compound basis must have at least one component",
            ));
        }
        for c in &components {
            if !(c.scale > 0.0 && c.scale.is_finite()) {
                return Err(FitError::invalid_domain(
                    "basis component scale must be positive and finite",
                ));
            }
            if !(c.weight >= 0.0 && c.weight.is_finite()) {
                return Err(FitError::invalid_domain(
                    "basis component weight must be non-negative and finite",
                ));
            }
        }
        let size = components.iter().map(|c| n_terms(c.order)).sum();
        Ok(Self { components, size })
    }

    pub fn components(&self) -> &[BasisComponent] {
        &self.components
    }
}

impl BasisTrait for CompoundBasis {
    fn size(&self) -> usize {
        self.size
    }

    fn flux_terms(&self) -> Vec<(usize, f64)> {
        let total: f64 = self.components.iter().map(|c| c.weight).sum();
        let n = self.components.len() as f64;
        let mut offset = 0;
        self.components
            .iter()
            .map(|c| {
                let index = offset + term_index(0, 0);
                offset += n_terms(c.order);
                let fraction = if total > 0.0 { c.weight / total } else { n.recip() };
                (index, fraction)
            })
            .collect()
    }

    fn evaluate(
        &self,
        pixels: &PixelData,
        nonlinear: &[f64],
        psf: &PsfModel,
    ) -> Result<BasisEvaluation, FitError> {
        render_components(pixels, nonlinear, psf, &self.components)
    }
}

impl JsonSchema for CompoundBasis {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        CompoundBasisParameters::schema_name()
    }

    fn json_schema(r#gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        CompoundBasisParameters::json_schema(r#gen)
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "CompoundBasis")]
struct CompoundBasisParameters {
    components: Vec<BasisComponent>,
}

impl From<CompoundBasis> for CompoundBasisParameters {
    fn from(value: CompoundBasis) -> Self {
        Self {
            components: value.components,
        }
    }
}

impl TryFrom<CompoundBasisParameters> for CompoundBasis {
    type Error = FitError;

    fn try_from(value: CompoundBasisParameters) -> Result<Self, Self::Error> {
        Self::new(value.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::basis::Basis;

    use approx::assert_relative_eq;

    fn two_gaussians() -> CompoundBasis {
        CompoundBasis::new(vec![
            BasisComponent::new(0, 0.5, 3.0),
            BasisComponent::new(1, 2.0, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn layout() {
        let basis = two_gaussians();
        assert_eq!(basis.size(), 4);
        let flux_terms = basis.flux_terms();
        assert_eq!(flux_terms.len(), 2);
        assert_eq!(flux_terms[0].0, 0);
        assert_eq!(flux_terms[1].0, 1);
        assert_relative_eq!(flux_terms[0].1, 0.75);
        assert_relative_eq!(flux_terms[1].1, 0.25);
    }

    #[test]
    fn invalid_components() {
        assert!(matches!(
            CompoundBasis::new(vec![]),
            Err(FitError::InvalidDomain(_))
        ));
        assert!(matches!(
            CompoundBasis::new(vec![BasisComponent::new(0, 0.0, 1.0)]),
            Err(FitError::InvalidDomain(_))
        ));
        assert!(matches!(
            CompoundBasis::new(vec![BasisComponent::new(0, 1.0, f64::NAN)]),
            Err(FitError::InvalidDomain(_))
        ));
    }

    #[test]
    fn serialization() {
        let basis: Basis = two_gaussians().into();
        let json = serde_json::to_string(&basis).unwrap();
        let restored: Basis = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, basis);
        let empty = r#"{"Compound":{"components":[]}}"#;
        assert!(serde_json::from_str::<Basis>(empty).is_err());
    }
}
