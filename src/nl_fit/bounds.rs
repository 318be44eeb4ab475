use crate::basis::N_NONLINEAR;
use crate::error::FitError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub(super) fn within_bounds(x: &[f64], lower: &[f64], upper: &[f64]) -> bool {
    x.iter()
        .zip(lower.iter().zip(upper.iter()))
        .all(|(x, (lower, upper))| x >= lower && x <= upper)
}

/// Box constraints on the nonlinear parameters `[x, y, eta1, eta2, radius]`
///
/// Amplitudes are always unbounded. Trial points of the solver are projected onto the box.
/// Infinite limits serialize as `null`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(into = "ParameterBoundsParameters", try_from = "ParameterBoundsParameters")]
pub struct ParameterBounds {
    pub lower: [f64; N_NONLINEAR],
    pub upper: [f64; N_NONLINEAR],
}

impl ParameterBounds {
    pub fn new(lower: [f64; N_NONLINEAR], upper: [f64; N_NONLINEAR]) -> Self {
        for (l, u) in lower.iter().zip(upper.iter()) {
            assert!(!l.is_nan() && !u.is_nan(), "bounds must not be NaN");
            assert!(l <= u, "lower bound must not exceed upper bound");
        }
        Self { lower, upper }
    }

    pub fn unbounded() -> Self {
        Self::new([f64::NEG_INFINITY; N_NONLINEAR], [f64::INFINITY; N_NONLINEAR])
    }

    #[inline]
    pub fn default_lower() -> [f64; N_NONLINEAR] {
        [
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
            0.0,
        ]
    }

    #[inline]
    pub fn default_upper() -> [f64; N_NONLINEAR] {
        [f64::INFINITY; N_NONLINEAR]
    }

    /// Bounds of the full parameter vector with `n_amplitudes` unbounded amplitudes appended
    pub fn expand(&self, n_amplitudes: usize) -> (Vec<f64>, Vec<f64>) {
        let lower = self
            .lower
            .iter()
            .copied()
            .chain(std::iter::repeat_n(f64::NEG_INFINITY, n_amplitudes))
            .collect();
        let upper = self
            .upper
            .iter()
            .copied()
            .chain(std::iter::repeat_n(f64::INFINITY, n_amplitudes))
            .collect();
        (lower, upper)
    }

    pub fn contains(&self, params: &[f64]) -> bool {
        let n = params.len().min(N_NONLINEAR);
        within_bounds(&params[..n], &self.lower[..n], &self.upper[..n])
    }

    /// Clamp the nonlinear part of a parameter vector onto the box in place
    pub fn project(&self, params: &mut [f64]) {
        for ((x, &lower), &upper) in params.iter_mut().zip(&self.lower).zip(&self.upper) {
            *x = x.clamp(lower, upper);
        }
    }

    pub(crate) fn check(&self, params: &[f64]) -> Result<(), FitError> {
        if self.contains(params) {
            Ok(())
        } else {
            Err(FitError::invalid_domain(
                "initial parameters are outside of the bounds",
            ))
        }
    }
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self::new(Self::default_lower(), Self::default_upper())
    }
}

impl JsonSchema for ParameterBounds {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        ParameterBoundsParameters::schema_name()
    }

    fn json_schema(r#gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        ParameterBoundsParameters::json_schema(r#gen)
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename = "ParameterBounds")]
struct ParameterBoundsParameters {
    lower: [Option<f64>; N_NONLINEAR],
    upper: [Option<f64>; N_NONLINEAR],
}

impl From<ParameterBounds> for ParameterBoundsParameters {
    fn from(value: ParameterBounds) -> Self {
        let finite = |x: f64| x.is_finite().then_some(x);
        Self {
            lower: value.lower.map(finite),
            upper: value.upper.map(finite),
        }
    }
}

impl TryFrom<ParameterBoundsParameters> for ParameterBounds {
    type Error = &'static str;

    fn try_from(value: ParameterBoundsParameters) -> Result<Self, Self::Error> {
        let lower = value.lower.map(|x| x.unwrap_or(f64::NEG_INFINITY));
        let upper = value.upper.map(|x| x.unwrap_or(f64::INFINITY));
        if lower.iter().zip(upper.iter()).any(|(l, u)| l.is_nan() || u.is_nan() || l > u) {
            return Err("lower bound must not exceed upper bound");
        }
        Ok(Self { lower, upper })
    }
}
