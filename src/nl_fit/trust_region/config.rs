use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Method used to solve the trust-region sub-problem
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SubproblemMethod {
    /// Powell's dogleg between the Cauchy point and the Gauss-Newton step
    #[default]
    Dogleg,
    /// Conjugate gradients on the normal equations, truncated at the trust-region boundary
    SteihaugCg,
}

/// Trust-region solver settings
///
/// Every field has a `default_*` associated function, missing fields take these values when
/// deserialized.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TrustRegionConfig {
    /// Maximum number of sub-problem solves, accepted or not
    pub max_iterations: usize,
    /// Convergence when the gradient infinity norm drops below this value
    pub gradient_tolerance: f64,
    /// Convergence when `|step| <= step_tolerance * (|x| + step_tolerance)`
    pub step_tolerance: f64,
    /// Convergence when the relative objective decrease, actual or predicted, drops below this
    pub objective_tolerance: f64,
    /// Fixed initial radius, overrides `initial_radius_factor`
    pub initial_radius: Option<f64>,
    /// Initial radius is `initial_radius_factor * max(|x0|, 1)`
    pub initial_radius_factor: f64,
    pub min_radius: f64,
    pub max_radius: f64,
    /// Steps with `rho` above this value are accepted
    pub acceptance_threshold: f64,
    /// Radius shrinks when `rho` is below this value
    pub shrink_threshold: f64,
    pub shrink_factor: f64,
    /// Radius grows when `rho` is above this value and the step reached the boundary
    pub grow_threshold: f64,
    pub grow_factor: f64,
    pub subproblem: SubproblemMethod,
    /// Log every iteration at debug level instead of trace
    pub log_iterations: bool,
}

impl TrustRegionConfig {
    #[inline]
    pub fn default_max_iterations() -> usize {
        200
    }

    #[inline]
    pub fn default_gradient_tolerance() -> f64 {
        1e-8
    }

    #[inline]
    pub fn default_step_tolerance() -> f64 {
        1e-8
    }

    #[inline]
    pub fn default_objective_tolerance() -> f64 {
        1e-10
    }

    #[inline]
    pub fn default_initial_radius() -> Option<f64> {
        None
    }

    #[inline]
    pub fn default_initial_radius_factor() -> f64 {
        1.0
    }

    #[inline]
    pub fn default_min_radius() -> f64 {
        1e-12
    }

    #[inline]
    pub fn default_max_radius() -> f64 {
        1e10
    }

    #[inline]
    pub fn default_acceptance_threshold() -> f64 {
        1e-4
    }

    #[inline]
    pub fn default_shrink_threshold() -> f64 {
        0.25
    }

    #[inline]
    pub fn default_shrink_factor() -> f64 {
        0.25
    }

    #[inline]
    pub fn default_grow_threshold() -> f64 {
        0.75
    }

    #[inline]
    pub fn default_grow_factor() -> f64 {
        2.0
    }

    #[inline]
    pub fn default_subproblem() -> SubproblemMethod {
        SubproblemMethod::default()
    }

    #[inline]
    pub fn default_log_iterations() -> bool {
        false
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_subproblem(mut self, subproblem: SubproblemMethod) -> Self {
        self.subproblem = subproblem;
        self
    }

    pub fn with_initial_radius(mut self, initial_radius: f64) -> Self {
        assert!(initial_radius > 0.0, "initial_radius must be positive");
        self.initial_radius = Some(initial_radius);
        self
    }

    pub fn with_log_iterations(mut self, log_iterations: bool) -> Self {
        self.log_iterations = log_iterations;
        self
    }

    /// Panics if the settings are inconsistent
    pub fn validate(&self) {
        assert!(self.gradient_tolerance >= 0.0, "gradient_tolerance must be non-negative");
        assert!(self.step_tolerance >= 0.0, "step_tolerance must be non-negative");
        assert!(self.objective_tolerance >= 0.0, "objective_tolerance must be non-negative");
        assert!(self.initial_radius_factor > 0.0, "initial_radius_factor must be positive");
        assert!(
            0.0 < self.min_radius && self.min_radius <= self.max_radius,
            "radius limits must satisfy 0 < min_radius <= max_radius"
        );
        assert!(
            0.0 <= self.acceptance_threshold && self.acceptance_threshold < self.grow_threshold,
            "acceptance_threshold must be in [0, grow_threshold)"
        );
        assert!(
            self.shrink_threshold < self.grow_threshold,
            "shrink_threshold must be below grow_threshold"
        );
        assert!(
            0.0 < self.shrink_factor && self.shrink_factor < 1.0,
            "shrink_factor must be in (0, 1)"
        );
        assert!(self.grow_factor > 1.0, "grow_factor must exceed one");
    }
}

impl Default for TrustRegionConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
            gradient_tolerance: Self::default_gradient_tolerance(),
            step_tolerance: Self::default_step_tolerance(),
            objective_tolerance: Self::default_objective_tolerance(),
            initial_radius: Self::default_initial_radius(),
            initial_radius_factor: Self::default_initial_radius_factor(),
            min_radius: Self::default_min_radius(),
            max_radius: Self::default_max_radius(),
            acceptance_threshold: Self::default_acceptance_threshold(),
            shrink_threshold: Self::default_shrink_threshold(),
            shrink_factor: Self::default_shrink_factor(),
            grow_threshold: Self::default_grow_threshold(),
            grow_factor: Self::default_grow_factor(),
            subproblem: Self::default_subproblem(),
            log_iterations: Self::default_log_iterations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrustRegionConfig::default().validate();
    }

    #[test]
    fn partial_deserialization() {
        let config: TrustRegionConfig =
            serde_json::from_str(r#"{"max_iterations": 5, "subproblem": "SteihaugCg"}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.subproblem, SubproblemMethod::SteihaugCg);
        assert_eq!(config.shrink_factor, TrustRegionConfig::default_shrink_factor());
    }

    #[test]
    #[should_panic]
    fn invalid_radius_limits() {
        TrustRegionConfig {
            min_radius: 1.0,
            max_radius: 0.5,
            ..Default::default()
        }
        .validate();
    }
}
