/// Error returned from basis evaluation, likelihood, prior and solver initialization
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FitError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("trust-region sub-problem is singular even after regularization")]
    SingularSubproblem,

    #[error("non-finite value encountered in the objective or its Jacobian")]
    NumericalOverflow,
}

impl FitError {
    pub(crate) fn invalid_domain(msg: impl Into<String>) -> Self {
        Self::InvalidDomain(msg.into())
    }

    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::DimensionMismatch {
                what,
                expected,
                actual,
            })
        }
    }

    /// Malformed input which must be reported to the caller instead of a terminal fit status
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, Self::InvalidDomain(_) | Self::DimensionMismatch { .. })
    }
}
