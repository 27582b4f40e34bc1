//! Error types for the fitting core.

use thiserror::Error;
use trackfit_env::EnvError;

/// Failures of a single fit attempt.
///
/// None of these is fatal to the process: the factory handles all of them
/// inside its iteration loop and at worst drops the seed.
#[derive(Debug, Clone, Error)]
pub enum FitError {
    /// DOCA or path length could not be computed for one hit; the hit is dropped
    #[error("Geometry error: {0}")]
    Geometry(String),

    /// Covariance not positive definite, or a singular inversion
    #[error("Divergent fit: {0}")]
    DivergentFit(String),

    /// The reference trajectory could not be built to the required extent
    #[error("Propagation failure: {0}")]
    Propagation(String),

    /// Iteration cap reached without meeting the convergence criterion
    #[error("No convergence after {iterations} iterations")]
    ConvergenceFailure { iterations: u32 },

    /// Not enough measurements left for a fit with positive ndof
    #[error("Insufficient hits: {0} measurement dimensions")]
    InsufficientHits(usize),
}

impl FitError {
    /// Creates a divergence error.
    pub fn divergent(msg: impl Into<String>) -> Self {
        Self::DivergentFit(msg.into())
    }

    /// Creates a propagation error.
    pub fn propagation(msg: impl Into<String>) -> Self {
        Self::Propagation(msg.into())
    }
}

impl From<EnvError> for FitError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::DegenerateGeometry(msg) => FitError::Geometry(msg),
            EnvError::PropagationFailed(msg) => FitError::Propagation(msg),
            other => FitError::Propagation(other.to_string()),
        }
    }
}

/// Malformed configuration detected at startup.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Missing calibration constant: {0}")]
    Missing(String),

    #[error("Invalid configuration value {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<EnvError> for ConfigError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::MissingConstant(key) => ConfigError::Missing(key),
            EnvError::InvalidConstant { key, reason } => ConfigError::Invalid { key, reason },
            other => ConfigError::invalid("calibration", other.to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_errors_are_classified() {
        let geom: FitError = EnvError::degenerate("parallel").into();
        assert!(matches!(geom, FitError::Geometry(_)));

        let prop: FitError = EnvError::propagation("looper").into();
        assert!(matches!(prop, FitError::Propagation(_)));

        let missing: ConfigError = EnvError::missing("CDC:DRIFT_TABLE").into();
        assert!(matches!(missing, ConfigError::Missing(ref k) if k == "CDC:DRIFT_TABLE"));
    }
}
