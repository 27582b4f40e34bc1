//! Error types for the TrackFit environment abstraction.

use thiserror::Error;

/// Errors raised by the collaborators the fitting core talks to
/// (calibration store, wire geometry, propagation service).
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// A required calibration constant or table is absent
    #[error("Missing calibration constant: {0}")]
    MissingConstant(String),

    /// A calibration entry exists but cannot be used
    #[error("Invalid calibration constant {key}: {reason}")]
    InvalidConstant { key: String, reason: String },

    /// Distance-of-closest-approach computation is undefined (e.g. track parallel to wire)
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// The swim/propagation service could not reach the requested surface
    #[error("Propagation failed: {0}")]
    PropagationFailed(String),

    /// Calibration payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl EnvError {
    /// Creates a missing-constant error.
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingConstant(key.into())
    }

    /// Creates an invalid-constant error.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConstant {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a degenerate-geometry error.
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }

    /// Creates a propagation error.
    pub fn propagation(msg: impl Into<String>) -> Self {
        Self::PropagationFailed(msg.into())
    }
}

/// Result alias used by the environment traits.
pub type EnvResult<T> = Result<T, EnvError>;
