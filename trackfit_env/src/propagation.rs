//! Trajectory propagation ("swim") service interface.

use crate::error::EnvResult;
use crate::types::{StateJacobian, StateVector};

/// Propagates a track state between two z surfaces.
///
/// Implementations must be deterministic and free of shared mutable state so
/// that independent fits can call them from different threads.
pub trait Propagator: Send + Sync {
    /// Propagates `state` from `from_z` to `to_z`, returning the new state and
    /// the Jacobian `∂S(to_z)/∂S(from_z)`.
    fn propagate(
        &self,
        state: &StateVector,
        from_z: f64,
        to_z: f64,
    ) -> EnvResult<(StateVector, StateJacobian)>;
}
