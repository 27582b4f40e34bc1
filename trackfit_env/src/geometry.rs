//! Wire geometry service and distance-of-closest-approach interfaces.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EnvError, EnvResult};
use crate::types::{CdcWire, FdcWire};

/// Relative threshold on `|t × w|²/(|t|²|w|²)` below which a track and a
/// wire are treated as parallel.
const PARALLEL_TOLERANCE: f64 = 1e-12;

/// An infinite straight line: a point on the wire and a unit direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireLine {
    pub origin: Vector3<f64>,
    pub direction: Vector3<f64>,
}

/// Closest approach between a track line and a wire line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineApproach {
    /// Multiple of the track direction from the track point to the closest point
    pub track_param: f64,

    /// Distance along the (unit) wire direction from the wire origin
    pub wire_param: f64,

    /// Vector from the wire's closest point to the track's closest point
    pub separation: Vector3<f64>,
}

impl LineApproach {
    /// Distance of closest approach.
    pub fn doca(&self) -> f64 {
        self.separation.norm()
    }
}

impl WireLine {
    /// Creates a line; the direction is normalized.
    pub fn new(origin: Vector3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Closest approach of the line `point + λ·dir` to this wire.
    ///
    /// `dir` need not be normalized; `track_param` is expressed in units of it.
    pub fn closest_approach(
        &self,
        point: &Vector3<f64>,
        dir: &Vector3<f64>,
    ) -> EnvResult<LineApproach> {
        let w = point - self.origin;
        let a = dir.dot(dir);
        let b = dir.dot(&self.direction);
        let c = self.direction.dot(&self.direction);
        let d = dir.dot(&w);
        let e = self.direction.dot(&w);

        let denom = a * c - b * b;
        if !denom.is_finite() || denom <= PARALLEL_TOLERANCE * a * c {
            return Err(EnvError::degenerate("track is parallel to wire"));
        }

        let track_param = (b * e - c * d) / denom;
        let wire_param = (a * e - b * d) / denom;
        let separation = (point + dir * track_param) - (self.origin + self.direction * wire_param);

        Ok(LineApproach {
            track_param,
            wire_param,
            separation,
        })
    }
}

/// Result of a trajectory-to-wire query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireApproach {
    /// Distance of closest approach (cm)
    pub doca: f64,

    /// Path length along the trajectory to the closest point (cm)
    pub s: f64,

    /// Position along the wire of the closest point, from the wire origin (cm)
    pub along_wire: f64,
}

/// A trajectory that can be queried for its distance to arbitrary wires.
///
/// Implemented by the reference trajectory of the fitting core; the hit
/// selector only needs this view of it.
pub trait WireDistance {
    /// Distance of closest approach and path length to the given wire.
    fn distance_to_wire(&self, wire: &WireLine) -> EnvResult<WireApproach>;

    /// Total momentum assumed for the track (GeV/c).
    fn momentum(&self) -> f64;

    /// Mass hypothesis (GeV/c²).
    fn mass(&self) -> f64;

    /// Time at path length zero (ns).
    fn start_time(&self) -> f64 {
        0.0
    }
}

/// Read-only wire lookup provided by the detector description.
pub trait WireGeometry: Send + Sync {
    /// Straw for the given ring and straw number.
    fn cdc_wire(&self, ring: u32, straw: u32) -> Option<Arc<CdcWire>>;

    /// Anode wire for the given layer and wire number.
    fn fdc_wire(&self, layer: u32, wire: u32) -> Option<Arc<FdcWire>>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_closest_approach_perpendicular_lines() {
        // Wire along y at x = 2, z = 0; track along z through the origin
        let wire = WireLine::new(Vector3::new(2.0, 5.0, 0.0), Vector3::y());
        let approach = wire
            .closest_approach(&Vector3::new(0.0, 0.0, -10.0), &Vector3::new(0.0, 0.0, 1.0))
            .unwrap();

        assert_relative_eq!(approach.doca(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(approach.track_param, 10.0, epsilon = 1e-12);
        assert_relative_eq!(approach.wire_param, -5.0, epsilon = 1e-12);
        assert_relative_eq!(approach.separation.x, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_closest_approach_skew_lines() {
        let wire = WireLine::new(Vector3::new(1.0, 0.0, 50.0), Vector3::new(0.0, 0.1, 1.0));
        let point = Vector3::new(0.0, 0.0, 0.0);
        let dir = Vector3::new(0.02, 0.01, 1.0);
        let approach = wire.closest_approach(&point, &dir).unwrap();

        // The separation must be perpendicular to both lines
        assert_relative_eq!(approach.separation.dot(&dir), 0.0, epsilon = 1e-9);
        assert_relative_eq!(approach.separation.dot(&wire.direction), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_parallel_lines_are_degenerate() {
        let wire = WireLine::new(Vector3::new(1.0, 0.0, 0.0), Vector3::z());
        let result = wire.closest_approach(&Vector3::zeros(), &Vector3::new(0.0, 0.0, 2.0));
        assert!(matches!(result, Err(EnvError::DegenerateGeometry(_))));
    }
}
