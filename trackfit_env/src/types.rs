//! Hit and wire types shared between the host framework and the fitting core.
//!
//! Hits are immutable and owned by the event. Wires are owned by the geometry
//! service and shared with hits through `Arc`, so cloning a hit is cheap.

use nalgebra::{Matrix4, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::geometry::WireLine;

/// Straight-line track parameters `(x, y, tx, ty)` at a reference z.
pub type StateVector = Vector4<f64>;

/// Jacobian of a state propagation between two z surfaces.
pub type StateJacobian = Matrix4<f64>;

// ============================================================================
// CDC (straw tube) wires and hits
// ============================================================================

/// A straw of the cylindrical drift chamber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcWire {
    /// Ring number (1-based, innermost ring is 1)
    pub ring: u32,

    /// Straw number within the ring (1-based)
    pub straw: u32,

    /// Wire position at the centre of the straw (cm)
    pub origin: Vector3<f64>,

    /// Unit vector along the wire
    pub direction: Vector3<f64>,

    /// Active length of the straw (cm)
    pub length: f64,

    /// Stereo angle with respect to the z axis (rad)
    pub stereo: f64,

    /// Gravitational sag at the straw centre (cm)
    pub max_sag: f64,

    /// Azimuthal offset of the sag direction from straight down (rad)
    pub sag_phi_offset: f64,
}

impl CdcWire {
    /// Creates a straw with no sag. The direction is normalized.
    pub fn new(
        ring: u32,
        straw: u32,
        origin: Vector3<f64>,
        direction: Vector3<f64>,
        length: f64,
    ) -> Self {
        let direction = direction.normalize();
        let stereo = direction.z.clamp(-1.0, 1.0).acos();
        Self {
            ring,
            straw,
            origin,
            direction,
            length,
            stereo,
            max_sag: 0.0,
            sag_phi_offset: 0.0,
        }
    }

    /// Attaches a sag model to the straw.
    pub fn with_sag(mut self, max_sag: f64, sag_phi_offset: f64) -> Self {
        self.max_sag = max_sag;
        self.sag_phi_offset = sag_phi_offset;
        self
    }

    /// The wire as an infinite line.
    pub fn line(&self) -> WireLine {
        WireLine::new(self.origin, self.direction)
    }

    /// Wire position at the given z.
    pub fn position_at_z(&self, z: f64) -> Vector3<f64> {
        if self.direction.z.abs() < f64::EPSILON {
            return self.origin;
        }
        self.origin + self.direction * ((z - self.origin.z) / self.direction.z)
    }

    /// Parabolic sag at the given z, zero at both endplates.
    pub fn sag_at(&self, z: f64) -> f64 {
        if self.length <= 0.0 {
            return 0.0;
        }
        let frac = 2.0 * (z - self.origin.z) / self.length;
        (self.max_sag * (1.0 - frac * frac)).max(0.0)
    }

    /// Azimuth in which the wire sags (straight down, rotated by the offset).
    pub fn sag_phi(&self) -> f64 {
        -std::f64::consts::FRAC_PI_2 + self.sag_phi_offset
    }
}

/// A CDC hit after calibration: the wire that fired and its drift time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcHit {
    /// Straw that fired
    pub wire: Arc<CdcWire>,

    /// Drift time relative to the event reference time (ns)
    pub tdrift: f64,

    /// Energy loss (keV/cm), carried through for downstream PID
    pub dedx: f64,
}

impl CdcHit {
    pub fn new(wire: Arc<CdcWire>, tdrift: f64) -> Self {
        Self {
            wire,
            tdrift,
            dedx: 0.0,
        }
    }
}

// ============================================================================
// FDC (planar chamber) wires and pseudo hits
// ============================================================================

/// An anode wire of a planar drift chamber.
///
/// Each plane has its own wire frame: `u` is the coordinate perpendicular to
/// the wires and `v` the coordinate along them, both in the plane.
/// `u = x cos(angle) - y sin(angle)`, `v = x sin(angle) + y cos(angle)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdcWire {
    /// Layer number (1-based, most upstream plane is 1)
    pub layer: u32,

    /// Wire number within the plane (1-based)
    pub wire: u32,

    /// z of the wire plane (cm)
    pub z: f64,

    /// Rotation of the wire frame (rad)
    pub angle: f64,

    /// Perpendicular coordinate of the wire in the plane frame (cm)
    pub u: f64,

    /// Wire length (cm)
    pub length: f64,
}

impl FdcWire {
    pub fn new(layer: u32, wire: u32, z: f64, angle: f64, u: f64, length: f64) -> Self {
        Self {
            layer,
            wire,
            z,
            angle,
            u,
            length,
        }
    }

    /// Unit vector perpendicular to the wire, in the plane.
    pub fn u_axis(&self) -> Vector3<f64> {
        let (sin, cos) = self.angle.sin_cos();
        Vector3::new(cos, -sin, 0.0)
    }

    /// Unit vector along the wire.
    pub fn v_axis(&self) -> Vector3<f64> {
        let (sin, cos) = self.angle.sin_cos();
        Vector3::new(sin, cos, 0.0)
    }

    /// The wire as an infinite line; its origin is the point with `v = 0`.
    pub fn line(&self) -> WireLine {
        let origin = self.u_axis() * self.u + Vector3::new(0.0, 0.0, self.z);
        WireLine::new(origin, self.v_axis())
    }
}

/// A planar-chamber pseudo hit: anode wire, drift time and the along-wire
/// position reconstructed from the cathode strips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdcHit {
    /// Anode wire that fired
    pub wire: Arc<FdcWire>,

    /// Drift time relative to the event reference time (ns)
    pub time: f64,

    /// Along-wire position from the cathodes (cm)
    pub s: f64,

    /// Reconstruction status bits from the pseudo-hit builder
    pub status: u32,
}

impl FdcHit {
    pub fn new(wire: Arc<FdcWire>, time: f64, s: f64) -> Self {
        Self {
            wire,
            time,
            s,
            status: 0,
        }
    }

    /// Hit position in the lab x-y plane, taking the wire position for `u`.
    pub fn xy(&self) -> Vector2<f64> {
        let p = self.wire.u_axis() * self.wire.u + self.wire.v_axis() * self.s;
        Vector2::new(p.x, p.y)
    }

    /// Hit position in the lab frame.
    pub fn position(&self) -> Vector3<f64> {
        let xy = self.xy();
        Vector3::new(xy.x, xy.y, self.wire.z)
    }
}

// ============================================================================
// TESTS
// ============================================================================
