//! The fitted track candidate and its Cartesian representation.

use nalgebra::{Matrix4, SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use trackfit_env::{CdcHit, FdcHit, StateVector};

use crate::kalman::{CdcUpdate, FdcUpdate};

/// 7×7 covariance of `(px, py, pz, x, y, z, t)`.
pub type CartesianCovariance = SMatrix<f64, 7, 7>;

/// Which detectors a seed's hits come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitMode {
    CdcOnly,
    FdcOnly,
    Combined,
}

impl FitMode {
    pub fn name(&self) -> &'static str {
        match self {
            FitMode::CdcOnly => "cdc-only",
            FitMode::FdcOnly => "fdc-only",
            FitMode::Combined => "combined",
        }
    }
}

/// Output of a successful fit. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCandidate {
    pub mode: FitMode,

    /// Accepted hits, in input order
    pub cdc_hits: Vec<CdcHit>,
    pub fdc_hits: Vec<FdcHit>,

    /// Reference z of `state` (cm)
    pub z: f64,

    /// Time at the reference point (ns)
    pub t0: f64,

    pub state: StateVector,
    pub covariance: Matrix4<f64>,

    pub position: Vector3<f64>,
    pub momentum: Vector3<f64>,
    pub error_matrix: CartesianCovariance,

    pub chi2: f64,
    pub ndof: usize,
    pub fit_probability: f64,
    pub converged: bool,
    pub iterations: u32,

    /// Smoothed residuals and pulls
    pub cdc_updates: Vec<CdcUpdate>,
    pub fdc_updates: Vec<FdcUpdate>,
}

impl TrackCandidate {
    pub fn chi2_per_ndof(&self) -> f64 {
        if self.ndof == 0 {
            return f64::INFINITY;
        }
        self.chi2 / self.ndof as f64
    }

    pub fn num_hits(&self) -> usize {
        self.cdc_hits.len() + self.fdc_hits.len()
    }
}

/// Momentum vector of a straight line with slopes `(tx, ty)` and magnitude `p`,
/// pointing towards increasing z when `dz_sign` is positive.
pub fn cartesian_momentum(state: &StateVector, p: f64, dz_sign: f64) -> Vector3<f64> {
    let (tx, ty) = (state[2], state[3]);
    let f = 1.0 / (1.0 + tx * tx + ty * ty).sqrt();
    Vector3::new(tx, ty, 1.0) * (dz_sign * p * f)
}

/// Propagates the 4×4 state covariance to the 7×7 Cartesian error matrix
/// with `J C Jᵀ`. z and t are fixed by the reference surface and carry no error.
pub fn cartesian_error_matrix(
    cov: &Matrix4<f64>,
    state: &StateVector,
    p: f64,
    dz_sign: f64,
) -> CartesianCovariance {
    let (tx, ty) = (state[2], state[3]);
    let f = 1.0 / (1.0 + tx * tx + ty * ty).sqrt();
    let f3 = f * f * f;
    let scale = dz_sign * p * f3;

    let mut j = SMatrix::<f64, 7, 4>::zeros();
    j[(0, 2)] = scale * (1.0 + ty * ty);
    j[(0, 3)] = -scale * tx * ty;
    j[(1, 2)] = -scale * tx * ty;
    j[(1, 3)] = scale * (1.0 + tx * tx);
    j[(2, 2)] = -scale * tx;
    j[(2, 3)] = -scale * ty;
    j[(3, 0)] = 1.0;
    j[(4, 1)] = 1.0;

    let m = j * cov * j.transpose();
    (m + m.transpose()) * 0.5
}

// ============================================================================
// TESTS
// ============================================================================
