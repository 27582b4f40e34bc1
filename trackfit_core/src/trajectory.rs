//! Reference-trajectory builder.
//!
//! Steps a seed state through the detector with the propagation service,
//! placing a point every `trajectory_step` cm and one exactly at each hit.
//! The Kalman filter then runs over the points in order.

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use tracing::trace;
use trackfit_env::{
    CdcHit, EnvError, EnvResult, FdcHit, LineApproach, Propagator, StateJacobian, StateVector,
    WireApproach, WireDistance, WireLine,
};

use crate::config::FitConfig;
use crate::error::FitError;

// ============================================================================
// STRAIGHT-LINE PROPAGATOR
// ============================================================================

/// Field-free propagation: `x += tx dz`, `y += ty dz`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightLinePropagator {
    pub z_min: f64,
    pub z_max: f64,
}

impl StraightLinePropagator {
    pub fn new(config: &FitConfig) -> Self {
        Self {
            z_min: config.z_min,
            z_max: config.z_max,
        }
    }

    /// Jacobian of a straight-line step of `dz`.
    pub fn jacobian(dz: f64) -> StateJacobian {
        let mut j = Matrix4::identity();
        j[(0, 2)] = dz;
        j[(1, 3)] = dz;
        j
    }
}

impl Default for StraightLinePropagator {
    fn default() -> Self {
        Self::new(&FitConfig::default())
    }
}

impl Propagator for StraightLinePropagator {
    fn propagate(
        &self,
        state: &StateVector,
        from_z: f64,
        to_z: f64,
    ) -> EnvResult<(StateVector, StateJacobian)> {
        if !to_z.is_finite() || to_z < self.z_min || to_z > self.z_max {
            return Err(EnvError::propagation(format!(
                "z = {} outside [{}, {}]",
                to_z, self.z_min, self.z_max
            )));
        }
        if !from_z.is_finite() || state.iter().any(|v| !v.is_finite()) {
            return Err(EnvError::propagation("non-finite input state"));
        }

        let j = Self::jacobian(to_z - from_z);
        Ok((j * state, j))
    }
}

// ============================================================================
// TRAJECTORY
// ============================================================================

/// Ordering of trajectory points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    /// z increasing (FDC and combined seeds)
    Forward,
    /// Signed path length; `dz_sign` is -1 for tracks moving towards lower z
    PathLength { dz_sign: f64 },
}

impl Direction {
    /// +1 or -1.
    pub fn dz_sign(&self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::PathLength { dz_sign } if *dz_sign < 0.0 => -1.0,
            Direction::PathLength { .. } => 1.0,
        }
    }
}

/// Hit attached to a trajectory point, by index into the fitted hit slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitTag {
    Cdc(usize),
    Fdc(usize),
}

/// Which state estimate distance queries use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryEstimate {
    Reference,
    Filtered,
    Smoothed,
}

/// One point of the reference trajectory and the fit quantities attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub z: f64,

    /// Signed path length from the seed origin (cm)
    pub s: f64,

    /// Time at this point (ns)
    pub t: f64,

    /// Reference state
    pub state: StateVector,

    /// Jacobian from the previous point (identity at the first point)
    pub jacobian: StateJacobian,

    pub predicted: StateVector,
    pub predicted_cov: Matrix4<f64>,

    /// Filtered estimate (Skk, Ckk)
    pub filtered: StateVector,
    pub filtered_cov: Matrix4<f64>,

    pub smoothed: StateVector,
    pub smoothed_cov: Matrix4<f64>,

    pub hit: Option<HitTag>,

    /// Whether the filter used the hit at this point
    pub used: bool,
}

impl TrajectoryPoint {
    fn new(z: f64, s: f64, t: f64, state: StateVector, jacobian: StateJacobian) -> Self {
        Self {
            z,
            s,
            t,
            state,
            jacobian,
            predicted: state,
            predicted_cov: Matrix4::zeros(),
            filtered: state,
            filtered_cov: Matrix4::zeros(),
            smoothed: state,
            smoothed_cov: Matrix4::zeros(),
            hit: None,
            used: false,
        }
    }
}

/// A built reference trajectory.
#[derive(Debug, Clone)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
    direction: Direction,
    origin_z: f64,
    t0: f64,
    mass: f64,
    momentum: f64,
    dropped_cdc: Vec<usize>,
    estimate: TrajectoryEstimate,
}

impl Trajectory {
    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [TrajectoryPoint] {
        &mut self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn dz_sign(&self) -> f64 {
        self.direction.dz_sign()
    }

    pub fn origin_z(&self) -> f64 {
        self.origin_z
    }

    /// CDC hits (by index) that could not be anchored on the seed line.
    pub fn dropped_cdc(&self) -> &[usize] {
        &self.dropped_cdc
    }

    pub fn estimate(&self) -> TrajectoryEstimate {
        self.estimate
    }

    /// Selects which estimate distance queries are made against.
    pub fn set_estimate(&mut self, estimate: TrajectoryEstimate) {
        self.estimate = estimate;
    }

    /// State at point `i` under the current estimate.
    pub fn state_at(&self, i: usize) -> &StateVector {
        let point = &self.points[i];
        match self.estimate {
            TrajectoryEstimate::Reference => &point.state,
            TrajectoryEstimate::Filtered => &point.filtered,
            TrajectoryEstimate::Smoothed => &point.smoothed,
        }
    }

    /// Hands the point buffer back for reuse.
    pub fn into_points(self) -> Vec<TrajectoryPoint> {
        self.points
    }

    fn approach_from(&self, i: usize, wire: &WireLine) -> EnvResult<LineApproach> {
        let state = self.state_at(i);
        let point = Vector3::new(state[0], state[1], self.points[i].z);
        let dir = Vector3::new(state[2], state[3], 1.0);
        wire.closest_approach(&point, &dir)
    }
}

impl WireDistance for Trajectory {
    fn distance_to_wire(&self, wire: &WireLine) -> EnvResult<WireApproach> {
        if self.points.is_empty() {
            return Err(EnvError::degenerate("empty trajectory"));
        }

        // Find the point nearest the approach, then recompute from there
        let first = self.approach_from(0, wire)?;
        let z_close = self.points[0].z + first.track_param;
        let nearest = self
            .points
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (a.z - z_close).abs().total_cmp(&(b.z - z_close).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let approach = if nearest == 0 {
            first
        } else {
            self.approach_from(nearest, wire)?
        };

        let state = self.state_at(nearest);
        let norm = (1.0 + state[2] * state[2] + state[3] * state[3]).sqrt();
        Ok(WireApproach {
            doca: approach.doca(),
            s: self.points[nearest].s + self.dz_sign() * approach.track_param * norm,
            along_wire: approach.wire_param,
        })
    }

    fn momentum(&self) -> f64 {
        self.momentum
    }

    fn mass(&self) -> f64 {
        self.mass
    }

    fn start_time(&self) -> f64 {
        self.t0
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Starting point of a trajectory build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySeed {
    /// State at `z`
    pub state: StateVector,
    pub z: f64,

    /// z at which path length and time are zero and `t0`
    pub origin_z: f64,
    pub t0: f64,
    pub direction: Direction,
}

/// Builds reference trajectories through a set of hits.
pub struct TrajectoryBuilder<'a> {
    propagator: &'a dyn Propagator,
    step: f64,
    max_points: usize,
    mass: f64,
    momentum: f64,
    speed_of_light: f64,
}

impl<'a> TrajectoryBuilder<'a> {
    pub fn new(propagator: &'a dyn Propagator, config: &FitConfig) -> Self {
        Self {
            propagator,
            step: config.trajectory_step,
            max_points: config.max_trajectory_points,
            mass: config.mass,
            momentum: config.assumed_momentum,
            speed_of_light: config.selector.speed_of_light,
        }
    }

    /// Builds a trajectory into a fresh buffer.
    pub fn build(
        &self,
        seed: &TrajectorySeed,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<Trajectory, FitError> {
        self.build_into(Vec::new(), seed, cdc_hits, fdc_hits)
    }

    /// Builds a trajectory, reusing `buffer` for its points.
    pub fn build_into(
        &self,
        mut buffer: Vec<TrajectoryPoint>,
        seed: &TrajectorySeed,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<Trajectory, FitError> {
        buffer.clear();
        let dz_sign = seed.direction.dz_sign();

        let (mut anchors, dropped_cdc) = self.anchors(seed, cdc_hits, fdc_hits);
        if anchors.is_empty() {
            return Err(FitError::InsufficientHits(0));
        }
        if anchors.iter().any(|(z, _)| !z.is_finite()) {
            return Err(FitError::propagation("non-finite hit position"));
        }
        anchors.sort_by(|a, b| (dz_sign * a.0).total_cmp(&(dz_sign * b.0)));

        let first_z = anchors[0].0;
        let last_z = anchors[anchors.len() - 1].0;
        let expected = (dz_sign * (last_z - first_z) / self.step).ceil() as usize + anchors.len();
        if expected > self.max_points {
            return Err(FitError::propagation(format!(
                "trajectory needs {} points, limit is {}",
                expected, self.max_points
            )));
        }

        let beta_c = self.beta() * self.speed_of_light;
        let (mut state, _) = self.propagator.propagate(&seed.state, seed.z, first_z)?;
        let mut z = first_z;
        buffer.push(self.point(seed, z, state, Matrix4::identity(), beta_c)?);
        buffer[0].hit = Some(anchors[0].1);

        for &(target, tag) in &anchors[1..] {
            while dz_sign * (target - z) > self.step {
                let next = z + dz_sign * self.step;
                let (next_state, jacobian) = self.propagator.propagate(&state, z, next)?;
                state = next_state;
                z = next;
                buffer.push(self.point(seed, z, state, jacobian, beta_c)?);
                self.check_size(buffer.len())?;
            }

            let (next_state, jacobian) = self.propagator.propagate(&state, z, target)?;
            state = next_state;
            z = target;
            let mut point = self.point(seed, z, state, jacobian, beta_c)?;
            point.hit = Some(tag);
            buffer.push(point);
            self.check_size(buffer.len())?;
        }

        Ok(Trajectory {
            points: buffer,
            direction: seed.direction,
            origin_z: seed.origin_z,
            t0: seed.t0,
            mass: self.mass,
            momentum: self.momentum,
            dropped_cdc,
            estimate: TrajectoryEstimate::Reference,
        })
    }

    /// z of every hit: FDC hits at their plane, CDC hits at the seed line's
    /// closest approach to the wire.
    fn anchors(
        &self,
        seed: &TrajectorySeed,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> (Vec<(f64, HitTag)>, Vec<usize>) {
        let mut anchors = Vec::with_capacity(cdc_hits.len() + fdc_hits.len());
        let mut dropped = Vec::new();

        anchors.extend(
            fdc_hits
                .iter()
                .enumerate()
                .map(|(j, hit)| (hit.wire.z, HitTag::Fdc(j))),
        );

        let point = Vector3::new(seed.state[0], seed.state[1], seed.z);
        let dir = Vector3::new(seed.state[2], seed.state[3], 1.0);
        for (i, hit) in cdc_hits.iter().enumerate() {
            match hit.wire.line().closest_approach(&point, &dir) {
                Ok(approach) => anchors.push((seed.z + approach.track_param, HitTag::Cdc(i))),
                Err(e) => {
                    trace!(ring = hit.wire.ring, straw = hit.wire.straw, "no anchor: {}", e);
                    dropped.push(i);
                }
            }
        }

        (anchors, dropped)
    }

    fn point(
        &self,
        seed: &TrajectorySeed,
        z: f64,
        state: StateVector,
        jacobian: StateJacobian,
        beta_c: f64,
    ) -> Result<TrajectoryPoint, FitError> {
        if state.iter().any(|v| !v.is_finite()) {
            return Err(FitError::propagation(format!("non-finite state at z = {}", z)));
        }
        let norm = (1.0 + state[2] * state[2] + state[3] * state[3]).sqrt();
        let s = seed.direction.dz_sign() * (z - seed.origin_z) * norm;
        let t = seed.t0 + s / beta_c;
        Ok(TrajectoryPoint::new(z, s, t, state, jacobian))
    }

    fn check_size(&self, len: usize) -> Result<(), FitError> {
        if len > self.max_points {
            return Err(FitError::propagation(format!(
                "trajectory exceeded {} points",
                self.max_points
            )));
        }
        Ok(())
    }

    fn beta(&self) -> f64 {
        if self.momentum <= 0.0 {
            return 1.0;
        }
        1.0 / (1.0 + (self.mass * self.mass) / (self.momentum * self.momentum)).sqrt()
    }
}

// ============================================================================
// TESTS
// ============================================================================
