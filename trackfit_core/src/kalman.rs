//! The estimation core: Kalman filter and Rauch-Tung-Striebel smoother over
//! a reference trajectory.
//!
//! Measurements are a tagged union over the two detector types, and a single
//! update routine handles both through the measurement dimension `M`
//! (1 for CDC straws, 2 for FDC pseudo hits).
//!
//! Every covariance update uses the Joseph form, is symmetrized explicitly,
//! and is checked for positive definiteness. A failed check is reported as
//! `FitError::DivergentFit`; the state is never allowed to go NaN.

use nalgebra::{
    Cholesky, Const, Matrix1, Matrix2, Matrix2x4, Matrix4, RowVector4, SMatrix, SVector, Vector1,
    Vector2, Vector3,
};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use trackfit_env::{CdcHit, FdcHit, StateVector, WireDistance};

use crate::config::FitConfig;
use crate::drift::DriftModel;
use crate::error::FitError;
use crate::hit_selector::FitStage;
use crate::trajectory::{HitTag, Trajectory};

/// Lifecycle of one fit iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitPhase {
    Initialized,
    Filtering,
    Smoothing,
    Converged,
    Failed,
}

// ============================================================================
// GENERIC UPDATE
// ============================================================================

/// Result of one measurement update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome<const M: usize> {
    pub state: StateVector,
    pub covariance: Matrix4<f64>,

    /// Kalman gain
    pub gain: SMatrix<f64, 4, M>,

    /// `rᵀ S⁻¹ r` of the predicted residual
    pub chi2: f64,
}

/// Cholesky factor of a matrix that is strictly positive definite.
fn spd_cholesky<const N: usize>(m: SMatrix<f64, N, N>) -> Option<Cholesky<f64, Const<N>>> {
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let chol = m.cholesky()?;
    let l = chol.l();
    (0..N)
        .all(|i| l[(i, i)].is_finite() && l[(i, i)] > 0.0)
        .then_some(chol)
}

/// `(C + Cᵀ) / 2`
pub fn symmetrize(cov: &Matrix4<f64>) -> Matrix4<f64> {
    (cov + cov.transpose()) * 0.5
}

/// Innovation χ² of a measurement against a predicted covariance.
pub fn innovation_chi2<const M: usize>(
    cov: &Matrix4<f64>,
    h: &SMatrix<f64, M, 4>,
    residual: &SVector<f64, M>,
    variance: &SMatrix<f64, M, M>,
) -> Result<f64, FitError> {
    let s = h * cov * h.transpose() + variance;
    let chol = spd_cholesky(s)
        .ok_or_else(|| FitError::divergent("innovation covariance not positive definite"))?;
    Ok((residual.transpose() * chol.inverse() * residual)[(0, 0)])
}

/// Linear Kalman update of `(state, cov)` with an `M`-dimensional measurement.
///
/// `residual` is measurement minus prediction and `variance` the measurement
/// covariance `V`. Zero or negative variances are rejected.
pub fn kalman_update<const M: usize>(
    state: &StateVector,
    cov: &Matrix4<f64>,
    h: &SMatrix<f64, M, 4>,
    residual: &SVector<f64, M>,
    variance: &SMatrix<f64, M, M>,
) -> Result<UpdateOutcome<M>, FitError> {
    if residual.iter().any(|v| !v.is_finite()) || h.iter().any(|v| !v.is_finite()) {
        return Err(FitError::divergent("non-finite residual or projection"));
    }
    if spd_cholesky(*variance).is_none() {
        return Err(FitError::divergent("measurement variance not positive definite"));
    }

    let s = h * cov * h.transpose() + variance;
    let s_chol = spd_cholesky(s)
        .ok_or_else(|| FitError::divergent("innovation covariance not positive definite"))?;
    let s_inv = s_chol.inverse();

    let gain = cov * h.transpose() * s_inv;
    let new_state = state + gain * residual;

    // Joseph form: (I - KH) C (I - KH)ᵀ + K V Kᵀ
    let ikh = Matrix4::identity() - gain * h;
    let new_cov = symmetrize(&(ikh * cov * ikh.transpose() + gain * variance * gain.transpose()));

    if new_state.iter().any(|v| !v.is_finite()) {
        return Err(FitError::divergent("non-finite state after update"));
    }
    if spd_cholesky(new_cov).is_none() {
        return Err(FitError::divergent("updated covariance not positive definite"));
    }

    let chi2 = (residual.transpose() * s_inv * residual)[(0, 0)];
    Ok(UpdateOutcome {
        state: new_state,
        covariance: new_cov,
        gain,
        chi2,
    })
}

// ============================================================================
// MEASUREMENTS
// ============================================================================

/// A CDC straw measurement linearized at a state.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcMeasurement {
    pub hit_index: usize,
    pub h: RowVector4<f64>,

    /// Drift distance minus predicted DOCA
    pub residual: f64,
    pub variance: f64,
    pub doca: f64,
    pub dist: f64,
    pub tdrift: f64,

    /// Wire sag at the point of closest approach
    pub delta: f64,
    pub s: f64,
}

/// An FDC pseudo-hit measurement linearized at a state: anode DOCA and
/// along-wire position.
#[derive(Debug, Clone, PartialEq)]
pub struct FdcMeasurement {
    pub hit_index: usize,
    pub h: Matrix2x4<f64>,
    pub residual: Vector2<f64>,
    pub variance: Matrix2<f64>,
    pub doca: f64,
    pub dist: f64,
    pub tdrift: f64,
    pub s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Cdc(CdcMeasurement),
    Fdc(FdcMeasurement),
}

impl Measurement {
    pub fn dimension(&self) -> usize {
        match self {
            Measurement::Cdc(_) => 1,
            Measurement::Fdc(_) => 2,
        }
    }

    /// Updated state, covariance and χ² increment.
    pub fn update(
        &self,
        state: &StateVector,
        cov: &Matrix4<f64>,
    ) -> Result<(StateVector, Matrix4<f64>, f64), FitError> {
        match self {
            Measurement::Cdc(m) => {
                let out = kalman_update(
                    state,
                    cov,
                    &m.h,
                    &Vector1::new(m.residual),
                    &Matrix1::new(m.variance),
                )?;
                Ok((out.state, out.covariance, out.chi2))
            }
            Measurement::Fdc(m) => {
                let out = kalman_update(state, cov, &m.h, &m.residual, &m.variance)?;
                Ok((out.state, out.covariance, out.chi2))
            }
        }
    }

    pub fn innovation_chi2(&self, cov: &Matrix4<f64>) -> Result<f64, FitError> {
        match self {
            Measurement::Cdc(m) => innovation_chi2(
                cov,
                &m.h,
                &Vector1::new(m.residual),
                &Matrix1::new(m.variance),
            ),
            Measurement::Fdc(m) => innovation_chi2(cov, &m.h, &m.residual, &m.variance),
        }
    }
}

/// Per-track quantities the measurement model needs besides the state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackContext {
    pub dz_sign: f64,
    pub t0: f64,

    /// β c (cm/ns)
    pub beta_c: f64,
}

impl TrackContext {
    pub fn of(trajectory: &Trajectory, speed_of_light: f64) -> Self {
        let p = trajectory.momentum();
        let m = trajectory.mass();
        let beta = if p > 0.0 {
            1.0 / (1.0 + (m * m) / (p * p)).sqrt()
        } else {
            1.0
        };
        Self {
            dz_sign: trajectory.dz_sign(),
            t0: trajectory.start_time(),
            beta_c: beta * speed_of_light,
        }
    }

    fn time_at(&self, s: f64) -> f64 {
        self.t0 + s / self.beta_c
    }
}

/// Builds linearized measurements for trajectory points.
#[derive(Debug, Clone)]
pub struct MeasurementModel {
    drift: DriftModel,
    use_fdc_drift_times: bool,
}

impl MeasurementModel {
    pub fn new(config: &FitConfig) -> Self {
        Self {
            drift: DriftModel::new(config),
            use_fdc_drift_times: config.use_fdc_drift_times,
        }
    }

    pub fn drift(&self) -> &DriftModel {
        &self.drift
    }

    /// Measurement of the hit tagged at a trajectory point at `(z, s)`.
    #[allow(clippy::too_many_arguments)]
    pub fn measure(
        &self,
        stage: FitStage,
        ctx: &TrackContext,
        z: f64,
        s: f64,
        state: &StateVector,
        tag: HitTag,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<Measurement, FitError> {
        match tag {
            HitTag::Cdc(i) => {
                let hit = cdc_hits
                    .get(i)
                    .ok_or_else(|| FitError::Geometry(format!("no CDC hit {}", i)))?;
                Ok(Measurement::Cdc(self.cdc(stage, ctx, z, s, state, hit, i)?))
            }
            HitTag::Fdc(j) => {
                let hit = fdc_hits
                    .get(j)
                    .ok_or_else(|| FitError::Geometry(format!("no FDC hit {}", j)))?;
                Ok(Measurement::Fdc(self.fdc(stage, ctx, z, s, state, hit, j)?))
            }
        }
    }

    /// CDC straw: drift distance against the DOCA of the local straight line.
    #[allow(clippy::too_many_arguments)]
    pub fn cdc(
        &self,
        stage: FitStage,
        ctx: &TrackContext,
        z: f64,
        s: f64,
        state: &StateVector,
        hit: &CdcHit,
        hit_index: usize,
    ) -> Result<CdcMeasurement, FitError> {
        let point = Vector3::new(state[0], state[1], z);
        let dir = Vector3::new(state[2], state[3], 1.0);
        let wire = hit.wire.line();
        let approach = wire.closest_approach(&point, &dir)?;
        let doca = approach.doca();

        // Unit vector from the wire to the track; on the wire, the common normal
        let shat = if doca > 1e-9 {
            approach.separation / doca
        } else {
            dir.cross(&wire.direction).normalize()
        };
        let lambda = approach.track_param;
        let h = RowVector4::new(shat.x, shat.y, lambda * shat.x, lambda * shat.y);
        let s_doca = s + ctx.dz_sign * lambda * dir.norm();

        let (dist, variance, tdrift, delta) = match stage {
            FitStage::TimeBased => {
                let tdrift = hit.tdrift - ctx.time_at(s_doca);
                let z_wire = wire.origin.z + approach.wire_param * wire.direction.z;
                let delta = hit.wire.sag_at(z_wire);
                let dphi = shat.y.atan2(shat.x) - hit.wire.sag_phi();
                (
                    self.drift.cdc_drift_distance_with_sag(dphi, delta, tdrift),
                    self.drift.cdc_drift_variance(tdrift),
                    tdrift,
                    delta,
                )
            }
            FitStage::WireBased | FitStage::Helical => (
                self.drift.cdc_wire_based_distance(),
                self.drift.cdc_wire_based_variance(),
                hit.tdrift,
                0.0,
            ),
        };

        Ok(CdcMeasurement {
            hit_index,
            h,
            residual: dist - doca,
            variance,
            doca,
            dist,
            tdrift,
            delta,
            s: s_doca,
        })
    }

    /// FDC pseudo hit, in the wire frame of its plane.
    #[allow(clippy::too_many_arguments)]
    pub fn fdc(
        &self,
        stage: FitStage,
        ctx: &TrackContext,
        z: f64,
        s: f64,
        state: &StateVector,
        hit: &FdcHit,
        hit_index: usize,
    ) -> Result<FdcMeasurement, FitError> {
        let wire = &hit.wire;
        let (sin, cos) = wire.angle.sin_cos();
        let (tx, ty) = (state[2], state[3]);

        // Track at the wire plane
        let dzp = wire.z - z;
        let x = state[0] + tx * dzp;
        let y = state[1] + ty * dzp;

        let upred = x * cos - y * sin;
        let vpred = x * sin + y * cos;
        let tu = tx * cos - ty * sin;
        let tv = tx * sin + ty * cos;

        let ca = 1.0 / (1.0 + tu * tu).sqrt();
        let ca3 = ca * ca * ca;
        let du = upred - wire.u;
        let g = if du >= 0.0 { 1.0 } else { -1.0 };
        let doca = du.abs() * ca;

        // Along-wire position of the closest approach and its derivatives
        let k = tu * ca * ca;
        let dk = (1.0 - tu * tu) * ca * ca * ca * ca;
        let v_doca = vpred - tv * du * k;

        let h = Matrix2x4::new(
            g * ca * cos,
            -g * ca * sin,
            g * ca * cos * dzp - du.abs() * tu * ca3 * cos,
            -g * ca * sin * dzp + du.abs() * tu * ca3 * sin,
            sin - tv * k * cos,
            cos + tv * k * sin,
            sin * dzp - (sin * du * k + tv * cos * dzp * k + tv * du * dk * cos),
            cos * dzp - (cos * du * k - tv * sin * dzp * k - tv * du * dk * sin),
        );

        let norm = (1.0 + tx * tx + ty * ty).sqrt();
        let s_plane = s + ctx.dz_sign * dzp * norm;
        let tdrift = hit.time - ctx.time_at(s_plane);

        let (dist, anode_var, cathode_var) =
            if stage == FitStage::TimeBased && self.use_fdc_drift_times {
                (
                    self.drift.fdc_drift_distance(tdrift),
                    self.drift.fdc_drift_variance(tdrift),
                    self.drift.fdc_cathode_variance(tdrift),
                )
            } else {
                (
                    self.drift.fdc_wire_based_distance(),
                    self.drift.fdc_wire_based_variance(),
                    self.drift.nominal_cathode_variance(),
                )
            };

        if !doca.is_finite() || !v_doca.is_finite() {
            return Err(FitError::Geometry("non-finite FDC projection".into()));
        }

        Ok(FdcMeasurement {
            hit_index,
            h,
            residual: Vector2::new(dist - doca, hit.s - v_doca),
            variance: Matrix2::new(anode_var, 0.0, 0.0, cathode_var),
            doca,
            dist,
            tdrift,
            s: s_plane,
        })
    }
}

// ============================================================================
// UPDATE RECORDS
// ============================================================================

/// Smoothed residual of a CDC hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcUpdate {
    /// Index into the candidate's CDC hits
    pub hit_index: usize,
    pub resi: f64,

    /// √(V - H Cs Hᵀ)
    pub err: f64,
    pub pull: f64,
    pub doca: f64,
    pub tdrift: f64,
    pub ddrift: f64,
    pub s: f64,
    pub z: f64,
    pub variance: f64,
    pub delta: f64,
    pub state: StateVector,
    pub covariance: Matrix4<f64>,
}

/// Smoothed residuals of an FDC pseudo hit (anode, cathode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdcUpdate {
    /// Index into the candidate's FDC hits
    pub hit_index: usize,
    pub resi: Vector2<f64>,
    pub err: Vector2<f64>,
    pub pull: Vector2<f64>,
    pub doca: f64,
    pub tdrift: f64,
    pub ddrift: f64,
    pub s: f64,
    pub z: f64,
    pub variance: Matrix2<f64>,
    pub state: StateVector,
    pub covariance: Matrix4<f64>,
}

impl FdcUpdate {
    pub fn max_abs_pull(&self) -> f64 {
        self.pull.x.abs().max(self.pull.y.abs())
    }
}

/// Output of the forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSummary {
    pub chi2: f64,
    pub measurement_dims: usize,
    pub used_cdc: usize,
    pub used_fdc: usize,
}

/// Output of the backward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmootherOutput {
    pub cdc_updates: Vec<CdcUpdate>,
    pub fdc_updates: Vec<FdcUpdate>,
}

impl SmootherOutput {
    fn abs_pulls(&self) -> impl Iterator<Item = (HitTag, f64)> + '_ {
        let cdc = self
            .cdc_updates
            .iter()
            .map(|u| (HitTag::Cdc(u.hit_index), u.pull.abs()));
        let fdc = self
            .fdc_updates
            .iter()
            .map(|u| (HitTag::Fdc(u.hit_index), u.max_abs_pull()));
        cdc.chain(fdc)
    }

    /// Hit with the largest |pull|, if any.
    pub fn worst_pull(&self) -> Option<(HitTag, f64)> {
        self.abs_pulls().max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Every smoothed hit with its |pull|, largest first.
    pub fn ranked_pulls(&self) -> Vec<(HitTag, f64)> {
        let mut pulls: Vec<_> = self.abs_pulls().collect();
        pulls.sort_by(|a, b| b.1.total_cmp(&a.1));
        pulls
    }
}

// ============================================================================
// FILTER / SMOOTHER
// ============================================================================

/// Forward Kalman filter and backward RTS smoother.
#[derive(Debug, Clone)]
pub struct KalmanFitter {
    model: MeasurementModel,
    initial_covariance: Matrix4<f64>,
    scattering_variance_per_cm: f64,
    hit_chi2_gate: Option<f64>,
    speed_of_light: f64,
}

impl KalmanFitter {
    pub fn new(config: &FitConfig) -> Self {
        let [c0, c1, c2, c3] = config.initial_covariance;
        Self {
            model: MeasurementModel::new(config),
            initial_covariance: Matrix4::from_diagonal(&nalgebra::Vector4::new(c0, c1, c2, c3)),
            scattering_variance_per_cm: config.scattering_variance_per_cm,
            hit_chi2_gate: config.do_pruning.then_some(config.hit_chi2_gate),
            speed_of_light: config.selector.speed_of_light,
        }
    }

    pub fn model(&self) -> &MeasurementModel {
        &self.model
    }

    /// Multiple-scattering noise for a step of `dz` with slopes `(tx, ty)`.
    fn process_noise(&self, dz: f64, state: &StateVector) -> Matrix4<f64> {
        let mut q = Matrix4::zeros();
        if self.scattering_variance_per_cm <= 0.0 || dz == 0.0 {
            return q;
        }
        let ds = dz.abs() * (1.0 + state[2] * state[2] + state[3] * state[3]).sqrt();
        let theta2 = self.scattering_variance_per_cm * ds;
        for (pos, slope) in [(0, 2), (1, 3)] {
            q[(slope, slope)] = theta2;
            q[(pos, pos)] = theta2 * dz * dz / 3.0;
            q[(pos, slope)] = theta2 * dz / 2.0;
            q[(slope, pos)] = theta2 * dz / 2.0;
        }
        q
    }

    /// Forward pass over all points. Fills predicted and filtered estimates.
    pub fn filter(
        &self,
        stage: FitStage,
        trajectory: &mut Trajectory,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<FilterSummary, FitError> {
        if trajectory.is_empty() {
            return Err(FitError::InsufficientHits(0));
        }
        let ctx = TrackContext::of(trajectory, self.speed_of_light);
        let mut summary = FilterSummary {
            chi2: 0.0,
            measurement_dims: 0,
            used_cdc: 0,
            used_fdc: 0,
        };

        let points = trajectory.points_mut();
        for k in 0..points.len() {
            let (predicted, predicted_cov) = if k == 0 {
                (points[0].state, self.initial_covariance)
            } else {
                let prev = &points[k - 1];
                let j = points[k].jacobian;
                let state = points[k].state + j * (prev.filtered - prev.state);
                let q = self.process_noise(points[k].z - prev.z, &prev.filtered);
                let cov = symmetrize(&(j * prev.filtered_cov * j.transpose() + q));
                (state, cov)
            };

            let point = &mut points[k];
            point.predicted = predicted;
            point.predicted_cov = predicted_cov;
            point.filtered = predicted;
            point.filtered_cov = predicted_cov;
            point.used = false;

            let Some(tag) = point.hit else {
                continue;
            };

            let measurement = match self.model.measure(
                stage, &ctx, point.z, point.s, &predicted, tag, cdc_hits, fdc_hits,
            ) {
                Ok(m) => m,
                Err(FitError::Geometry(msg)) => {
                    trace!(z = point.z, "skipping hit: {}", msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(gate) = self.hit_chi2_gate {
                let chi2 = measurement.innovation_chi2(&predicted_cov)?;
                if chi2 > gate {
                    trace!(z = point.z, chi2, "hit outside gate");
                    continue;
                }
            }

            let (state, cov, chi2) = measurement.update(&predicted, &predicted_cov)?;
            point.filtered = state;
            point.filtered_cov = cov;
            point.used = true;

            summary.chi2 += chi2;
            summary.measurement_dims += measurement.dimension();
            match tag {
                HitTag::Cdc(_) => summary.used_cdc += 1,
                HitTag::Fdc(_) => summary.used_fdc += 1,
            }
        }

        Ok(summary)
    }

    /// Backward RTS pass. Fills smoothed estimates and returns the pulls of
    /// every hit the filter used.
    pub fn smooth(
        &self,
        stage: FitStage,
        trajectory: &mut Trajectory,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<SmootherOutput, FitError> {
        if trajectory.is_empty() {
            return Err(FitError::InsufficientHits(0));
        }
        let ctx = TrackContext::of(trajectory, self.speed_of_light);
        let points = trajectory.points_mut();
        let n = points.len();

        let last = &mut points[n - 1];
        last.smoothed = last.filtered;
        last.smoothed_cov = last.filtered_cov;

        for k in (0..n - 1).rev() {
            let (head, tail) = points.split_at_mut(k + 1);
            let point = &mut head[k];
            let next = &tail[0];

            let pred_chol = spd_cholesky(next.predicted_cov).ok_or_else(|| {
                FitError::divergent("predicted covariance not invertible in smoother")
            })?;
            let a = point.filtered_cov * next.jacobian.transpose() * pred_chol.inverse();

            let state = point.filtered + a * (next.smoothed - next.predicted);
            let cov = symmetrize(
                &(point.filtered_cov + a * (next.smoothed_cov - next.predicted_cov) * a.transpose()),
            );
            if state.iter().any(|v| !v.is_finite()) || cov.iter().any(|v| !v.is_finite()) {
                return Err(FitError::divergent("non-finite smoothed estimate"));
            }
            point.smoothed = state;
            point.smoothed_cov = cov;
        }

        let mut output = SmootherOutput::default();
        for point in points.iter().filter(|p| p.used) {
            let Some(tag) = point.hit else {
                continue;
            };
            let measurement = match self.model.measure(
                stage,
                &ctx,
                point.z,
                point.s,
                &point.smoothed,
                tag,
                cdc_hits,
                fdc_hits,
            ) {
                Ok(m) => m,
                Err(FitError::Geometry(msg)) => {
                    trace!(z = point.z, "no smoothed residual: {}", msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match measurement {
                Measurement::Cdc(m) => {
                    let r = m.variance - (m.h * point.smoothed_cov * m.h.transpose())[(0, 0)];
                    if !(r > 0.0) {
                        warn!(z = point.z, r, "non-positive smoothed residual variance");
                        return Err(FitError::divergent("non-positive smoothed residual variance"));
                    }
                    let err = r.sqrt();
                    output.cdc_updates.push(CdcUpdate {
                        hit_index: m.hit_index,
                        resi: m.residual,
                        err,
                        pull: m.residual / err,
                        doca: m.doca,
                        tdrift: m.tdrift,
                        ddrift: m.dist,
                        s: m.s,
                        z: point.z,
                        variance: m.variance,
                        delta: m.delta,
                        state: point.smoothed,
                        covariance: point.smoothed_cov,
                    });
                }
                Measurement::Fdc(m) => {
                    let hch = m.h * point.smoothed_cov * m.h.transpose();
                    let r = Vector2::new(
                        m.variance[(0, 0)] - hch[(0, 0)],
                        m.variance[(1, 1)] - hch[(1, 1)],
                    );
                    if !(r.x > 0.0 && r.y > 0.0) {
                        warn!(z = point.z, "non-positive smoothed residual variance");
                        return Err(FitError::divergent("non-positive smoothed residual variance"));
                    }
                    let err = r.map(f64::sqrt);
                    output.fdc_updates.push(FdcUpdate {
                        hit_index: m.hit_index,
                        resi: m.residual,
                        err,
                        pull: m.residual.component_div(&err),
                        doca: m.doca,
                        tdrift: m.tdrift,
                        ddrift: m.dist,
                        s: m.s,
                        z: point.z,
                        variance: m.variance,
                        state: point.smoothed,
                        covariance: point.smoothed_cov,
                    });
                }
            }
        }

        Ok(output)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Direction, StraightLinePropagator, TrajectoryBuilder, TrajectorySeed};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector4};
    use proptest::prelude::*;
    use std::sync::Arc;
    use trackfit_env::{CdcWire, FdcWire};

    fn assert_symmetric(m: &Matrix4<f64>) {
        let scale = m.abs().max().max(1e-30);
        assert!((m - m.transpose()).abs().max() <= 1e-9 * scale);
    }

    fn forward_trajectory(
        config: &FitConfig,
        state: StateVector,
        cdc: &[CdcHit],
        fdc: &[FdcHit],
    ) -> Trajectory {
        let prop = StraightLinePropagator::new(config);
        let builder = TrajectoryBuilder::new(&prop, config);
        let seed = TrajectorySeed {
            state,
            z: 170.0,
            origin_z: 170.0,
            t0: 0.0,
            direction: Direction::Forward,
        };
        builder.build(&seed, cdc, fdc).unwrap()
    }

    /// FDC hits on three stereo views consistent with `truth` (wire-based anode).
    fn fdc_hits_on_line(truth: &StateVector, z0: f64, planes: usize) -> Vec<FdcHit> {
        let angles = [0.0, std::f64::consts::FRAC_PI_3, -std::f64::consts::FRAC_PI_3];
        (0..planes)
            .map(|i| {
                let z = 176.0 + 2.0 * i as f64;
                let angle = angles[i % 3];
                let x = truth[0] + truth[2] * (z - z0);
                let y = truth[1] + truth[3] * (z - z0);
                let (sin, cos) = f64::sin_cos(angle);
                let u = x * cos - y * sin;
                let v = x * sin + y * cos;
                // Wire 0.25 cm away in u, matching the half-cell measurement
                let wire = FdcWire::new(i as u32 + 1, 48, z, angle, u - 0.25, 100.0);
                FdcHit::new(Arc::new(wire), 20.0, v)
            })
            .collect()
    }

    #[test]
    fn test_zero_variance_is_divergent() {
        let state = Vector4::new(0.0, 0.0, 0.0, 0.0);
        let cov = Matrix4::identity();
        let h = RowVector4::new(1.0, 0.0, 0.0, 0.0);
        let result = kalman_update(&state, &cov, &h, &Vector1::new(0.1), &Matrix1::new(0.0));
        assert!(matches!(result, Err(FitError::DivergentFit(_))));

        let negative = kalman_update(&state, &cov, &h, &Vector1::new(0.1), &Matrix1::new(-1.0));
        assert!(matches!(negative, Err(FitError::DivergentFit(_))));
    }

    #[test]
    fn test_singular_innovation_is_divergent() {
        // Degenerate prior and zero projection leave nothing to invert
        let state = Vector4::zeros();
        let cov = Matrix4::zeros();
        let h = Matrix2x4::zeros();
        let result = kalman_update(
            &state,
            &cov,
            &h,
            &Vector2::new(0.1, 0.2),
            &Matrix2::new(0.0, 0.0, 0.0, 0.0),
        );
        assert!(matches!(result, Err(FitError::DivergentFit(_))));
    }

    #[test]
    fn test_scalar_update_matches_closed_form() {
        let state = Vector4::new(1.0, 0.0, 0.0, 0.0);
        let cov = Matrix4::from_diagonal(&Vector4::new(4.0, 1.0, 1.0, 1.0));
        let h = RowVector4::new(1.0, 0.0, 0.0, 0.0);
        let out = kalman_update(&state, &cov, &h, &Vector1::new(0.5), &Matrix1::new(1.0)).unwrap();

        // K = 4 / 5
        assert_relative_eq!(out.state[0], 1.0 + 0.4, epsilon = 1e-12);
        assert_relative_eq!(out.covariance[(0, 0)], 0.8, epsilon = 1e-12);
        assert_relative_eq!(out.covariance[(1, 1)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(out.chi2, 0.25 / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cdc_projection_matches_numerical_derivative() {
        let config = FitConfig::default();
        let model = MeasurementModel::new(&config);
        let ctx = TrackContext {
            dz_sign: 1.0,
            t0: 0.0,
            beta_c: 29.9792458,
        };
        let wire = CdcWire::new(4, 9, Vector3::new(12.0, 3.0, 92.0), Vector3::new(0.0, 0.1, 1.0), 150.0);
        let hit = CdcHit::new(Arc::new(wire), 40.0);
        let state = Vector4::new(11.7, 2.0, 0.02, 0.3);

        let m = model.cdc(FitStage::WireBased, &ctx, 60.0, 0.0, &state, &hit, 0).unwrap();
        for i in 0..4 {
            let mut shifted = state;
            shifted[i] += 1e-6;
            let mp = model.cdc(FitStage::WireBased, &ctx, 60.0, 0.0, &shifted, &hit, 0).unwrap();
            let numeric = (mp.doca - m.doca) / 1e-6;
            assert_relative_eq!(m.h[i], numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_fdc_projection_matches_numerical_derivative() {
        let config = FitConfig::default();
        let model = MeasurementModel::new(&config);
        let ctx = TrackContext {
            dz_sign: 1.0,
            t0: 0.0,
            beta_c: 29.9792458,
        };
        let wire = FdcWire::new(2, 40, 180.0, 1.0, -3.0, 100.0);
        let hit = FdcHit::new(Arc::new(wire), 30.0, 4.0);
        let state = Vector4::new(-1.0, 2.5, 0.08, -0.05);

        let m = model.fdc(FitStage::WireBased, &ctx, 176.0, 0.0, &state, &hit, 0).unwrap();
        for i in 0..4 {
            let mut shifted = state;
            shifted[i] += 1e-6;
            let mp = model.fdc(FitStage::WireBased, &ctx, 176.0, 0.0, &shifted, &hit, 0).unwrap();
            // h(S) = measurement - residual
            let numeric = (m.residual - mp.residual) / 1e-6;
            assert_relative_eq!(m.h[(0, i)], numeric.x, epsilon = 1e-4);
            assert_relative_eq!(m.h[(1, i)], numeric.y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_fdc_fit_recovers_line() {
        let config = FitConfig::default();
        let fitter = KalmanFitter::new(&config);
        let truth = Vector4::new(2.0, -1.5, 0.03, 0.02);
        let hits = fdc_hits_on_line(&truth, 170.0, 12);

        let seed = Vector4::new(2.4, -1.2, 0.028, 0.021);
        let mut traj = forward_trajectory(&config, seed, &[], &hits);
        let summary = fitter.filter(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        assert_eq!(summary.used_fdc, 12);
        assert_eq!(summary.measurement_dims, 24);

        let out = fitter.smooth(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        assert_eq!(out.fdc_updates.len(), 12);

        let first = &traj.points()[0];
        let expected_x = truth[0] + truth[2] * (first.z - 170.0);
        let expected_y = truth[1] + truth[3] * (first.z - 170.0);
        assert_relative_eq!(first.smoothed[0], expected_x, epsilon = 0.05);
        assert_relative_eq!(first.smoothed[1], expected_y, epsilon = 0.05);
        assert_relative_eq!(first.smoothed[2], truth[2], epsilon = 0.005);
        assert_relative_eq!(first.smoothed[3], truth[3], epsilon = 0.005);
    }

    #[test]
    fn test_single_hit_smoothing_reproduces_filter() {
        let config = FitConfig::default();
        let fitter = KalmanFitter::new(&config);
        let truth = Vector4::new(0.5, 0.5, 0.01, 0.01);
        let hits = fdc_hits_on_line(&truth, 170.0, 1);

        let mut traj = forward_trajectory(&config, truth, &[], &hits);
        fitter.filter(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        fitter.smooth(FitStage::WireBased, &mut traj, &[], &hits).unwrap();

        let hit_point = traj.points().iter().find(|p| p.used).unwrap();
        assert_eq!(hit_point.smoothed, hit_point.filtered);
        assert_eq!(hit_point.smoothed_cov, hit_point.filtered_cov);
    }

    #[test]
    fn test_covariances_stay_symmetric() {
        let config = FitConfig {
            scattering_variance_per_cm: 1e-7,
            ..FitConfig::default()
        };
        let fitter = KalmanFitter::new(&config);
        let truth = Vector4::new(-3.0, 1.0, -0.02, 0.04);
        let hits = fdc_hits_on_line(&truth, 170.0, 9);

        let mut traj = forward_trajectory(&config, truth, &[], &hits);
        fitter.filter(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        fitter.smooth(FitStage::WireBased, &mut traj, &[], &hits).unwrap();

        for p in traj.points() {
            assert_symmetric(&p.filtered_cov);
            assert_symmetric(&p.smoothed_cov);
        }
    }

    #[test]
    fn test_gate_skips_outlier() {
        let config = FitConfig::default();
        let fitter = KalmanFitter::new(&config);
        let truth = Vector4::new(1.0, 1.0, 0.0, 0.0);
        let mut hits = fdc_hits_on_line(&truth, 170.0, 12);

        // Move one cathode measurement far away along its wire
        hits[11].s += 10.0;

        let mut traj = forward_trajectory(&config, truth, &[], &hits);
        let summary = fitter.filter(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        assert_eq!(summary.used_fdc, 11);
        assert!(!traj.points().last().unwrap().used);
    }

    #[test]
    fn test_worst_pull_finds_largest() {
        let config = FitConfig {
            do_pruning: false,
            ..FitConfig::default()
        };
        let fitter = KalmanFitter::new(&config);
        let truth = Vector4::new(1.0, 1.0, 0.0, 0.0);
        let mut hits = fdc_hits_on_line(&truth, 170.0, 12);
        hits[5].s += 0.5;

        let mut traj = forward_trajectory(&config, truth, &[], &hits);
        fitter.filter(FitStage::WireBased, &mut traj, &[], &hits).unwrap();
        let out = fitter.smooth(FitStage::WireBased, &mut traj, &[], &hits).unwrap();

        let (tag, pull) = out.worst_pull().unwrap();
        assert_eq!(tag, HitTag::Fdc(5));
        assert!(pull > 4.0);

        let ranked = out.ranked_pulls();
        assert_eq!(ranked.len(), 12);
        assert_eq!(ranked[0], (tag, pull));
        assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    fn spd_matrix() -> impl Strategy<Value = Matrix4<f64>> {
        (prop::collection::vec(-1.0f64..1.0, 16), prop::collection::vec(0.01f64..5.0, 4)).prop_map(
            |(l, d)| {
                let l = Matrix4::from_row_slice(&l);
                l * l.transpose() + Matrix4::from_diagonal(&Vector4::from_row_slice(&d))
            },
        )
    }

    proptest! {
        #[test]
        fn prop_update_never_increases_trace(
            cov in spd_matrix(),
            h in prop::collection::vec(-2.0f64..2.0, 4),
            residual in -1.0f64..1.0,
            variance in 1e-4f64..2.0,
        ) {
            let h = RowVector4::from_row_slice(&h);
            let state = Vector4::zeros();
            let out = kalman_update(&state, &cov, &h, &Vector1::new(residual), &Matrix1::new(variance)).unwrap();
            prop_assert!(out.covariance.trace() <= cov.trace() * (1.0 + 1e-9));
        }

        #[test]
        fn prop_two_dim_update_symmetric(
            cov in spd_matrix(),
            h in prop::collection::vec(-2.0f64..2.0, 8),
            r in prop::collection::vec(-1.0f64..1.0, 2),
            v in prop::collection::vec(1e-3f64..1.0, 2),
        ) {
            let h = Matrix2x4::from_row_slice(&h);
            let variance = Matrix2::new(v[0], 0.0, 0.0, v[1]);
            let state = Vector4::zeros();
            let out = kalman_update(&state, &cov, &h, &Vector2::new(r[0], r[1]), &variance).unwrap();
            prop_assert_eq!(out.covariance, out.covariance.transpose());
            prop_assert!(out.covariance.trace() <= cov.trace() * (1.0 + 1e-9));
        }
    }
}
