//! Track-candidate factory: drives build → filter → smooth → re-select until
//! the accepted hit set is stable, then materializes a `TrackCandidate`.
//!
//! A fit never panics and never fails the event. Every error is handled in
//! the iteration loop; at worst the seed yields no candidate.

use nalgebra::{Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use trackfit_env::{CdcHit, FdcHit, HitSource, Propagator, StateVector};

use crate::candidate::{cartesian_error_matrix, cartesian_momentum, FitMode, TrackCandidate};
use crate::config::FitConfig;
use crate::error::FitError;
use crate::hit_selector::{chi2_probability, FitStage, HitSelector};
use crate::kalman::{symmetrize, FilterSummary, FitPhase, KalmanFitter, SmootherOutput};
use crate::trajectory::{
    Direction, HitTag, StraightLinePropagator, Trajectory, TrajectoryBuilder, TrajectoryEstimate,
    TrajectoryPoint, TrajectorySeed,
};

/// Number of fitted track parameters.
const STATE_DIM: usize = 4;

// ============================================================================
// SEEDS
// ============================================================================

/// Initial state estimate and hit assignment from pattern recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSeed {
    /// `(x, y, tx, ty)` at `z`
    pub state: StateVector,
    pub z: f64,

    /// Time at `z` (ns)
    pub t0: f64,

    /// Direction of travel in z (+1 or -1); only CDC-only fits use it
    pub dz_sign: f64,

    pub cdc_hits: Vec<CdcHit>,
    pub fdc_hits: Vec<FdcHit>,
}

impl TrackSeed {
    pub fn new(state: StateVector, z: f64) -> Self {
        Self {
            state,
            z,
            t0: 0.0,
            dz_sign: 1.0,
            cdc_hits: Vec::new(),
            fdc_hits: Vec::new(),
        }
    }

    pub fn with_cdc_hits(mut self, hits: Vec<CdcHit>) -> Self {
        self.cdc_hits = hits;
        self
    }

    pub fn with_fdc_hits(mut self, hits: Vec<FdcHit>) -> Self {
        self.fdc_hits = hits;
        self
    }

    pub fn with_t0(mut self, t0: f64) -> Self {
        self.t0 = t0;
        self
    }

    pub fn with_dz_sign(mut self, dz_sign: f64) -> Self {
        self.dz_sign = if dz_sign < 0.0 { -1.0 } else { 1.0 };
        self
    }
}

fn fit_mode(cdc: usize, fdc: usize) -> Option<FitMode> {
    match (cdc > 0, fdc > 0) {
        (true, true) => Some(FitMode::Combined),
        (true, false) => Some(FitMode::CdcOnly),
        (false, true) => Some(FitMode::FdcOnly),
        (false, false) => None,
    }
}

/// Least-squares straight line through FDC pseudo points.
///
/// Each pseudo hit contributes its wire position across the wire and its
/// cathode position along it. Hits far from a first fit are trimmed and the
/// line refitted once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSeeder {
    /// z at which seed states are reported
    pub reference_z: f64,

    /// Time at `reference_z` (ns)
    pub t0: f64,

    /// Minimum number of pseudo hits for a seed
    pub min_hits: usize,

    /// Transverse distance beyond which a hit is trimmed (cm)
    pub max_residual: f64,
}

impl LineSeeder {
    pub fn new(reference_z: f64, t0: f64) -> Self {
        Self {
            reference_z,
            t0,
            min_hits: 6,
            max_residual: 2.0,
        }
    }

    /// Fits `x(z)` and `y(z)` through the hits' positions.
    pub fn fit_line(&self, hits: &[FdcHit]) -> Option<StateVector> {
        if hits.len() < 2 {
            return None;
        }
        let n = hits.len() as f64;
        let (mut sz, mut szz, mut sx, mut sy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        for hit in hits {
            let p = hit.position();
            let dz = p.z - self.reference_z;
            sz += dz;
            szz += dz * dz;
            sx += p.x;
            sy += p.y;
            sxz += p.x * dz;
            syz += p.y * dz;
        }
        let det = n * szz - sz * sz;
        if det.abs() <= f64::EPSILON * n * szz.max(1.0) {
            return None;
        }
        let tx = (n * sxz - sz * sx) / det;
        let ty = (n * syz - sz * sy) / det;
        let x = (sx - tx * sz) / n;
        let y = (sy - ty * sz) / n;
        Some(Vector4::new(x, y, tx, ty))
    }

    /// Seed from a set of FDC hits, after trimming outliers.
    pub fn seed_from_fdc(&self, hits: &[FdcHit]) -> Option<TrackSeed> {
        if hits.len() < self.min_hits {
            return None;
        }
        let first = self.fit_line(hits)?;
        let kept: Vec<FdcHit> = hits
            .iter()
            .filter(|hit| {
                let p = hit.position();
                let dz = p.z - self.reference_z;
                let dx = p.x - (first[0] + first[2] * dz);
                let dy = p.y - (first[1] + first[3] * dz);
                (dx * dx + dy * dy).sqrt() <= self.max_residual
            })
            .cloned()
            .collect();
        if kept.len() < self.min_hits {
            return None;
        }
        let state = self.fit_line(&kept)?;
        Some(
            TrackSeed::new(state, self.reference_z)
                .with_t0(self.t0)
                .with_fdc_hits(kept),
        )
    }

    /// One seed from all FDC hits of an event.
    pub fn seed_event(&self, hits: &dyn HitSource) -> Vec<TrackSeed> {
        self.seed_from_fdc(hits.fdc_hits()).into_iter().collect()
    }
}

// ============================================================================
// WORKSPACE
// ============================================================================

/// Working buffers owned by exactly one fit at a time.
///
/// Reusing a workspace across fits on the same thread avoids reallocating
/// trajectory points; it is never shared between concurrent fits.
#[derive(Debug, Clone)]
pub struct FitWorkspace {
    buffer: Vec<TrajectoryPoint>,
    phase: FitPhase,
}

impl Default for FitWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl FitWorkspace {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            phase: FitPhase::Initialized,
        }
    }

    /// Phase reached by the last fit iteration.
    pub fn phase(&self) -> FitPhase {
        self.phase
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    fn recycle(&mut self, trajectory: Trajectory) {
        self.buffer = trajectory.into_points();
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Result of one successful filter/smoother pass.
struct IterationFit {
    stage: FitStage,
    candidate: TrackCandidate,
}

impl IterationFit {
    fn better_than(&self, other: &IterationFit) -> bool {
        if self.stage.rank() != other.stage.rank() {
            return self.stage.rank() > other.stage.rank();
        }
        self.candidate.chi2_per_ndof() < other.candidate.chi2_per_ndof()
    }
}

/// Fits track seeds into candidates.
///
/// Holds only immutable configuration and the propagation service, so one
/// factory can serve fits on many threads at once.
pub struct TrackCandidateFactory {
    config: FitConfig,
    selector: HitSelector,
    fitter: KalmanFitter,
    propagator: Arc<dyn Propagator>,
}

impl TrackCandidateFactory {
    /// Factory using straight-line propagation.
    pub fn new(config: FitConfig) -> Self {
        let propagator = Arc::new(StraightLinePropagator::new(&config));
        Self::with_propagator(config, propagator)
    }

    /// Factory using an external propagation service.
    pub fn with_propagator(config: FitConfig, propagator: Arc<dyn Propagator>) -> Self {
        Self {
            selector: HitSelector::new(&config),
            fitter: KalmanFitter::new(&config),
            propagator,
            config,
        }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn selector(&self) -> &HitSelector {
        &self.selector
    }

    /// Fits one seed with a fresh workspace.
    pub fn fit(&self, seed: &TrackSeed) -> Result<TrackCandidate, FitError> {
        let mut workspace = FitWorkspace::new();
        self.fit_with_workspace(seed, &mut workspace)
    }

    /// Fits one seed, reusing the given workspace's buffers.
    pub fn fit_with_workspace(
        &self,
        seed: &TrackSeed,
        workspace: &mut FitWorkspace,
    ) -> Result<TrackCandidate, FitError> {
        workspace.phase = FitPhase::Initialized;
        let result = self.run_fit(seed, workspace);
        workspace.phase = match result {
            Ok(ref c) if c.converged => FitPhase::Converged,
            _ => FitPhase::Failed,
        };
        result
    }

    fn seed_hits(&self, seed: &TrackSeed) -> (Vec<CdcHit>, Vec<FdcHit>) {
        let cdc = if self.config.skip_cdc {
            Vec::new()
        } else {
            seed.cdc_hits.clone()
        };
        let fdc = if self.config.skip_fdc {
            Vec::new()
        } else {
            seed.fdc_hits
                .iter()
                .filter(|hit| Some(hit.wire.layer) != self.config.plane_to_skip)
                .cloned()
                .collect()
        };
        (cdc, fdc)
    }

    fn run_fit(
        &self,
        seed: &TrackSeed,
        workspace: &mut FitWorkspace,
    ) -> Result<TrackCandidate, FitError> {
        let (all_cdc, all_fdc) = self.seed_hits(seed);
        let mode = fit_mode(all_cdc.len(), all_fdc.len()).ok_or(FitError::InsufficientHits(0))?;
        let direction = match mode {
            FitMode::CdcOnly => Direction::PathLength {
                dz_sign: seed.dz_sign,
            },
            FitMode::FdcOnly | FitMode::Combined => Direction::Forward,
        };

        let mut rejected_cdc = vec![false; all_cdc.len()];
        let mut rejected_fdc = vec![false; all_fdc.len()];
        let mut active_cdc: Vec<usize> = (0..all_cdc.len()).collect();
        let mut active_fdc: Vec<usize> = (0..all_fdc.len()).collect();

        let mut state = seed.state;
        let mut state_z = seed.z;
        let mut best: Option<IterationFit> = None;
        // Hits of the last smoothing pass, worst pull first
        let mut ranked: Vec<HitTag> = Vec::new();
        let builder = TrajectoryBuilder::new(self.propagator.as_ref(), &self.config);

        for iteration in 1..=self.config.max_iterations {
            let stage = self.stage_for(iteration);

            let dims = active_cdc.len() + 2 * active_fdc.len();
            if dims < STATE_DIM + self.config.min_ndof {
                debug!(iteration, dims, "too few measurements left");
                return self.finish_early(best, FitError::InsufficientHits(dims));
            }

            let cdc_hits: Vec<CdcHit> = active_cdc.iter().map(|&i| all_cdc[i].clone()).collect();
            let fdc_hits: Vec<FdcHit> = active_fdc.iter().map(|&i| all_fdc[i].clone()).collect();

            let traj_seed = TrajectorySeed {
                state,
                z: state_z,
                origin_z: seed.z,
                t0: seed.t0,
                direction,
            };
            let buffer = std::mem::take(&mut workspace.buffer);
            let mut trajectory = match builder.build_into(buffer, &traj_seed, &cdc_hits, &fdc_hits) {
                Ok(trajectory) => trajectory,
                Err(e) => {
                    debug!(iteration, "trajectory build failed: {}", e);
                    return self.finish_early(best, e);
                }
            };

            workspace.phase = FitPhase::Filtering;
            let pass = match self.fitter.filter(stage, &mut trajectory, &cdc_hits, &fdc_hits) {
                Ok(summary) => {
                    workspace.phase = FitPhase::Smoothing;
                    self.fitter
                        .smooth(stage, &mut trajectory, &cdc_hits, &fdc_hits)
                        .map(|output| (summary, output))
                }
                Err(e) => Err(e),
            };

            let (summary, output) = match pass {
                Ok(pass) => pass,
                Err(FitError::DivergentFit(msg)) => {
                    warn!(iteration, stage = stage.name(), "divergent fit: {}", msg);
                    workspace.recycle(trajectory);
                    let next = ranked
                        .iter()
                        .copied()
                        .find(|&tag| !is_rejected(tag, &rejected_cdc, &rejected_fdc));
                    match next.filter(|_| self.config.do_pruning) {
                        Some(tag) => {
                            debug!(iteration, ?tag, "rejecting hit after divergence");
                            reject(tag, &mut rejected_cdc, &mut rejected_fdc);
                            active_cdc.retain(|&i| !rejected_cdc[i]);
                            active_fdc.retain(|&i| !rejected_fdc[i]);
                            continue;
                        }
                        None => return self.finish_early(best, FitError::DivergentFit(msg)),
                    }
                }
                Err(e) => {
                    workspace.recycle(trajectory);
                    return self.finish_early(best, e);
                }
            };

            let ndof = summary.measurement_dims.saturating_sub(STATE_DIM);
            if ndof < self.config.min_ndof {
                debug!(iteration, ndof, "filter used too few measurements");
                workspace.recycle(trajectory);
                return self.finish_early(best, FitError::InsufficientHits(summary.measurement_dims));
            }

            trajectory.set_estimate(TrajectoryEstimate::Smoothed);
            let materialized = self.materialize(
                mode,
                iteration,
                &trajectory,
                &summary,
                &output,
                &cdc_hits,
                &fdc_hits,
            );
            let candidate = match materialized {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!(iteration, "cannot report candidate: {}", e);
                    workspace.recycle(trajectory);
                    return self.finish_early(best, e);
                }
            };
            let chi2_ndof = candidate.chi2_per_ndof();
            debug!(
                iteration,
                stage = stage.name(),
                chi2 = summary.chi2,
                ndof,
                cdc = summary.used_cdc,
                fdc = summary.used_fdc,
                "fit pass"
            );

            // Re-linearize around the smoothed estimate
            let first = &trajectory.points()[0];
            state = first.smoothed;
            state_z = first.z;

            // Pulls are indexed into this pass's hits; map them back to the seed's
            let pulls: Vec<(HitTag, f64)> = output
                .ranked_pulls()
                .into_iter()
                .map(|(tag, pull)| match tag {
                    HitTag::Cdc(i) => (HitTag::Cdc(active_cdc[i]), pull),
                    HitTag::Fdc(j) => (HitTag::Fdc(active_fdc[j]), pull),
                })
                .collect();
            let worst = pulls.first().copied();
            ranked = pulls.into_iter().map(|(tag, _)| tag).collect();

            let fit = IterationFit {
                stage,
                candidate: candidate.clone(),
            };
            if best.as_ref().map_or(true, |b| fit.better_than(b)) {
                best = Some(fit);
            }

            if self.config.do_pruning {
                if let Some((tag, pull)) = worst.filter(|(_, pull)| *pull > self.config.pull_cut) {
                    debug!(iteration, ?tag, pull, "pruning hit");
                    reject(tag, &mut rejected_cdc, &mut rejected_fdc);
                    active_cdc.retain(|&i| !rejected_cdc[i]);
                    active_fdc.retain(|&i| !rejected_fdc[i]);
                    workspace.recycle(trajectory);
                    continue;
                }
            }

            let next_stage = self.stage_for(iteration + 1);
            let selected_cdc: Vec<usize> = self
                .selector
                .select_cdc_indices(next_stage, &trajectory, &all_cdc)
                .into_iter()
                .filter(|&i| !rejected_cdc[i])
                .collect();
            let selected_fdc: Vec<usize> = self
                .selector
                .select_fdc_indices(next_stage, &trajectory, &all_fdc)
                .into_iter()
                .filter(|&j| !rejected_fdc[j])
                .collect();
            workspace.recycle(trajectory);

            let unchanged = selected_cdc == active_cdc && selected_fdc == active_fdc;
            trace!(iteration, unchanged, "hit re-selection");
            if unchanged && next_stage == stage {
                // Another pass would repeat this one
                if chi2_ndof < self.config.chi2_cut {
                    let mut candidate = candidate;
                    candidate.converged = true;
                    return Ok(candidate);
                }
                debug!(iteration, chi2_ndof, "hit set stable above the χ² cut");
                return self.finish_early(best, FitError::ConvergenceFailure { iterations: iteration });
            }

            active_cdc = selected_cdc;
            active_fdc = selected_fdc;
        }

        debug!(iterations = self.config.max_iterations, "iteration cap reached");
        self.finish_early(
            best,
            FitError::ConvergenceFailure {
                iterations: self.config.max_iterations,
            },
        )
    }

    /// Wire-based first pass, time-based afterwards when drift times are used.
    fn stage_for(&self, iteration: u32) -> FitStage {
        if iteration > 1 && self.config.use_drift_times {
            FitStage::TimeBased
        } else {
            FitStage::WireBased
        }
    }

    /// Emits the best fit seen, flagged unconverged, or reports `err`.
    fn finish_early(
        &self,
        best: Option<IterationFit>,
        err: FitError,
    ) -> Result<TrackCandidate, FitError> {
        match best {
            Some(fit) if self.config.emit_unconverged => {
                let mut candidate = fit.candidate;
                candidate.converged = false;
                Ok(candidate)
            }
            _ => Err(err),
        }
    }

    /// Smoothed state and covariance at the reporting z, with the time there.
    fn reported_state(
        &self,
        trajectory: &Trajectory,
    ) -> Result<(f64, StateVector, Matrix4<f64>, f64), FitError> {
        let first = &trajectory.points()[0];
        let Some(z) = self.config.reference_z else {
            return Ok((first.z, first.smoothed, first.smoothed_cov, first.t));
        };

        let (state, jacobian) = self.propagator.propagate(&first.smoothed, first.z, z)?;
        let covariance = symmetrize(&(jacobian * first.smoothed_cov * jacobian.transpose()));

        let (p, m) = (self.config.assumed_momentum, self.config.mass);
        let beta_c = p / (p * p + m * m).sqrt() * self.config.selector.speed_of_light;
        let norm = (1.0 + state[2] * state[2] + state[3] * state[3]).sqrt();
        let t = first.t + trajectory.dz_sign() * (z - first.z) * norm / beta_c;
        Ok((z, state, covariance, t))
    }

    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        mode: FitMode,
        iteration: u32,
        trajectory: &Trajectory,
        summary: &FilterSummary,
        output: &SmootherOutput,
        cdc_hits: &[CdcHit],
        fdc_hits: &[FdcHit],
    ) -> Result<TrackCandidate, FitError> {
        let mut cdc_used = vec![false; cdc_hits.len()];
        let mut fdc_used = vec![false; fdc_hits.len()];
        for point in trajectory.points().iter().filter(|p| p.used) {
            match point.hit {
                Some(HitTag::Cdc(i)) => cdc_used[i] = true,
                Some(HitTag::Fdc(j)) => fdc_used[j] = true,
                None => {}
            }
        }
        let (cdc_index, accepted_cdc) = compact(&cdc_used, cdc_hits);
        let (fdc_index, accepted_fdc) = compact(&fdc_used, fdc_hits);

        let cdc_updates = output
            .cdc_updates
            .iter()
            .filter_map(|u| {
                cdc_index[u.hit_index].map(|k| {
                    let mut u = u.clone();
                    u.hit_index = k;
                    u
                })
            })
            .collect();
        let fdc_updates = output
            .fdc_updates
            .iter()
            .filter_map(|u| {
                fdc_index[u.hit_index].map(|k| {
                    let mut u = u.clone();
                    u.hit_index = k;
                    u
                })
            })
            .collect();

        let (z, state, covariance, t0) = self.reported_state(trajectory)?;
        let dz_sign = trajectory.dz_sign();
        let p = self.config.assumed_momentum;
        let ndof = summary.measurement_dims.saturating_sub(STATE_DIM);

        Ok(TrackCandidate {
            mode,
            cdc_hits: accepted_cdc,
            fdc_hits: accepted_fdc,
            z,
            t0,
            state,
            covariance,
            position: Vector3::new(state[0], state[1], z),
            momentum: cartesian_momentum(&state, p, dz_sign),
            error_matrix: cartesian_error_matrix(&covariance, &state, p, dz_sign),
            chi2: summary.chi2,
            ndof,
            fit_probability: chi2_probability(summary.chi2, ndof),
            converged: false,
            iterations: iteration,
            cdc_updates,
            fdc_updates,
        })
    }

    // ========================================================================
    // EVENT PROCESSING
    // ========================================================================

    /// Fits every seed of an event. Failed seeds are dropped.
    ///
    /// FDC-only seeds pick up unused CDC hits within `cdc_match_doca` of the
    /// seed line; CDC hits on an accepted candidate are not offered to later
    /// seeds.
    pub fn process_event(&self, hits: &dyn HitSource, seeds: &[TrackSeed]) -> Vec<TrackCandidate> {
        let event_cdc = hits.cdc_hits();
        let mut used_cdc = vec![false; event_cdc.len()];
        let mut workspace = FitWorkspace::new();
        let mut candidates = Vec::new();

        for (n, seed) in seeds.iter().enumerate() {
            let matched = if seed.cdc_hits.is_empty() && !seed.fdc_hits.is_empty() {
                self.match_cdc_hits(seed, event_cdc, &used_cdc)
            } else {
                Vec::new()
            };

            let result = if matched.is_empty() {
                self.fit_with_workspace(seed, &mut workspace)
            } else {
                let extended = seed
                    .clone()
                    .with_cdc_hits(matched.iter().map(|&i| event_cdc[i].clone()).collect());
                self.fit_with_workspace(&extended, &mut workspace)
            };

            match result {
                Ok(candidate) => {
                    for (i, hit) in event_cdc.iter().enumerate() {
                        if candidate.cdc_hits.contains(hit) {
                            used_cdc[i] = true;
                        }
                    }
                    candidates.push(candidate);
                }
                Err(e) => debug!(seed = n, "seed dropped: {}", e),
            }
        }

        candidates
    }

    /// Indices of unused CDC hits close to the seed line.
    pub fn match_cdc_hits(&self, seed: &TrackSeed, cdc_hits: &[CdcHit], used: &[bool]) -> Vec<usize> {
        if self.config.skip_cdc {
            return Vec::new();
        }
        let point = Vector3::new(seed.state[0], seed.state[1], seed.z);
        let dir = Vector3::new(seed.state[2], seed.state[3], 1.0);
        cdc_hits
            .iter()
            .enumerate()
            .filter(|(i, _)| !used.get(*i).copied().unwrap_or(false))
            .filter_map(|(i, hit)| {
                let approach = hit.wire.line().closest_approach(&point, &dir).ok()?;
                // Only within the active length of the straw
                let inside = approach.wire_param.abs() <= 0.5 * hit.wire.length;
                (inside && approach.doca() < self.config.cdc_match_doca).then_some(i)
            })
            .collect()
    }
}

fn is_rejected(tag: HitTag, rejected_cdc: &[bool], rejected_fdc: &[bool]) -> bool {
    match tag {
        HitTag::Cdc(i) => rejected_cdc[i],
        HitTag::Fdc(j) => rejected_fdc[j],
    }
}

fn reject(tag: HitTag, rejected_cdc: &mut [bool], rejected_fdc: &mut [bool]) {
    match tag {
        HitTag::Cdc(i) => rejected_cdc[i] = true,
        HitTag::Fdc(j) => rejected_fdc[j] = true,
    }
}

/// Maps used flags to compacted indices and collects the used hits.
fn compact<T: Clone>(used: &[bool], hits: &[T]) -> (Vec<Option<usize>>, Vec<T>) {
    let mut index = Vec::with_capacity(used.len());
    let mut kept = Vec::new();
    for (&flag, hit) in used.iter().zip(hits) {
        if flag {
            index.push(Some(kept.len()));
            kept.push(hit.clone());
        } else {
            index.push(None);
        }
    }
    (index, kept)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trackfit_env::{CdcWire, EnvResult, EventHits, FdcWire, StateJacobian};

    const DRIFT_VELOCITY: f64 = 0.0055;

    fn beta_c(config: &FitConfig) -> f64 {
        let (p, m) = (config.assumed_momentum, config.mass);
        config.selector.speed_of_light / (1.0 + m * m / (p * p)).sqrt()
    }

    fn line_point(truth: &StateVector, z0: f64, z: f64) -> Vector3<f64> {
        Vector3::new(
            truth[0] + truth[2] * (z - z0),
            truth[1] + truth[3] * (z - z0),
            z,
        )
    }

    /// FDC hits with the anode 0.25 cm from the line on every plane.
    fn fdc_hits(truth: &StateVector, z0: f64, planes: usize, config: &FitConfig) -> Vec<FdcHit> {
        let angles = [0.0, FRAC_PI_3, -FRAC_PI_3];
        let norm = (1.0 + truth[2] * truth[2] + truth[3] * truth[3]).sqrt();
        (0..planes)
            .map(|i| {
                let z = 176.0 + 2.0 * i as f64;
                let angle = angles[i % 3];
                let p = line_point(truth, z0, z);
                let (sin, cos) = f64::sin_cos(angle);
                let u = p.x * cos - p.y * sin;
                let v = p.x * sin + p.y * cos;
                let tu = truth[2] * cos - truth[3] * sin;
                let tv = truth[2] * sin + truth[3] * cos;
                let ca = 1.0 / (1.0 + tu * tu).sqrt();
                let du = 0.25 / ca;
                let wire = FdcWire::new(i as u32 + 1, 48, z, angle, u - du, 100.0);
                let s = v - tv * du * tu * ca * ca;
                let time = (z - z0) * norm / beta_c(config) + 0.25 / DRIFT_VELOCITY;
                FdcHit::new(Arc::new(wire), time, s)
            })
            .collect()
    }

    /// CDC hit on a straw with direction `wire_dir` passing `d` from the line at `z`.
    #[allow(clippy::too_many_arguments)]
    fn cdc_hit(
        truth: &StateVector,
        z0: f64,
        z: f64,
        wire_dir: Vector3<f64>,
        d: f64,
        side: f64,
        dz_sign: f64,
        config: &FitConfig,
    ) -> CdcHit {
        let p = line_point(truth, z0, z);
        let track_dir = Vector3::new(truth[2], truth[3], 1.0);
        let n = track_dir.cross(&wire_dir).normalize() * side;
        let wire = CdcWire::new(1, 0, p + n * d, wire_dir, 150.0);
        let s = dz_sign * (z - z0) * track_dir.norm();
        CdcHit::new(Arc::new(wire), s / beta_c(config) + d / DRIFT_VELOCITY)
    }

    fn wire_dirs() -> [Vector3<f64>; 4] {
        [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.3, 0.0, 1.0),
            Vector3::new(0.0, 0.3, 1.0),
            Vector3::new(-0.3, 0.0, 1.0),
        ]
    }

    fn forward_truth() -> StateVector {
        Vector4::new(1.0, -2.0, 0.1, -0.05)
    }

    fn forward_seed(truth: &StateVector, hits: Vec<FdcHit>) -> TrackSeed {
        let state = truth + Vector4::new(0.3, -0.2, 0.01, 0.005);
        TrackSeed::new(state, 65.0).with_fdc_hits(hits)
    }

    /// Straight-line swim that returns a zero Jacobian for the first
    /// `budget` steps spanning more than one plane spacing.
    struct GapCollapsingPropagator {
        inner: StraightLinePropagator,
        budget: AtomicUsize,
    }

    impl Propagator for GapCollapsingPropagator {
        fn propagate(
            &self,
            state: &StateVector,
            from_z: f64,
            to_z: f64,
        ) -> EnvResult<(StateVector, StateJacobian)> {
            let (out, jacobian) = self.inner.propagate(state, from_z, to_z)?;
            let dz = (to_z - from_z).abs();
            let collapse = dz > 3.0
                && dz < 10.0
                && self
                    .budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            Ok((out, if collapse { StateJacobian::zeros() } else { jacobian }))
        }
    }

    /// Straight-line swim whose Jacobian is zero after `healthy` calls.
    struct WornOutPropagator {
        inner: StraightLinePropagator,
        healthy: AtomicUsize,
    }

    impl Propagator for WornOutPropagator {
        fn propagate(
            &self,
            state: &StateVector,
            from_z: f64,
            to_z: f64,
        ) -> EnvResult<(StateVector, StateJacobian)> {
            let (out, jacobian) = self.inner.propagate(state, from_z, to_z)?;
            let worn = self
                .healthy
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();
            Ok((out, if worn { StateJacobian::zeros() } else { jacobian }))
        }
    }

    /// Factory whose swim breaks down after the first trajectory build of
    /// a 12-plane forward fit (seed step plus 11 plane steps).
    fn worn_out_factory(config: FitConfig) -> TrackCandidateFactory {
        let propagator = Arc::new(WornOutPropagator {
            inner: StraightLinePropagator::new(&config),
            healthy: AtomicUsize::new(12),
        });
        TrackCandidateFactory::with_propagator(config, propagator)
    }

    #[test]
    fn test_fdc_only_fit_recovers_line() {
        let config = FitConfig::default();
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &config);
        let factory = TrackCandidateFactory::new(config);

        let candidate = factory.fit(&forward_seed(&truth, hits)).unwrap();

        assert_eq!(candidate.mode, FitMode::FdcOnly);
        assert!(candidate.converged);
        assert_eq!(candidate.fdc_hits.len(), 12);
        assert_eq!(candidate.ndof, 20);
        assert_relative_eq!(candidate.z, 176.0, epsilon = 1e-12);

        let expected = line_point(&truth, 65.0, candidate.z);
        assert_relative_eq!(candidate.state[0], expected.x, epsilon = 1e-3);
        assert_relative_eq!(candidate.state[1], expected.y, epsilon = 1e-3);
        assert_relative_eq!(candidate.state[2], truth[2], epsilon = 1e-3);
        assert_relative_eq!(candidate.state[3], truth[3], epsilon = 1e-3);
        assert!(candidate.chi2_per_ndof() < 1.0);
        assert!(candidate.fit_probability > 0.5);

        assert_relative_eq!(candidate.momentum.norm(), 5.0, epsilon = 1e-9);
        assert!(candidate.momentum.z > 0.0);
        assert_eq!(candidate.fdc_updates.len(), 12);
        assert!(candidate.fdc_updates.iter().all(|u| u.hit_index < 12));
    }

    #[test]
    fn test_misassigned_hit_is_excluded() {
        let config = FitConfig::default();
        let truth = forward_truth();
        let mut hits = fdc_hits(&truth, 65.0, 12, &config);
        hits[6].s += 3.0;
        let bad = hits[6].clone();
        let factory = TrackCandidateFactory::new(config);

        let candidate = factory.fit(&forward_seed(&truth, hits)).unwrap();

        assert_eq!(candidate.fdc_hits.len(), 11);
        assert!(!candidate.fdc_hits.contains(&bad));
        let expected = line_point(&truth, 65.0, candidate.z);
        assert_relative_eq!(candidate.state[0], expected.x, epsilon = 1e-2);
        assert_relative_eq!(candidate.state[1], expected.y, epsilon = 1e-2);
    }

    #[test]
    fn test_divergence_after_prune_rejects_next_worst_hit() {
        let config = FitConfig {
            trajectory_step: 10.0,
            hit_chi2_gate: 1e9,
            ..FitConfig::default()
        };
        let truth = forward_truth();
        let mut hits = fdc_hits(&truth, 65.0, 12, &config);
        hits[6].s += 3.0;
        let bad = hits[6].clone();

        // Pruning hit 6 leaves a 4 cm gap; the next two builds across it diverge
        let propagator = Arc::new(GapCollapsingPropagator {
            inner: StraightLinePropagator::new(&config),
            budget: AtomicUsize::new(2),
        });
        let factory = TrackCandidateFactory::with_propagator(config, propagator);

        let candidate = factory.fit(&forward_seed(&truth, hits)).unwrap();

        assert!(candidate.converged);
        assert_eq!(candidate.iterations, 4);
        assert_eq!(candidate.fdc_hits.len(), 9);
        assert!(!candidate.fdc_hits.contains(&bad));
    }

    #[test]
    fn test_divergence_without_pruning() {
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());
        let seed = forward_seed(&truth, hits);

        let strict = FitConfig {
            do_pruning: false,
            emit_unconverged: false,
            ..FitConfig::default()
        };
        let result = worn_out_factory(strict).fit(&seed);
        assert!(matches!(result, Err(FitError::DivergentFit(_))));

        let lenient = FitConfig {
            do_pruning: false,
            emit_unconverged: true,
            ..FitConfig::default()
        };
        let candidate = worn_out_factory(lenient).fit(&seed).unwrap();
        assert!(!candidate.converged);
        assert_eq!(candidate.iterations, 1);
        assert_eq!(candidate.fdc_hits.len(), 12);
    }

    #[test]
    fn test_divergence_with_pruning_keeps_rejecting() {
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());
        let seed = forward_seed(&truth, hits);

        // Every pass after the first diverges; each one drops another hit
        let strict = FitConfig {
            emit_unconverged: false,
            ..FitConfig::default()
        };
        let result = worn_out_factory(strict).fit(&seed);
        assert!(matches!(
            result,
            Err(FitError::ConvergenceFailure { iterations: 10 })
        ));

        let candidate = worn_out_factory(FitConfig::default()).fit(&seed).unwrap();
        assert!(!candidate.converged);
        assert_eq!(candidate.iterations, 1);
    }

    #[test]
    fn test_iteration_cap() {
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());
        let seed = forward_seed(&truth, hits);

        // One wire-based pass never converges: the time-based pass is still due
        let strict = FitConfig {
            max_iterations: 1,
            emit_unconverged: false,
            ..FitConfig::default()
        };
        let factory = TrackCandidateFactory::new(strict);
        assert!(matches!(
            factory.fit(&seed),
            Err(FitError::ConvergenceFailure { iterations: 1 })
        ));

        let lenient = FitConfig {
            max_iterations: 1,
            emit_unconverged: true,
            ..FitConfig::default()
        };
        let factory = TrackCandidateFactory::new(lenient);
        let mut workspace = FitWorkspace::new();
        let candidate = factory.fit_with_workspace(&seed, &mut workspace).unwrap();
        assert!(!candidate.converged);
        assert_eq!(candidate.iterations, 1);
        assert_eq!(candidate.fdc_hits.len(), 12);
        assert_eq!(workspace.phase(), FitPhase::Failed);
    }

    #[test]
    fn test_stable_hit_set_above_chi2_cut_stops() {
        let truth = forward_truth();
        let mut hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.s += if i % 2 == 0 { 0.02 } else { -0.02 };
        }
        let seed = forward_seed(&truth, hits);

        let strict = FitConfig {
            chi2_cut: 0.05,
            do_pruning: false,
            emit_unconverged: false,
            ..FitConfig::default()
        };
        let max_iterations = strict.max_iterations;
        match TrackCandidateFactory::new(strict).fit(&seed) {
            Err(FitError::ConvergenceFailure { iterations }) => assert!(iterations < max_iterations),
            other => panic!("expected a convergence failure, got {:?}", other),
        }

        let lenient = FitConfig {
            chi2_cut: 0.05,
            do_pruning: false,
            ..FitConfig::default()
        };
        let candidate = TrackCandidateFactory::new(lenient).fit(&seed).unwrap();
        assert!(!candidate.converged);
        assert!(candidate.iterations < max_iterations);
        assert_eq!(candidate.fdc_hits.len(), 12);
        assert!(candidate.chi2_per_ndof() > 0.05);
    }

    #[test]
    fn test_candidate_reported_at_reference_z() {
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());
        let seed = forward_seed(&truth, hits);

        let at_first = TrackCandidateFactory::new(FitConfig::default())
            .fit(&seed)
            .unwrap();
        let config = FitConfig {
            reference_z: Some(65.0),
            ..FitConfig::default()
        };
        let p = config.assumed_momentum;
        let at_target = TrackCandidateFactory::new(config).fit(&seed).unwrap();

        assert!(at_target.converged);
        assert_relative_eq!(at_first.z, 176.0, epsilon = 1e-12);
        assert_relative_eq!(at_target.z, 65.0, epsilon = 1e-12);
        assert_relative_eq!(at_target.position.z, 65.0, epsilon = 1e-12);
        assert_relative_eq!(at_target.position.x, truth[0], epsilon = 0.05);
        assert_relative_eq!(at_target.position.y, truth[1], epsilon = 0.05);
        assert_relative_eq!(at_target.t0, 0.0, epsilon = 1e-2);

        let dz = 65.0 - 176.0;
        let mut j = Matrix4::identity();
        j[(0, 2)] = dz;
        j[(1, 3)] = dz;
        let expected_state = j * at_first.state;
        let expected_cov = j * at_first.covariance * j.transpose();
        assert_relative_eq!(at_target.state, expected_state, epsilon = 1e-9);
        assert_relative_eq!(
            at_target.covariance,
            expected_cov,
            epsilon = 1e-12,
            max_relative = 1e-9
        );
        assert_relative_eq!(
            at_target.error_matrix,
            cartesian_error_matrix(&expected_cov, &expected_state, p, 1.0),
            epsilon = 1e-12,
            max_relative = 1e-9
        );

        // Extrapolating over 111 cm widens the position errors
        assert!(at_target.covariance[(0, 0)] > at_first.covariance[(0, 0)]);
        assert_eq!(at_target.fdc_hits, at_first.fdc_hits);
    }

    #[test]
    fn test_cdc_cosmic_fit() {
        let config = FitConfig::default();
        let truth = Vector4::new(1.0, 2.0, 0.8, -1.2);
        let z0 = 92.0;
        let dz_sign = -1.0;
        let dirs = wire_dirs();
        let docas = [0.15, 0.3, 0.45, 0.6];
        let hits: Vec<CdcHit> = (0..17)
            .map(|k| {
                let z = z0 + (k as f64 - 8.0);
                let side = if k % 2 == 0 { 1.0 } else { -1.0 };
                cdc_hit(&truth, z0, z, dirs[k % 4], docas[k % 4], side, dz_sign, &config)
            })
            .collect();

        let seed = TrackSeed::new(truth + Vector4::new(0.05, -0.05, 0.005, -0.005), z0)
            .with_dz_sign(dz_sign)
            .with_cdc_hits(hits);
        let factory = TrackCandidateFactory::new(config);
        let candidate = factory.fit(&seed).unwrap();

        assert_eq!(candidate.mode, FitMode::CdcOnly);
        assert!(candidate.converged);
        assert_eq!(candidate.cdc_hits.len(), 17);
        // Path-length ordering starts at the highest z
        assert_relative_eq!(candidate.z, z0 + 8.0, epsilon = 1e-6);
        assert!(candidate.momentum.z < 0.0);
        assert!(candidate.cdc_updates.iter().all(|u| u.resi.abs() < 0.01));

        let expected = line_point(&truth, z0, candidate.z);
        assert_relative_eq!(candidate.state[0], expected.x, epsilon = 0.05);
        assert_relative_eq!(candidate.state[1], expected.y, epsilon = 0.05);
    }

    #[test]
    fn test_seed_without_hits_is_rejected() {
        let factory = TrackCandidateFactory::new(FitConfig::default());
        let seed = TrackSeed::new(Vector4::zeros(), 65.0);
        assert!(matches!(factory.fit(&seed), Err(FitError::InsufficientHits(0))));
    }

    #[test]
    fn test_skip_flags() {
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 12, &FitConfig::default());

        let skip_fdc = FitConfig {
            skip_fdc: true,
            ..FitConfig::default()
        };
        let factory = TrackCandidateFactory::new(skip_fdc);
        let result = factory.fit(&forward_seed(&truth, hits.clone()));
        assert!(matches!(result, Err(FitError::InsufficientHits(0))));

        let skip_plane = FitConfig {
            plane_to_skip: Some(3),
            ..FitConfig::default()
        };
        let factory = TrackCandidateFactory::new(skip_plane);
        let candidate = factory.fit(&forward_seed(&truth, hits)).unwrap();
        assert_eq!(candidate.fdc_hits.len(), 11);
        assert!(candidate.fdc_hits.iter().all(|h| h.wire.layer != 3));
    }

    #[test]
    fn test_too_few_measurements() {
        let config = FitConfig::default();
        let truth = forward_truth();
        let hits = fdc_hits(&truth, 65.0, 2, &config);
        let factory = TrackCandidateFactory::new(config);
        assert!(matches!(
            factory.fit(&forward_seed(&truth, hits)),
            Err(FitError::InsufficientHits(4))
        ));
    }

    #[test]
    fn test_workspace_reuse_is_deterministic() {
        let config = FitConfig::default();
        let truth = forward_truth();
        let seed = forward_seed(&truth, fdc_hits(&truth, 65.0, 12, &config));
        let factory = TrackCandidateFactory::new(config);

        let mut workspace = FitWorkspace::new();
        let first = factory.fit_with_workspace(&seed, &mut workspace).unwrap();
        assert_eq!(workspace.phase(), FitPhase::Converged);
        assert!(workspace.capacity() > 0);

        let second = factory.fit_with_workspace(&seed, &mut workspace).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_process_event_attaches_cdc_hits() {
        let config = FitConfig::default();
        let truth = Vector4::new(0.0, 0.0, 0.2, 0.1);
        let z0 = 65.0;
        let dirs = wire_dirs();
        let docas = [0.15, 0.3, 0.45];

        let mut event = EventHits::new(7);
        event.fdc_hits = fdc_hits(&truth, z0, 12, &config);
        event.cdc_hits = (0..9)
            .map(|k| {
                let z = 110.0 + 5.0 * k as f64;
                let side = if k % 2 == 0 { 1.0 } else { -1.0 };
                cdc_hit(&truth, z0, z, dirs[k % 4], docas[k % 3], side, 1.0, &config)
            })
            .collect();
        let far_origin = line_point(&truth, z0, 130.0) + Vector3::new(20.0, 0.0, 0.0);
        let far = CdcHit::new(
            Arc::new(CdcWire::new(5, 3, far_origin, Vector3::z(), 150.0)),
            50.0,
        );
        event.cdc_hits.push(far.clone());

        let seed = TrackSeed::new(truth + Vector4::new(0.05, -0.05, 0.0005, 0.0005), z0)
            .with_fdc_hits(event.fdc_hits.clone());
        let factory = TrackCandidateFactory::new(config);

        let matched = factory.match_cdc_hits(&seed, &event.cdc_hits, &[false; 10]);
        assert_eq!(matched, (0..9).collect::<Vec<_>>());

        let candidates = factory.process_event(&event, &[seed]);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.mode, FitMode::Combined);
        assert!(candidate.converged);
        assert_eq!(candidate.cdc_hits.len(), 9);
        assert!(!candidate.cdc_hits.contains(&far));
        assert_eq!(candidate.fdc_hits.len(), 12);
    }

    #[test]
    fn test_process_event_drops_failed_seeds() {
        let factory = TrackCandidateFactory::new(FitConfig::default());
        let event = EventHits::new(1);
        let seeds = vec![TrackSeed::new(Vector4::zeros(), 65.0)];
        assert!(factory.process_event(&event, &seeds).is_empty());
    }

    #[test]
    fn test_line_seeder() {
        let config = FitConfig::default();
        let truth = forward_truth();
        let mut hits = fdc_hits(&truth, 65.0, 12, &config);
        let seeder = LineSeeder::new(65.0, 0.0);

        assert!(seeder.seed_from_fdc(&hits[..4]).is_none());

        let mut outlier = hits[5].clone();
        outlier.s += 10.0;
        hits.push(outlier.clone());

        let seed = seeder.seed_from_fdc(&hits).unwrap();
        assert_eq!(seed.fdc_hits.len(), 12);
        assert!(!seed.fdc_hits.contains(&outlier));
        assert_eq!(seed.z, 65.0);

        // Pseudo points sit a quarter cell off the line
        let mid = 187.0;
        let expected = line_point(&truth, 65.0, mid);
        let x = seed.state[0] + seed.state[2] * (mid - 65.0);
        let y = seed.state[1] + seed.state[3] * (mid - 65.0);
        assert!((x - expected.x).abs() < 0.5);
        assert!((y - expected.y).abs() < 0.5);
    }
}
