//! Ground truth oracle for simulation.
//!
//! The Oracle owns the "true" tracks of an event and turns them into
//! detector hits:
//! - Straight truth lines from a seeded RNG
//! - Drift distances smeared with the resolution of the drift model
//! - Drift times from the inverse of the same model, plus time of flight

use nalgebra::{Vector3, Vector4};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use trackfit_core::{DriftModel, FitConfig};
use trackfit_env::{CdcHit, EventHits, FdcHit, StateVector, WireGeometry};

use crate::detector::ToyDetector;

/// Bisection steps when inverting a drift function.
const INVERSION_STEPS: usize = 60;

/// A true straight track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthTrack {
    /// `(x, y, tx, ty)` at `z`
    pub state: StateVector,
    pub z: f64,

    /// Time at `z` (ns)
    pub t0: f64,

    /// Direction of travel in z (+1 or -1)
    pub dz_sign: f64,
}

impl TruthTrack {
    pub fn point_at(&self, z: f64) -> Vector3<f64> {
        let dz = z - self.z;
        Vector3::new(
            self.state[0] + self.state[2] * dz,
            self.state[1] + self.state[3] * dz,
            z,
        )
    }

    /// Direction with unit z component.
    pub fn direction(&self) -> Vector3<f64> {
        Vector3::new(self.state[2], self.state[3], 1.0)
    }

    /// Signed path length from `self.z` to `z`.
    pub fn path_length_to(&self, z: f64) -> f64 {
        self.dz_sign * (z - self.z) * self.direction().norm()
    }

    pub fn time_at(&self, z: f64, beta_c: f64) -> f64 {
        self.t0 + self.path_length_to(z) / beta_c
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Hit-generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleConfig {
    /// Cathode (along-wire) resolution (cm, default: 0.02)
    pub cathode_sigma: f64,

    /// Smear drift distances with the drift-model resolution (default: true)
    pub smear_drift: bool,

    /// Random CDC noise hits per event (default: 0)
    pub noise_cdc_hits: usize,

    /// z of forward-track vertices (cm, default: 65.0)
    pub target_z: f64,

    /// Transverse spread of the vertex (cm, default: 0.1)
    pub vertex_sigma: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cathode_sigma: 0.02,
            smear_drift: true,
            noise_cdc_hits: 0,
            target_z: 65.0,
            vertex_sigma: 0.1,
        }
    }
}

// ============================================================================
// ORACLE
// ============================================================================

/// Generates truth tracks and their hits for one event.
pub struct Oracle<'a> {
    detector: &'a ToyDetector,
    drift: DriftModel,
    config: OracleConfig,
    rng: ChaCha8Rng,
    beta_c: f64,
    cdc_straw_radius: f64,
    cdc_max_drift_time: f64,
    fdc_max_drift_time: f64,
}

impl<'a> Oracle<'a> {
    /// Creates an Oracle whose hits follow the drift model of `fit_config`.
    pub fn new(seed: u64, detector: &'a ToyDetector, fit_config: &FitConfig) -> Self {
        let (p, m) = (fit_config.assumed_momentum, fit_config.mass);
        let beta = if p > 0.0 {
            1.0 / (1.0 + m * m / (p * p)).sqrt()
        } else {
            1.0
        };
        Self {
            detector,
            drift: DriftModel::new(fit_config),
            config: OracleConfig::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            beta_c: beta * fit_config.selector.speed_of_light,
            cdc_straw_radius: fit_config.drift.cdc_straw_radius,
            cdc_max_drift_time: fit_config.drift.cdc_max_drift_time(),
            fdc_max_drift_time: fit_config.drift.fdc_max_drift_time,
        }
    }

    pub fn with_config(mut self, config: OracleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn beta_c(&self) -> f64 {
        self.beta_c
    }

    fn gaussian(&mut self, sigma: f64) -> f64 {
        let n: f64 = self.rng.sample(StandardNormal);
        sigma * n
    }

    // ========================================================================
    // TRUTH TRACKS
    // ========================================================================

    /// Track from the target with polar angle in `[theta_min, theta_max]` (rad).
    pub fn forward_track(&mut self, theta_min: f64, theta_max: f64) -> TruthTrack {
        let theta = self.rng.gen_range(theta_min..theta_max);
        let phi = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let x = self.gaussian(self.config.vertex_sigma);
        let y = self.gaussian(self.config.vertex_sigma);
        let t = theta.tan();
        TruthTrack {
            state: Vector4::new(x, y, t * phi.cos(), t * phi.sin()),
            z: self.config.target_z,
            t0: 0.0,
            dz_sign: 1.0,
        }
    }

    /// Cosmic ray crossing the barrel near the beam line.
    pub fn cosmic_track(&mut self) -> TruthTrack {
        let theta = self.rng.gen_range(40f64.to_radians()..70f64.to_radians());
        let phi = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let z = self.rng.gen_range(60.0..120.0);
        let x = self.gaussian(1.0);
        let y = self.gaussian(1.0);
        let dz_sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let t = theta.tan();
        TruthTrack {
            state: Vector4::new(x, y, t * phi.cos(), t * phi.sin()),
            z,
            t0: 0.0,
            dz_sign,
        }
    }

    // ========================================================================
    // HITS
    // ========================================================================

    /// Smallest time at which `f` reaches `d`.
    fn invert(f: impl Fn(f64) -> f64, d: f64, t_max: f64) -> f64 {
        let (mut lo, mut hi) = (0.0, t_max);
        for _ in 0..INVERSION_STEPS {
            let mid = 0.5 * (lo + hi);
            if f(mid) < d {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    fn cdc_drift_time(&self, d: f64) -> f64 {
        Self::invert(|t| self.drift.cdc_drift_distance(t), d, self.cdc_max_drift_time)
    }

    fn fdc_drift_time(&self, d: f64) -> f64 {
        Self::invert(|t| self.drift.fdc_drift_distance(t), d, self.fdc_max_drift_time)
    }

    /// Hits on every straw the track passes through.
    pub fn cdc_hits(&mut self, truth: &TruthTrack) -> Vec<CdcHit> {
        let detector = self.detector;
        let point = truth.point_at(truth.z);
        let dir = truth.direction();
        let mut hits = Vec::new();

        for wire in detector.rings().iter().flatten() {
            let Ok(approach) = wire.line().closest_approach(&point, &dir) else {
                continue;
            };
            let d = approach.doca();
            if d >= self.cdc_straw_radius || approach.wire_param.abs() > 0.5 * wire.length {
                continue;
            }

            let mut measured = d;
            if self.config.smear_drift {
                let sigma = self.drift.cdc_drift_variance(self.cdc_drift_time(d)).sqrt();
                measured = (d + self.gaussian(sigma)).abs().min(self.cdc_straw_radius);
            }

            let z = point.z + approach.track_param * dir.z;
            let time = truth.time_at(z, self.beta_c) + self.cdc_drift_time(measured);
            hits.push(CdcHit::new(wire.clone(), time));
        }

        hits
    }

    /// One pseudo hit per plane the track crosses inside the active area.
    pub fn fdc_hits(&mut self, truth: &TruthTrack) -> Vec<FdcHit> {
        let detector = self.detector;
        let dir = truth.direction();
        let radius = detector.config().fdc_radius;
        let half_cell = 0.5 * detector.config().fdc_wire_spacing;
        let mut hits = Vec::new();

        for (p, plane) in detector.planes().iter().enumerate() {
            let Some(first) = plane.first() else {
                continue;
            };
            let pos = truth.point_at(first.z);
            if pos.xy().norm() > radius {
                continue;
            }
            let (sin, cos) = first.angle.sin_cos();
            let u = pos.x * cos - pos.y * sin;
            let Some(wire) = detector.nearest_fdc_wire(p, u) else {
                continue;
            };
            let Ok(approach) = wire.line().closest_approach(&pos, &dir) else {
                continue;
            };

            let d = approach.doca();
            let mut measured = d;
            if self.config.smear_drift {
                let sigma = self.drift.fdc_drift_variance(self.fdc_drift_time(d)).sqrt();
                measured = (d + self.gaussian(sigma)).abs().min(half_cell);
            }
            let cathode = approach.wire_param + self.gaussian(self.config.cathode_sigma);

            let time = truth.time_at(first.z, self.beta_c) + self.fdc_drift_time(measured);
            hits.push(FdcHit::new(wire.clone(), time, cathode));
        }

        hits
    }

    /// Random straws with random drift times.
    pub fn cdc_noise(&mut self) -> Vec<CdcHit> {
        let detector = self.detector;
        let rings = detector.rings();
        if rings.is_empty() {
            return Vec::new();
        }
        (0..self.config.noise_cdc_hits)
            .filter_map(|_| {
                let ring = &rings[self.rng.gen_range(0..rings.len())];
                if ring.is_empty() {
                    return None;
                }
                let wire = ring[self.rng.gen_range(0..ring.len())].clone();
                let time = self.rng.gen_range(0.0..self.cdc_max_drift_time);
                Some(CdcHit::new(wire, time))
            })
            .collect()
    }

    /// Copy of the middle hit moved two wires over, as pattern recognition
    /// would produce by mis-assigning a neighbouring track's hit.
    pub fn misassign(&self, hits: &[FdcHit]) -> Option<FdcHit> {
        let hit = hits.get(hits.len() / 2)?;
        let wire = self
            .detector
            .fdc_wire(hit.wire.layer, hit.wire.wire + 2)
            .or_else(|| self.detector.fdc_wire(hit.wire.layer, hit.wire.wire.checked_sub(2)?))?;
        Some(FdcHit::new(wire, hit.time, hit.s))
    }

    /// Hits of `truth` in the requested detectors, plus noise.
    pub fn event(&mut self, number: u64, truth: &TruthTrack, cdc: bool, fdc: bool) -> EventHits {
        let mut event = EventHits::new(number);
        if cdc {
            event.cdc_hits = self.cdc_hits(truth);
            let noise = self.cdc_noise();
            event.cdc_hits.extend(noise);
        }
        if fdc {
            event.fdc_hits = self.fdc_hits(truth);
        }
        event
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use trackfit_env::HitSource;

    #[test]
    fn test_forward_track_crosses_all_planes() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let mut oracle = Oracle::new(7, &detector, &config);
        let truth = oracle.forward_track(2f64.to_radians(), 6f64.to_radians());
        let hits = oracle.fdc_hits(&truth);

        assert_eq!(hits.len(), 24);
        for hit in &hits {
            let pos = truth.point_at(hit.wire.z);
            let approach = hit
                .wire
                .line()
                .closest_approach(&pos, &truth.direction())
                .unwrap();
            assert!(approach.doca() <= 0.5 + 1e-9);
            // Cathode smearing is 0.02 cm
            assert!((hit.s - approach.wire_param).abs() < 0.2);
        }
    }

    #[test]
    fn test_unsmeared_times_invert_drift_model() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let mut oracle = Oracle::new(3, &detector, &config).with_config(OracleConfig {
            smear_drift: false,
            cathode_sigma: 0.0,
            ..OracleConfig::default()
        });
        let truth = oracle.forward_track(2f64.to_radians(), 6f64.to_radians());
        let drift = DriftModel::new(&config);
        let beta_c = oracle.beta_c();

        for hit in oracle.fdc_hits(&truth) {
            let approach = hit
                .wire
                .line()
                .closest_approach(&truth.point_at(hit.wire.z), &truth.direction())
                .unwrap();
            let tdrift = hit.time - truth.time_at(hit.wire.z, beta_c);
            assert_relative_eq!(drift.fdc_drift_distance(tdrift), approach.doca(), epsilon = 1e-6);
            assert_relative_eq!(hit.s, approach.wire_param, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cosmic_hits_inside_straws() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let mut oracle = Oracle::new(11, &detector, &config);
        let truth = oracle.cosmic_track();
        let hits = oracle.cdc_hits(&truth);

        // Crosses every ring on both sides of the beam line
        assert!(hits.len() >= 12, "only {} hits", hits.len());
        for hit in &hits {
            let approach = hit
                .wire
                .line()
                .closest_approach(&truth.point_at(truth.z), &truth.direction())
                .unwrap();
            assert!(approach.doca() < 0.78);
        }
    }

    #[test]
    fn test_same_seed_same_event() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let generate = |seed| {
            let mut oracle = Oracle::new(seed, &detector, &config);
            let truth = oracle.forward_track(8f64.to_radians(), 12f64.to_radians());
            oracle.event(1, &truth, true, true)
        };
        assert_eq!(generate(5), generate(5));
        assert_ne!(generate(5).fdc_hits(), generate(6).fdc_hits());
    }

    #[test]
    fn test_misassign_moves_wire() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let mut oracle = Oracle::new(9, &detector, &config);
        let truth = oracle.forward_track(2f64.to_radians(), 6f64.to_radians());
        let hits = oracle.fdc_hits(&truth);

        let bad = oracle.misassign(&hits).unwrap();
        let original = &hits[hits.len() / 2];
        assert_eq!(bad.wire.layer, original.wire.layer);
        assert_eq!(bad.wire.wire.abs_diff(original.wire.wire), 2);
        assert_relative_eq!((bad.wire.u - original.wire.u).abs(), 2.0, epsilon = 1e-12);
        assert!(oracle.misassign(&[]).is_none());
    }

    #[test]
    fn test_noise_hits() {
        let detector = ToyDetector::default();
        let config = FitConfig::default();
        let mut oracle = Oracle::new(2, &detector, &config).with_config(OracleConfig {
            noise_cdc_hits: 5,
            ..OracleConfig::default()
        });
        assert_eq!(oracle.cdc_noise().len(), 5);
    }

    proptest! {
        #[test]
        fn prop_hits_follow_the_truth(seed in any::<u64>()) {
            let detector = ToyDetector::default();
            let config = FitConfig::default();
            let mut oracle = Oracle::new(seed, &detector, &config);
            let truth = oracle.forward_track(8f64.to_radians(), 12f64.to_radians());
            let event = oracle.event(0, &truth, true, true);

            for hit in event.fdc_hits() {
                let approach = hit
                    .wire
                    .line()
                    .closest_approach(&truth.point_at(hit.wire.z), &truth.direction())
                    .unwrap();
                prop_assert!(approach.doca() <= 0.5 + 1e-9);
                prop_assert!(hit.time >= truth.time_at(hit.wire.z, oracle.beta_c()) - 1e-9);
            }
            for hit in event.cdc_hits() {
                prop_assert!(hit.tdrift.is_finite());
                prop_assert!(hit.tdrift >= 0.0);
            }
        }
    }
}
