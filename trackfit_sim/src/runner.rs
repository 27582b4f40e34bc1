//! Scenario runner - simulates events, fits them and scores the candidates
//! against the truth.

use nalgebra::Vector4;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};
use trackfit_core::{FitConfig, FitMode, LineSeeder, TrackCandidate, TrackCandidateFactory, TrackSeed};
use trackfit_env::{EventHits, FdcHit};

use crate::detector::ToyDetector;
use crate::oracle::{Oracle, OracleConfig, TruthTrack};
use crate::scenarios::ScenarioId;

/// Score of one simulated event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventOutcome {
    pub event: u64,
    pub fitted: bool,
    pub converged: bool,
    pub mode: Option<FitMode>,

    /// Transverse distance of the candidate from the truth line at its z (cm)
    pub position_error: f64,

    /// Difference of the slopes
    pub slope_error: f64,

    pub chi2_per_ndof: f64,
    pub cdc_hits: usize,
    pub fdc_hits: usize,

    /// Whether the injected wrong-wire hit stayed out of the candidate
    pub misassigned_rejected: Option<bool>,
}

impl EventOutcome {
    fn unfitted(event: u64) -> Self {
        Self {
            event,
            fitted: false,
            converged: false,
            mode: None,
            position_error: f64::NAN,
            slope_error: f64::NAN,
            chi2_per_ndof: f64::NAN,
            cdc_hits: 0,
            fdc_hits: 0,
            misassigned_rejected: None,
        }
    }

    fn score(event: u64, candidate: &TrackCandidate, truth: &TruthTrack, bad: Option<&FdcHit>) -> Self {
        let expected = truth.point_at(candidate.z);
        let dx = candidate.state[0] - expected.x;
        let dy = candidate.state[1] - expected.y;
        let dtx = candidate.state[2] - truth.state[2];
        let dty = candidate.state[3] - truth.state[3];
        Self {
            event,
            fitted: true,
            converged: candidate.converged,
            mode: Some(candidate.mode),
            position_error: dx.hypot(dy),
            slope_error: dtx.hypot(dty),
            chi2_per_ndof: candidate.chi2_per_ndof(),
            cdc_hits: candidate.cdc_hits.len(),
            fdc_hits: candidate.fdc_hits.len(),
            misassigned_rejected: bad.map(|hit| !candidate.fdc_hits.contains(hit)),
        }
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    pub events: usize,
    pub fitted: usize,
    pub converged: usize,

    /// Fitted events / simulated events
    pub efficiency: f64,

    /// RMS of the transverse position error (cm)
    pub position_rms: f64,

    /// RMS of the slope error
    pub slope_rms: f64,

    pub mean_chi2_per_ndof: f64,

    /// Fitted events whose candidate carries hits of both detectors
    pub combined: usize,

    /// Events whose wrong-wire hit stayed out of the candidate
    pub misassigned_rejected: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Pass thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Minimum fitted fraction (default: 0.8)
    pub min_efficiency: f64,

    /// Maximum position RMS for FDC fits (cm, default: 0.1)
    pub max_fdc_position_rms: f64,

    /// Maximum position RMS for CDC-only fits (cm, default: 0.5)
    pub max_cdc_position_rms: f64,

    /// Minimum fraction of fits that picked up CDC hits (default: 0.5)
    pub min_combined_fraction: f64,

    /// Minimum fraction of wrong-wire hits kept out (default: 0.8)
    pub min_rejection_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_efficiency: 0.8,
            max_fdc_position_rms: 0.1,
            max_cdc_position_rms: 0.5,
            min_combined_fraction: 0.5,
            min_rejection_rate: 0.8,
        }
    }
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Events per scenario
    events: usize,

    detector: ToyDetector,
    factory: TrackCandidateFactory,
    thresholds: Thresholds,
}

impl ScenarioRunner {
    /// Creates a runner with the default fit configuration.
    pub fn new(seed: u64, events: usize) -> Self {
        Self::with_config(seed, events, FitConfig::default())
    }

    pub fn with_config(seed: u64, events: usize, config: FitConfig) -> Self {
        Self {
            seed,
            events,
            detector: ToyDetector::default(),
            factory: TrackCandidateFactory::new(config),
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Simulates and fits every event, in parallel, then scores the scenario.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(
            scenario = scenario.name(),
            seed = self.seed,
            events = self.events,
            "{}",
            scenario.description()
        );

        let outcomes: Vec<EventOutcome> = (0..self.events as u64)
            .into_par_iter()
            .map(|event| self.run_event(scenario, event))
            .collect();

        self.score(scenario, &outcomes)
    }

    /// Simulates and fits one event. The event's RNG seed is derived from the
    /// runner seed and the event number only.
    pub fn run_event(&self, scenario: ScenarioId, event: u64) -> EventOutcome {
        let event_seed = self.seed.wrapping_add(event);
        let (hits, truth, seeds, bad) = self.simulate(scenario, event, event_seed);

        let candidates = self.factory.process_event(&hits, &seeds);
        let outcome = match candidates.first() {
            Some(candidate) => EventOutcome::score(event, candidate, &truth, bad.as_ref()),
            None => EventOutcome::unfitted(event),
        };
        debug!(
            event,
            fitted = outcome.fitted,
            cdc = hits.cdc_hits.len(),
            fdc = hits.fdc_hits.len(),
            position_error = outcome.position_error,
            "event"
        );
        outcome
    }

    /// Hits, truth, seeds and the injected wrong-wire hit of one event.
    pub fn simulate(
        &self,
        scenario: ScenarioId,
        event: u64,
        event_seed: u64,
    ) -> (EventHits, TruthTrack, Vec<TrackSeed>, Option<FdcHit>) {
        let oracle_config = OracleConfig {
            noise_cdc_hits: if scenario == ScenarioId::CdcCosmic { 3 } else { 0 },
            ..OracleConfig::default()
        };
        let target_z = oracle_config.target_z;
        let mut oracle = Oracle::new(event_seed, &self.detector, self.factory.config())
            .with_config(oracle_config);

        let truth = match scenario {
            ScenarioId::FdcForward | ScenarioId::Misassigned => {
                oracle.forward_track(2f64.to_radians(), 6f64.to_radians())
            }
            ScenarioId::Combined => oracle.forward_track(8f64.to_radians(), 12f64.to_radians()),
            ScenarioId::CdcCosmic => oracle.cosmic_track(),
        };
        let mut hits = oracle.event(event, &truth, scenario.uses_cdc(), scenario.uses_fdc());

        let mut seeds = match scenario {
            ScenarioId::CdcCosmic => {
                vec![smeared_seed(&truth, event_seed).with_cdc_hits(hits.cdc_hits.clone())]
            }
            _ => LineSeeder::new(target_z, 0.0).seed_event(&hits),
        };

        let mut bad = None;
        if scenario == ScenarioId::Misassigned {
            bad = oracle.misassign(&hits.fdc_hits);
            if let Some(hit) = &bad {
                hits.fdc_hits.push(hit.clone());
                for seed in &mut seeds {
                    seed.fdc_hits.push(hit.clone());
                }
            }
        }

        (hits, truth, seeds, bad)
    }

    fn score(&self, scenario: ScenarioId, outcomes: &[EventOutcome]) -> ScenarioResult {
        let fitted: Vec<&EventOutcome> = outcomes.iter().filter(|o| o.fitted).collect();
        let n = fitted.len();
        let rms = |f: fn(&EventOutcome) -> f64| {
            if n == 0 {
                return f64::NAN;
            }
            (fitted.iter().map(|o| f(o).powi(2)).sum::<f64>() / n as f64).sqrt()
        };
        let position_rms = rms(|o| o.position_error);
        let slope_rms = rms(|o| o.slope_error);
        let mean_chi2_per_ndof = if n == 0 {
            f64::NAN
        } else {
            fitted.iter().map(|o| o.chi2_per_ndof).sum::<f64>() / n as f64
        };
        let efficiency = if outcomes.is_empty() {
            0.0
        } else {
            n as f64 / outcomes.len() as f64
        };
        let combined = fitted
            .iter()
            .filter(|o| o.mode == Some(FitMode::Combined))
            .count();
        let misassigned_rejected = fitted
            .iter()
            .filter(|o| o.misassigned_rejected == Some(true))
            .count();

        let t = &self.thresholds;
        let failure_reason = if efficiency < t.min_efficiency {
            Some(format!(
                "Efficiency {:.2} below {:.2}",
                efficiency, t.min_efficiency
            ))
        } else {
            match scenario {
                ScenarioId::FdcForward | ScenarioId::Misassigned | ScenarioId::Combined
                    if !(position_rms < t.max_fdc_position_rms) =>
                {
                    Some(format!(
                        "Position RMS {:.3} cm exceeds {:.3} cm",
                        position_rms, t.max_fdc_position_rms
                    ))
                }
                ScenarioId::CdcCosmic if !(position_rms < t.max_cdc_position_rms) => Some(format!(
                    "Position RMS {:.3} cm exceeds {:.3} cm",
                    position_rms, t.max_cdc_position_rms
                )),
                ScenarioId::Combined
                    if (combined as f64) < t.min_combined_fraction * n as f64 =>
                {
                    Some(format!("Only {}/{} fits picked up CDC hits", combined, n))
                }
                ScenarioId::Misassigned
                    if (misassigned_rejected as f64) < t.min_rejection_rate * n as f64 =>
                {
                    Some(format!(
                        "Wrong-wire hit kept in {}/{} fits",
                        n - misassigned_rejected,
                        n
                    ))
                }
                _ => None,
            }
        };

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            events: outcomes.len(),
            fitted: n,
            converged: fitted.iter().filter(|o| o.converged).count(),
            efficiency,
            position_rms,
            slope_rms,
            mean_chi2_per_ndof,
            combined,
            misassigned_rejected,
            failure_reason,
        }
    }
}

/// Truth state smeared the way a coarse pattern-recognition stage would be.
fn smeared_seed(truth: &TruthTrack, event_seed: u64) -> TrackSeed {
    let mut rng = ChaCha8Rng::seed_from_u64(event_seed ^ 0x5eed);
    let mut n = || -> f64 { rng.sample(StandardNormal) };
    let offset = Vector4::new(0.3 * n(), 0.3 * n(), 0.02 * n(), 0.02 * n());
    TrackSeed::new(truth.state + offset, truth.z)
        .with_t0(truth.t0)
        .with_dz_sign(truth.dz_sign)
}

// ============================================================================
// TESTS
// ============================================================================
