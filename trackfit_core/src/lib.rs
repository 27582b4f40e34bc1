//! TrackFit Core - Straight-Line Track-Candidate Fitter
//!
//! Fits straight tracks through drift-chamber hits in four layers:
//! 1. **Drift physics**: drift time to drift distance and its variance (`DriftModel`)
//! 2. **Hit selection**: chi-square inclusion probabilities per hit (`HitSelector`)
//! 3. **Kalman fit**: reference trajectory, forward filter, RTS smoother
//!    (`TrajectoryBuilder`, `KalmanFitter`)
//! 4. **Candidates**: the iterate-until-stable loop that turns seeds into
//!    `TrackCandidate`s (`TrackCandidateFactory`)
//!
//! Everything from the outside world (wires, hits, calibration, swimming)
//! comes in through the `trackfit_env` traits.

pub mod candidate;
pub mod config;
pub mod drift;
pub mod error;
pub mod factory;
pub mod hit_selector;
pub mod kalman;
pub mod trajectory;

// Re-export key types for convenience
pub use candidate::{FitMode, TrackCandidate};
pub use config::{DriftConfig, FitConfig, SelectorConfig};
pub use drift::DriftModel;
pub use error::{ConfigError, FitError};
pub use factory::{FitWorkspace, LineSeeder, TrackCandidateFactory, TrackSeed};
pub use hit_selector::{chi2_probability, FitStage, HitSelector};
pub use kalman::{CdcUpdate, FdcUpdate, FitPhase, KalmanFitter};
pub use trajectory::{Direction, StraightLinePropagator, Trajectory, TrajectoryBuilder};
