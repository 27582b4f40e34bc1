//! TrackFit Simulation Harness
//!
//! A controlled environment in which the fitter runs on events whose truth
//! is known:
//! - **Detector**: a toy straw barrel and planar-chamber stack (`ToyDetector`)
//! - **Oracle**: truth tracks and the hits they leave, smeared with the
//!   fitter's own drift model
//! - **Runner**: parallel event fitting and scoring per scenario
//!
//! All randomness derives from one 64-bit seed: event `i` of a run uses
//! `seed + i`, so results do not depend on thread scheduling.
//!
//! # Usage
//!
//! ```ignore
//! use trackfit_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 100);
//! let result = runner.run(ScenarioId::FdcForward);
//! assert!(result.passed);
//! ```

mod detector;
mod oracle;
mod runner;
pub mod scenarios;

pub use detector::{DetectorConfig, ToyDetector};
pub use oracle::{Oracle, OracleConfig, TruthTrack};
pub use runner::{EventOutcome, ScenarioResult, ScenarioRunner, Thresholds};

use std::io::Read;
use thiserror::Error;
use trackfit_core::{ConfigError, FitConfig};
use trackfit_env::{EnvError, MapCalibration};

/// Failures while setting up a run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Cannot read calibration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed calibration: {0}")]
    Calibration(#[from] EnvError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Fit configuration from a JSON calibration store.
pub fn load_fit_config<R: Read>(reader: R) -> Result<FitConfig, SimError> {
    let calib = MapCalibration::from_reader(reader)?;
    Ok(FitConfig::from_calibration(&calib)?)
}
