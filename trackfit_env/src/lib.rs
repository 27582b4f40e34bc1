//! TrackFit Environment Abstraction Layer
//!
//! This crate holds everything the fitting core consumes from the outside
//! world, so that the numerical code never reaches into a framework:
//! - Hit and wire records (`CdcHit`, `FdcHit`, `CdcWire`, `FdcWire`)
//! - Wire lookup (`WireGeometry`) and DOCA queries (`WireDistance`)
//! - The swim service (`Propagator`)
//! - Calibration constants (`CalibrationSource`, `MapCalibration`)
//! - Per-event hit collections (`HitSource`, `EventHits`)
//!
//! The simulation harness and any production host implement these traits;
//! the core only ever sees them through references.
//!
//! # Example
//!
//! ```ignore
//! use trackfit_env::{CalibrationSource, MapCalibration};
//!
//! let calib = MapCalibration::from_json_str(&std::fs::read_to_string(path)?)?;
//! let chi2_cut = calib.constant_or("TRKFIND:CHI2CUT", 15.0)?;
//! ```

mod calibration;
mod error;
mod geometry;
mod hits;
mod propagation;
mod types;

pub use calibration::{CalibrationSource, MapCalibration};
pub use error::{EnvError, EnvResult};
pub use geometry::{LineApproach, WireApproach, WireDistance, WireGeometry, WireLine};
pub use hits::{EventHits, HitSource};
pub use propagation::Propagator;
pub use types::{CdcHit, CdcWire, FdcHit, FdcWire, StateJacobian, StateVector};
