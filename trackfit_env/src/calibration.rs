//! Calibration-constant lookup.
//!
//! Constants are loaded once per run and are immutable while events are
//! processed. Keys follow the `SYSTEM:NAME` convention, e.g. `CDC:RES_PARMS`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

use crate::error::{EnvError, EnvResult};

/// Key-value store of calibration constants and tables.
pub trait CalibrationSource {
    /// Scalar constant for `key`.
    fn constant(&self, key: &str) -> EnvResult<f64>;

    /// Table (vector of values) for `key`.
    fn table(&self, key: &str) -> EnvResult<Vec<f64>>;

    /// Scalar constant, or `default` when the key is absent.
    ///
    /// Present-but-invalid entries are still reported as errors.
    fn constant_or(&self, key: &str, default: f64) -> EnvResult<f64> {
        match self.constant(key) {
            Err(EnvError::MissingConstant(_)) => Ok(default),
            other => other,
        }
    }
}

/// In-memory calibration store, (de)serializable as JSON:
///
/// ```json
/// { "constants": { "TRKFIND:CHI2CUT": 20.0 },
///   "tables":    { "CDC:RES_PARMS": [0.06, 0.012, 0.0] } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapCalibration {
    #[serde(default)]
    constants: HashMap<String, f64>,

    #[serde(default)]
    tables: HashMap<String, Vec<f64>>,
}

impl MapCalibration {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a scalar constant.
    pub fn with_constant(mut self, key: impl Into<String>, value: f64) -> Self {
        self.constants.insert(key.into(), value);
        self
    }

    /// Adds (or replaces) a table.
    pub fn with_table(mut self, key: impl Into<String>, values: Vec<f64>) -> Self {
        self.tables.insert(key.into(), values);
        self
    }

    /// Parses a store from a JSON string.
    pub fn from_json_str(json: &str) -> EnvResult<Self> {
        serde_json::from_str(json).map_err(|e| EnvError::Parse(e.to_string()))
    }

    /// Parses a store from a reader (e.g. an open file).
    pub fn from_reader<R: Read>(reader: R) -> EnvResult<Self> {
        serde_json::from_reader(reader).map_err(|e| EnvError::Parse(e.to_string()))
    }

    /// Serializes the store as pretty JSON.
    pub fn to_json_string(&self) -> EnvResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EnvError::Parse(e.to_string()))
    }

    /// Number of scalar constants plus tables.
    pub fn len(&self) -> usize {
        self.constants.len() + self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CalibrationSource for MapCalibration {
    fn constant(&self, key: &str) -> EnvResult<f64> {
        let value = self
            .constants
            .get(key)
            .copied()
            .ok_or_else(|| EnvError::missing(key))?;
        if !value.is_finite() {
            return Err(EnvError::invalid(key, "value is not finite"));
        }
        Ok(value)
    }

    fn table(&self, key: &str) -> EnvResult<Vec<f64>> {
        let values = self.tables.get(key).ok_or_else(|| EnvError::missing(key))?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EnvError::invalid(key, "table contains non-finite values"));
        }
        Ok(values.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================
