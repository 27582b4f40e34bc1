//! Run configuration for the fitting core.
//!
//! A `FitConfig` is built once per run (from defaults or from a calibration
//! store) and passed by reference into every component constructor. Nothing
//! in the algorithmic code looks constants up on its own.

use serde::{Deserialize, Serialize};
use trackfit_env::CalibrationSource;

use crate::error::ConfigError;

/// Nominal CDC drift velocity (cm/ns), 55 µm/ns.
pub const NOMINAL_DRIFT_VELOCITY: f64 = 0.0055;

/// Charged pion mass (GeV/c²).
pub const PION_MASS: f64 = 0.13957;

/// Speed of light (cm/ns).
pub const SPEED_OF_LIGHT: f64 = 29.9792458;

// ============================================================================
// DRIFT MODEL
// ============================================================================

/// Calibration of the drift-physics model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Drift time (ns) at distance `i * cdc_table_step`, strictly increasing
    pub cdc_drift_table: Vec<f64>,

    /// Distance step of the drift table (default: 0.01 cm)
    pub cdc_table_step: f64,

    /// CDC resolution parameters `(p1, p2, p3)` of `(p1/(t+1) + p2 + p3 t)²`
    pub cdc_res_par: [f64; 3],

    /// Straw deformation, long side: rows `a`, `b`, `c` of the drift function
    pub long_drift_func: [[f64; 3]; 3],

    /// Straw deformation, short side
    pub short_drift_func: [[f64; 3]; 3],

    /// Drift time below which the table and the deformed function are blended (ns)
    pub sag_time_cut: f64,

    /// FDC drift polynomial `p0√t + p1 t + p2 t² + p3 t³`
    pub fdc_drift_func: [f64; 4],

    /// FDC anode resolution parameters `(r0, r1, r2)` of `(r0/(t+1) + r1 + r2 t²)²`
    pub fdc_drift_res: [f64; 3],

    /// Half cell of the FDC (default: 0.5 cm)
    pub fdc_max_drift_distance: f64,

    /// Largest FDC drift time the calibration covers (ns)
    pub fdc_max_drift_time: f64,

    /// Along-wire (cathode) variance (cm²)
    pub fdc_cathode_variance: f64,

    /// Constant drift velocity for quick distance estimates (cm/ns)
    pub drift_velocity: f64,

    /// Drift times above this are unphysical and get the sentinel variance (ns)
    pub max_physical_drift_time: f64,

    /// Variance returned for unusable drift times (cm²)
    pub sentinel_variance: f64,

    /// Inner radius of a CDC straw (cm)
    pub cdc_straw_radius: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        let cdc_table_step = 0.01;
        // 0 .. 0.78 cm at the nominal drift velocity
        let cdc_drift_table = (0..=78)
            .map(|i| i as f64 * cdc_table_step / NOMINAL_DRIFT_VELOCITY)
            .collect();

        Self {
            cdc_drift_table,
            cdc_table_step,
            cdc_res_par: [0.06, 0.012, 0.0],
            long_drift_func: [[0.0, 0.0, 0.0], [5.5, -1.0, 0.0], [0.0, 0.0, 0.0]],
            short_drift_func: [[0.0, 0.0, 0.0], [5.5, 1.0, 0.0], [0.0, 0.0, 0.0]],
            sag_time_cut: 250.0,
            fdc_drift_func: [0.0, NOMINAL_DRIFT_VELOCITY, 0.0, 0.0],
            fdc_drift_res: [0.03, 0.015, 0.0],
            fdc_max_drift_distance: 0.5,
            fdc_max_drift_time: 100.0,
            fdc_cathode_variance: 4.0e-4,
            drift_velocity: NOMINAL_DRIFT_VELOCITY,
            max_physical_drift_time: 2000.0,
            sentinel_variance: 1.0e6,
            cdc_straw_radius: 0.78,
        }
    }
}

impl DriftConfig {
    /// Largest drift time covered by the CDC table (ns).
    pub fn cdc_max_drift_time(&self) -> f64 {
        self.cdc_drift_table.last().copied().unwrap_or(0.0)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cdc_drift_table.len() < 2 {
            return Err(ConfigError::invalid(
                "CDC:DRIFT_TABLE",
                "needs at least two entries",
            ));
        }
        if self.cdc_drift_table.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::invalid(
                "CDC:DRIFT_TABLE",
                "drift times must be strictly increasing",
            ));
        }
        if self.cdc_table_step <= 0.0 {
            return Err(ConfigError::invalid("CDC:TABLE_STEP", "must be positive"));
        }
        if self.sag_time_cut <= 0.0 {
            return Err(ConfigError::invalid("CDC:SAG_TIME_CUT", "must be positive"));
        }
        if self.fdc_max_drift_distance <= 0.0 || self.fdc_max_drift_time <= 0.0 {
            return Err(ConfigError::invalid("FDC:MAX_DRIFT", "must be positive"));
        }
        if self.fdc_cathode_variance <= 0.0 {
            return Err(ConfigError::invalid("FDC:CATHODE_VARIANCE", "must be positive"));
        }
        if self.sentinel_variance <= 0.0 {
            return Err(ConfigError::invalid("SENTINEL_VARIANCE", "must be positive"));
        }
        if self.max_physical_drift_time < self.cdc_max_drift_time()
            || self.max_physical_drift_time < self.fdc_max_drift_time
        {
            return Err(ConfigError::invalid(
                "MAX_PHYSICAL_DRIFT_TIME",
                "must not be below the calibrated drift range",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// HIT SELECTOR
// ============================================================================

/// Empirical constants of the hit-inclusion probability model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// CDC cell size; base σ is `cell / √12` (default: 0.8 cm)
    pub cdc_cell_size: f64,

    /// FDC cell size (default: 0.5 cm)
    pub fdc_cell_size: f64,

    /// Minimum 1-dof probability for CDC hits (default: 0.05)
    pub min_cdc_probability: f64,

    /// Minimum 2-dof probability for FDC hits (default: 0.01)
    pub min_fdc_probability: f64,

    /// Momentum scale of the low-momentum broadening `1 + exp(-(p/g)²)` (GeV/c)
    pub low_momentum_scale: f64,

    /// Path-length scale of the `1 + s/L` broadening (cm)
    pub path_length_scale: f64,

    /// Reference mass for the FDC mass scaling (GeV/c²)
    pub pion_mass: f64,

    /// Speed of light (cm/ns)
    pub speed_of_light: f64,

    /// σ multiplier in the wire-based stage
    pub wire_based_factor: f64,

    /// σ multiplier in the helical (seed) stage
    pub helical_factor: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cdc_cell_size: 0.8,
            fdc_cell_size: 0.5,
            min_cdc_probability: 0.05,
            min_fdc_probability: 0.01,
            low_momentum_scale: 0.350 / std::f64::consts::LN_2.sqrt(),
            path_length_scale: 50.0,
            pion_mass: PION_MASS,
            speed_of_light: SPEED_OF_LIGHT,
            wire_based_factor: 2.0,
            helical_factor: 10.0,
        }
    }
}

// ============================================================================
// FIT
// ============================================================================

/// Configuration of the track-candidate fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub drift: DriftConfig,
    pub selector: SelectorConfig,

    /// Convergence cut on χ²/ndof (CHI2CUT, default: 15.0)
    pub chi2_cut: f64,

    /// Innovation χ² above which a hit is skipped during filtering (default: 25.0)
    pub hit_chi2_gate: f64,

    /// |pull| above which the worst hit is pruned (default: 4.0)
    pub pull_cut: f64,

    /// Enables outlier pruning (DO_PRUNING)
    pub do_pruning: bool,

    /// Hard iteration cap (default: 10)
    pub max_iterations: u32,

    /// Use drift times after the first (wire-based) pass
    pub use_drift_times: bool,

    /// Use FDC drift times in the time-based stage (USE_FDC_DRIFT_TIMES)
    pub use_fdc_drift_times: bool,

    /// Ignore CDC hits entirely (SKIP_CDC)
    pub skip_cdc: bool,

    /// Ignore FDC hits entirely (SKIP_FDC)
    pub skip_fdc: bool,

    /// Maximum DOCA for attaching CDC hits to FDC-only seeds (CDC_MATCH_DOCA, cm)
    pub cdc_match_doca: f64,

    /// FDC layer excluded from fits, for efficiency studies (PLANE_TO_SKIP)
    pub plane_to_skip: Option<u32>,

    /// Straight tracks carry no momentum information; this value is assumed (GeV/c)
    pub assumed_momentum: f64,

    /// Mass hypothesis (GeV/c², default: pion)
    pub mass: f64,

    /// Diagonal of the initial covariance of `(x, y, tx, ty)`
    pub initial_covariance: [f64; 4],

    /// Spacing of intermediate trajectory points (cm in z)
    pub trajectory_step: f64,

    /// Trajectory builds with more points than this fail
    pub max_trajectory_points: usize,

    /// Multiple-scattering slope variance per cm of path (default: 0)
    pub scattering_variance_per_cm: f64,

    /// Minimum degrees of freedom of an acceptable fit
    pub min_ndof: usize,

    /// Emit the best fit with `converged = false` when the fit does not converge
    pub emit_unconverged: bool,

    /// z at which candidates are reported (REFERENCE_Z); the first
    /// trajectory point when unset
    pub reference_z: Option<f64>,

    /// Propagation range in z (cm)
    pub z_min: f64,
    pub z_max: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            drift: DriftConfig::default(),
            selector: SelectorConfig::default(),
            chi2_cut: 15.0,
            hit_chi2_gate: 25.0,
            pull_cut: 4.0,
            do_pruning: true,
            max_iterations: 10,
            use_drift_times: true,
            use_fdc_drift_times: true,
            skip_cdc: false,
            skip_fdc: false,
            cdc_match_doca: 1.0,
            plane_to_skip: None,
            assumed_momentum: 5.0,
            mass: PION_MASS,
            initial_covariance: [1.0, 1.0, 0.01, 0.01],
            trajectory_step: 2.0,
            max_trajectory_points: 2000,
            scattering_variance_per_cm: 0.0,
            min_ndof: 1,
            emit_unconverged: true,
            reference_z: None,
            z_min: -500.0,
            z_max: 1000.0,
        }
    }
}

impl FitConfig {
    /// Builds a configuration from a calibration store.
    ///
    /// Drift tables and resolution parameters are required; every
    /// `TRKFIND:*` run parameter falls back to its default.
    pub fn from_calibration(calib: &dyn CalibrationSource) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.drift.cdc_drift_table = calib.table("CDC:DRIFT_TABLE")?;
        config.drift.cdc_res_par = fixed_table(calib, "CDC:RES_PARMS")?;
        config.drift.fdc_drift_func = fixed_table(calib, "FDC:DRIFT_FUNC")?;
        config.drift.fdc_drift_res = fixed_table(calib, "FDC:DRIFT_RES_PARMS")?;

        if let Some(long) = optional_table::<9>(calib, "CDC:DRIFT_FUNC_LONG")? {
            config.drift.long_drift_func = rows(long);
        }
        if let Some(short) = optional_table::<9>(calib, "CDC:DRIFT_FUNC_SHORT")? {
            config.drift.short_drift_func = rows(short);
        }

        let d = &mut config.drift;
        d.cdc_table_step = calib.constant_or("CDC:TABLE_STEP", d.cdc_table_step)?;
        d.fdc_cathode_variance =
            calib.constant_or("FDC:CATHODE_VARIANCE", d.fdc_cathode_variance)?;
        d.fdc_max_drift_time = calib.constant_or("FDC:MAX_DRIFT_TIME", d.fdc_max_drift_time)?;
        d.drift_velocity = calib.constant_or("CDC:DRIFT_VELOCITY", d.drift_velocity)?;

        config.chi2_cut = calib.constant_or("TRKFIND:CHI2CUT", config.chi2_cut)?;
        config.do_pruning = flag(calib, "TRKFIND:DO_PRUNING", config.do_pruning)?;
        config.use_fdc_drift_times =
            flag(calib, "TRKFIND:USE_FDC_DRIFT_TIMES", config.use_fdc_drift_times)?;
        config.skip_cdc = flag(calib, "TRKFIND:SKIP_CDC", config.skip_cdc)?;
        config.skip_fdc = flag(calib, "TRKFIND:SKIP_FDC", config.skip_fdc)?;
        config.cdc_match_doca = calib.constant_or("TRKFIND:CDC_MATCH_DOCA", config.cdc_match_doca)?;
        config.pull_cut = calib.constant_or("TRKFIND:PULL_CUT", config.pull_cut)?;
        config.assumed_momentum =
            calib.constant_or("TRKFIND:ASSUMED_MOMENTUM", config.assumed_momentum)?;

        let max_iterations =
            calib.constant_or("TRKFIND:MAX_ITERATIONS", config.max_iterations as f64)?;
        config.max_iterations = max_iterations as u32;

        // 0 (or absent) means no plane is skipped
        let plane = calib.constant_or("TRKFIND:PLANE_TO_SKIP", 0.0)?;
        config.plane_to_skip = (plane >= 1.0).then_some(plane as u32);

        config.reference_z = optional_constant(calib, "TRKFIND:REFERENCE_Z")?;

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.drift.validate()?;

        if self.chi2_cut <= 0.0 {
            return Err(ConfigError::invalid("TRKFIND:CHI2CUT", "must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("TRKFIND:MAX_ITERATIONS", "must be at least 1"));
        }
        if self.assumed_momentum <= 0.0 {
            return Err(ConfigError::invalid("TRKFIND:ASSUMED_MOMENTUM", "must be positive"));
        }
        if self.mass < 0.0 {
            return Err(ConfigError::invalid("mass", "must not be negative"));
        }
        if self.trajectory_step <= 0.0 {
            return Err(ConfigError::invalid("trajectory_step", "must be positive"));
        }
        if self.initial_covariance.iter().any(|v| *v <= 0.0) {
            return Err(ConfigError::invalid(
                "initial_covariance",
                "diagonal must be positive",
            ));
        }
        if self.z_min >= self.z_max {
            return Err(ConfigError::invalid("z_min", "must be below z_max"));
        }
        if let Some(z) = self.reference_z {
            if !(self.z_min..=self.z_max).contains(&z) {
                return Err(ConfigError::invalid(
                    "TRKFIND:REFERENCE_Z",
                    "must lie inside the propagation range",
                ));
            }
        }
        Ok(())
    }
}

fn fixed_table<const N: usize>(
    calib: &dyn CalibrationSource,
    key: &str,
) -> Result<[f64; N], ConfigError> {
    let values = calib.table(key)?;
    values.as_slice().try_into().map_err(|_| {
        ConfigError::invalid(key, format!("expected {} values, got {}", N, values.len()))
    })
}

fn optional_table<const N: usize>(
    calib: &dyn CalibrationSource,
    key: &str,
) -> Result<Option<[f64; N]>, ConfigError> {
    match fixed_table::<N>(calib, key) {
        Ok(values) => Ok(Some(values)),
        Err(ConfigError::Missing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn optional_constant(calib: &dyn CalibrationSource, key: &str) -> Result<Option<f64>, ConfigError> {
    match calib.constant(key).map_err(ConfigError::from) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::Missing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn rows(v: [f64; 9]) -> [[f64; 3]; 3] {
    [[v[0], v[1], v[2]], [v[3], v[4], v[5]], [v[6], v[7], v[8]]]
}

fn flag(calib: &dyn CalibrationSource, key: &str, default: bool) -> Result<bool, ConfigError> {
    let value = calib.constant_or(key, if default { 1.0 } else { 0.0 })?;
    Ok(value != 0.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use trackfit_env::MapCalibration;

    fn minimal_calibration() -> MapCalibration {
        let defaults = DriftConfig::default();
        MapCalibration::new()
            .with_table("CDC:DRIFT_TABLE", defaults.cdc_drift_table.clone())
            .with_table("CDC:RES_PARMS", defaults.cdc_res_par.to_vec())
            .with_table("FDC:DRIFT_FUNC", defaults.fdc_drift_func.to_vec())
            .with_table("FDC:DRIFT_RES_PARMS", defaults.fdc_drift_res.to_vec())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FitConfig::default();
        assert!(config.validate().is_ok());
        assert_relative_eq!(config.drift.cdc_max_drift_time(), 0.78 / 0.0055, epsilon = 1e-9);
        assert_relative_eq!(
            config.selector.low_momentum_scale,
            0.350 / 2f64.ln().sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_from_calibration_applies_run_parameters() {
        let calib = minimal_calibration()
            .with_constant("TRKFIND:CHI2CUT", 8.0)
            .with_constant("TRKFIND:DO_PRUNING", 0.0)
            .with_constant("TRKFIND:PLANE_TO_SKIP", 7.0)
            .with_constant("TRKFIND:SKIP_CDC", 1.0);

        let config = FitConfig::from_calibration(&calib).unwrap();
        assert_eq!(config.chi2_cut, 8.0);
        assert!(!config.do_pruning);
        assert!(config.skip_cdc);
        assert_eq!(config.plane_to_skip, Some(7));
        assert_eq!(config.cdc_match_doca, FitConfig::default().cdc_match_doca);
        assert_eq!(config.reference_z, None);
    }

    #[test]
    fn test_reference_z_from_calibration() {
        let calib = minimal_calibration().with_constant("TRKFIND:REFERENCE_Z", 65.0);
        let config = FitConfig::from_calibration(&calib).unwrap();
        assert_eq!(config.reference_z, Some(65.0));

        let outside = minimal_calibration().with_constant("TRKFIND:REFERENCE_Z", 5000.0);
        assert!(matches!(
            FitConfig::from_calibration(&outside),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_missing_drift_table_is_fatal() {
        let calib = MapCalibration::new().with_table("CDC:RES_PARMS", vec![0.06, 0.012, 0.0]);
        let result = FitConfig::from_calibration(&calib);
        assert!(matches!(result, Err(ConfigError::Missing(ref k)) if k == "CDC:DRIFT_TABLE"));
    }

    #[test]
    fn test_wrong_table_length_is_invalid() {
        let calib = minimal_calibration().with_table("CDC:RES_PARMS", vec![0.06, 0.012]);
        assert!(matches!(
            FitConfig::from_calibration(&calib),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_non_monotonic_table_is_invalid() {
        let calib = minimal_calibration().with_table("CDC:DRIFT_TABLE", vec![0.0, 5.0, 4.0]);
        assert!(matches!(
            FitConfig::from_calibration(&calib),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
