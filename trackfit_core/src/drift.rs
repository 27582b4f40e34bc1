//! The drift-physics model: drift time to drift distance, and the
//! measurement variance of each.
//!
//! All functions are pure. Unusable drift times (non-finite, negative, or
//! beyond the physical maximum) never error: distances degrade to zero and
//! variances to the configured sentinel, which de-weights the hit.

use crate::config::{DriftConfig, FitConfig};

/// Relative size below which the undeformed drift function is treated as zero.
const MIN_DRIFT_FUNCTION: f64 = 1e-9;

/// Drift-time to drift-distance conversion for CDC straws and FDC cells.
#[derive(Debug, Clone)]
pub struct DriftModel {
    config: DriftConfig,
}

impl DriftModel {
    pub fn new(config: &FitConfig) -> Self {
        Self::from_drift_config(config.drift.clone())
    }

    pub fn from_drift_config(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Applies the range policy: `None` for unusable times, otherwise the
    /// time clamped to the calibrated range `[0, max]`.
    fn usable_time(&self, t: f64, max: f64) -> Option<f64> {
        if !t.is_finite() || t < 0.0 || t > self.config.max_physical_drift_time {
            return None;
        }
        Some(t.min(max))
    }

    // ========================================================================
    // CDC
    // ========================================================================

    /// Drift distance from the calibration table (cm).
    ///
    /// Entry `i` of the table is the drift time at `i * step`; times between
    /// entries are interpolated linearly and times beyond the table give the
    /// last distance.
    pub fn cdc_drift_distance(&self, t: f64) -> f64 {
        if !t.is_finite() || t <= 0.0 {
            return 0.0;
        }
        let table = &self.config.cdc_drift_table;
        let step = self.config.cdc_table_step;
        let last = table.len().saturating_sub(1);

        if table.is_empty() || t >= table[last] {
            return last as f64 * step;
        }

        let upper = table.partition_point(|&ti| ti <= t);
        if upper == 0 {
            return 0.0;
        }
        let lower = upper - 1;
        let frac = (t - table[lower]) / (table[upper] - table[lower]);
        (lower as f64 + frac) * step
    }

    /// Drift distance corrected for straw deformation (cm).
    ///
    /// `delta` is the wire sag at the point of closest approach and `dphi` the
    /// azimuth between the DOCA direction and the sag direction. Positive
    /// effective sag uses the long-side drift function, otherwise the short
    /// side.
    pub fn cdc_drift_distance_with_sag(&self, dphi: f64, delta: f64, t: f64) -> f64 {
        if !t.is_finite() || t <= 0.0 {
            return 0.0;
        }
        let delta_eff = delta * dphi.cos();
        let params = if delta_eff > 0.0 {
            &self.config.long_drift_func
        } else {
            &self.config.short_drift_func
        };

        let f_delta = deformed_drift_function(params, delta_eff, t);
        let max_distance = self.config.cdc_straw_radius;

        if t > self.config.cdc_max_drift_time() {
            return f_delta.clamp(0.0, max_distance);
        }

        let f0 = deformed_drift_function(params, 0.0, t);
        let d0 = self.cdc_drift_distance(t);
        if f0.abs() <= MIN_DRIFT_FUNCTION {
            return d0;
        }

        let t_cut = self.config.sag_time_cut;
        let p = if t < t_cut { (t_cut - t) / t_cut } else { 0.0 };
        (f_delta * (d0 / f0 * p + 1.0 - p)).clamp(0.0, max_distance)
    }

    /// Constant-velocity drift distance, used for quick hit association (cm).
    pub fn linear_drift_distance(&self, t: f64) -> f64 {
        self.config.drift_velocity * t
    }

    /// CDC drift-distance variance `(p1/(t+1) + p2 + p3 t)²` (cm²).
    pub fn cdc_drift_variance(&self, t: f64) -> f64 {
        let Some(t) = self.usable_time(t, self.config.cdc_max_drift_time()) else {
            return self.config.sentinel_variance;
        };
        let [p1, p2, p3] = self.config.cdc_res_par;
        let sigma = p1 / (t + 1.0) + p2 + p3 * t;
        sigma * sigma
    }

    /// Variance of the half-cell measurement used before drift times are trusted.
    pub fn cdc_wire_based_variance(&self) -> f64 {
        let r = self.config.cdc_straw_radius;
        r * r / 12.0
    }

    /// Half-cell CDC measurement (cm).
    pub fn cdc_wire_based_distance(&self) -> f64 {
        0.5 * self.config.cdc_straw_radius
    }

    // ========================================================================
    // FDC
    // ========================================================================

    /// FDC drift distance from the drift polynomial (cm), clamped to the half cell.
    pub fn fdc_drift_distance(&self, t: f64) -> f64 {
        if !t.is_finite() || t <= 0.0 {
            return 0.0;
        }
        let t = t.min(self.config.fdc_max_drift_time);
        let [p0, p1, p2, p3] = self.config.fdc_drift_func;
        let d = p0 * t.sqrt() + p1 * t + p2 * t * t + p3 * t * t * t;
        d.clamp(0.0, self.config.fdc_max_drift_distance)
    }

    /// FDC anode variance `(r0/(t+1) + r1 + r2 t²)²` (cm²).
    pub fn fdc_drift_variance(&self, t: f64) -> f64 {
        let Some(t) = self.usable_time(t, self.config.fdc_max_drift_time) else {
            return self.config.sentinel_variance;
        };
        let [r0, r1, r2] = self.config.fdc_drift_res;
        let sigma = r0 / (t + 1.0) + r1 + r2 * t * t;
        sigma * sigma
    }

    /// Along-wire (cathode) variance for a hit with drift time `t` (cm²).
    pub fn fdc_cathode_variance(&self, t: f64) -> f64 {
        match self.usable_time(t, self.config.fdc_max_drift_time) {
            Some(_) => self.config.fdc_cathode_variance,
            None => self.config.sentinel_variance,
        }
    }

    /// Cathode variance independent of the drift time.
    pub fn nominal_cathode_variance(&self) -> f64 {
        self.config.fdc_cathode_variance
    }

    /// Half-cell FDC anode measurement (cm).
    pub fn fdc_wire_based_distance(&self) -> f64 {
        0.5 * self.config.fdc_max_drift_distance
    }

    /// Variance of the half-cell FDC anode measurement (cm²).
    pub fn fdc_wire_based_variance(&self) -> f64 {
        let d = self.config.fdc_max_drift_distance;
        d * d / 12.0
    }
}

/// `f(δ, t) = (a1 + a2|δ|)√t' + (b1 + b2|δ|)t' + (c1 + c2|δ| + c3δ²)t'³`
/// with `t' = 0.001 t` (µs).
fn deformed_drift_function(params: &[[f64; 3]; 3], delta: f64, t: f64) -> f64 {
    let [a, b, c] = params;
    let abs_delta = delta.abs();
    let tp = 0.001 * t;
    (a[0] + a[1] * abs_delta) * tp.sqrt()
        + (b[0] + b[1] * abs_delta) * tp
        + (c[0] + c[1] * abs_delta + c[2] * delta * delta) * tp * tp * tp
}

// ============================================================================
// TESTS
// ============================================================================
