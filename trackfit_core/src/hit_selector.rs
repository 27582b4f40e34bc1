//! Hit-inclusion probability model.
//!
//! Given the current trajectory, every candidate hit gets a chi-square tail
//! probability from its residual against a broadened, stage-dependent error;
//! hits below the minimum probability are left out of the next fit pass.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::trace;
use trackfit_env::{CdcHit, FdcHit, WireDistance};

use crate::config::{FitConfig, SelectorConfig};
use crate::drift::DriftModel;
use crate::error::FitError;

/// Which measurement model the current fit pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitStage {
    /// Drift times ignored; hits are half-cell measurements
    WireBased,
    /// Drift times converted to distances with the drift model
    TimeBased,
    /// Loose seed-level association
    Helical,
}

impl FitStage {
    pub fn name(&self) -> &'static str {
        match self {
            FitStage::WireBased => "wire-based",
            FitStage::TimeBased => "time-based",
            FitStage::Helical => "helical",
        }
    }

    /// Ordering by measurement quality; higher is better.
    pub fn rank(&self) -> u8 {
        match self {
            FitStage::Helical => 0,
            FitStage::WireBased => 1,
            FitStage::TimeBased => 2,
        }
    }
}

/// Upper-tail chi-square probability.
///
/// Non-finite chi-square gives 0; zero or negative chi-square gives 1.
pub fn chi2_probability(chisq: f64, ndof: usize) -> f64 {
    if !chisq.is_finite() {
        return 0.0;
    }
    if chisq <= 0.0 {
        return 1.0;
    }
    if ndof == 0 {
        return 0.0;
    }
    match ChiSquared::new(ndof as f64) {
        Ok(dist) => dist.sf(chisq),
        Err(_) => 0.0,
    }
}

/// Residual breakdown of one CDC hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdcResidual {
    pub dist: f64,
    pub doca: f64,
    pub resi: f64,
    pub sigma: f64,
    pub chi2: f64,
    pub probability: f64,
}

/// Residual breakdown of one FDC hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdcResidual {
    pub dist: f64,
    pub doca: f64,
    pub anode_resi: f64,
    pub cathode_resi: f64,
    pub sigma: f64,
    pub chi2: f64,
    pub probability: f64,
}

/// Selects the hits consistent with a trajectory.
#[derive(Debug, Clone)]
pub struct HitSelector {
    config: SelectorConfig,
    drift: DriftModel,
}

impl HitSelector {
    pub fn new(config: &FitConfig) -> Self {
        Self {
            config: config.selector.clone(),
            drift: DriftModel::new(config),
        }
    }

    fn stage_factor(&self, stage: FitStage) -> f64 {
        match stage {
            FitStage::TimeBased => 1.0,
            FitStage::WireBased => self.config.wire_based_factor,
            FitStage::Helical => self.config.helical_factor,
        }
    }

    /// Time of flight to path length `s` from the trajectory start.
    fn time_of_flight<T: WireDistance + ?Sized>(&self, trajectory: &T, s: f64) -> f64 {
        let p = trajectory.momentum();
        let m = trajectory.mass();
        let beta = if p > 0.0 {
            1.0 / (1.0 + (m * m) / (p * p)).sqrt()
        } else {
            1.0
        };
        trajectory.start_time() + s / (beta * self.config.speed_of_light)
    }

    // ========================================================================
    // CDC
    // ========================================================================

    /// Residual and probability of one CDC hit (1 dof).
    pub fn evaluate_cdc<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hit: &CdcHit,
    ) -> Result<CdcResidual, FitError> {
        let approach = trajectory.distance_to_wire(&hit.wire.line())?;
        let p = trajectory.momentum();

        let mut sigma = self.config.cdc_cell_size / 12f64.sqrt() * self.stage_factor(stage);
        let g = self.config.low_momentum_scale;
        sigma *= 1.0 + (-(p / g).powi(2)).exp();

        let dist = match stage {
            FitStage::TimeBased => {
                let tof = self.time_of_flight(trajectory, approach.s);
                self.drift.linear_drift_distance(hit.tdrift - tof)
            }
            _ => 0.5 * self.config.cdc_cell_size,
        };

        if matches!(stage, FitStage::TimeBased | FitStage::WireBased) {
            sigma *= 1.0 + approach.s.abs() / self.config.path_length_scale;
        }

        let resi = dist - approach.doca;
        let chi2 = (resi / sigma).powi(2);
        Ok(CdcResidual {
            dist,
            doca: approach.doca,
            resi,
            sigma,
            chi2,
            probability: chi2_probability(chi2, 1),
        })
    }

    /// Inclusion probability of one CDC hit.
    pub fn hit_probability_cdc<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hit: &CdcHit,
    ) -> Result<f64, FitError> {
        Ok(self.evaluate_cdc(stage, trajectory, hit)?.probability)
    }

    /// Indices of the accepted CDC hits, in input order.
    pub fn select_cdc_indices<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hits: &[CdcHit],
    ) -> Vec<usize> {
        hits.iter()
            .enumerate()
            .filter_map(|(i, hit)| match self.evaluate_cdc(stage, trajectory, hit) {
                Ok(r) if r.probability >= self.config.min_cdc_probability => Some(i),
                Ok(_) => None,
                Err(e) => {
                    trace!(
                        ring = hit.wire.ring,
                        straw = hit.wire.straw,
                        "dropping CDC hit: {}",
                        e
                    );
                    None
                }
            })
            .collect()
    }

    /// Accepted CDC hits, in input order.
    pub fn select_cdc_hits<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hits: &[CdcHit],
    ) -> Vec<CdcHit> {
        self.select_cdc_indices(stage, trajectory, hits)
            .into_iter()
            .map(|i| hits[i].clone())
            .collect()
    }

    // ========================================================================
    // FDC
    // ========================================================================

    /// Residuals and probability of one FDC pseudo hit (2 dof).
    pub fn evaluate_fdc<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hit: &FdcHit,
    ) -> Result<FdcResidual, FitError> {
        let approach = trajectory.distance_to_wire(&hit.wire.line())?;
        let p = trajectory.momentum();
        let m = trajectory.mass();

        let mut sigma = self.config.fdc_cell_size / 12f64.sqrt() * self.stage_factor(stage);
        if p > 0.0 && p < 1.0 {
            sigma /= p;
        }
        if m > 0.0 {
            sigma *= m / self.config.pion_mass;
        }

        let dist = match stage {
            FitStage::TimeBased => {
                let tof = self.time_of_flight(trajectory, approach.s);
                self.drift.linear_drift_distance(hit.time - tof)
            }
            _ => 0.5 * self.config.fdc_cell_size,
        };

        let anode_resi = dist - approach.doca;
        let cathode_resi = approach.along_wire - hit.s;
        let chi2 = (anode_resi * anode_resi + cathode_resi * cathode_resi) / (sigma * sigma);
        Ok(FdcResidual {
            dist,
            doca: approach.doca,
            anode_resi,
            cathode_resi,
            sigma,
            chi2,
            probability: chi2_probability(chi2, 2),
        })
    }

    /// Inclusion probability of one FDC pseudo hit.
    pub fn hit_probability_fdc<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hit: &FdcHit,
    ) -> Result<f64, FitError> {
        Ok(self.evaluate_fdc(stage, trajectory, hit)?.probability)
    }

    /// Indices of the accepted FDC hits, in input order.
    pub fn select_fdc_indices<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hits: &[FdcHit],
    ) -> Vec<usize> {
        hits.iter()
            .enumerate()
            .filter_map(|(i, hit)| match self.evaluate_fdc(stage, trajectory, hit) {
                Ok(r) if r.probability >= self.config.min_fdc_probability => Some(i),
                Ok(_) => None,
                Err(e) => {
                    trace!(
                        layer = hit.wire.layer,
                        wire = hit.wire.wire,
                        "dropping FDC hit: {}",
                        e
                    );
                    None
                }
            })
            .collect()
    }

    /// Accepted FDC hits, in input order.
    pub fn select_fdc_hits<T: WireDistance + ?Sized>(
        &self,
        stage: FitStage,
        trajectory: &T,
        hits: &[FdcHit],
    ) -> Vec<FdcHit> {
        self.select_fdc_indices(stage, trajectory, hits)
            .into_iter()
            .map(|i| hits[i].clone())
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
