//! Toy drift-chamber geometry.
//!
//! A straw-tube barrel (CDC) around the target and four packages of six
//! wire planes (FDC) downstream of it. Dimensions are round numbers of the
//! right order, not a survey.

use nalgebra::Vector3;
use std::f64::consts::PI;
use std::sync::Arc;
use trackfit_env::{CdcWire, FdcWire, WireGeometry};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Layout parameters of the toy detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Number of CDC rings (default: 12)
    pub cdc_rings: u32,

    /// Radius of the innermost ring (cm, default: 10.0)
    pub cdc_inner_radius: f64,

    /// Radial and azimuthal straw pitch (cm, default: 1.6)
    pub cdc_pitch: f64,

    /// z of the straw centres (cm, default: 92.0)
    pub cdc_center_z: f64,

    /// Straw length (cm, default: 150.0)
    pub cdc_length: f64,

    /// Stereo angle of the stereo rings (rad, default: 6°)
    pub cdc_stereo_angle: f64,

    /// Rings `[first, last)` that are stereo (default: 4..8)
    pub cdc_stereo_rings: (u32, u32),

    /// z of the first wire plane of each package (cm)
    pub fdc_package_z: Vec<f64>,

    /// Planes per package (default: 6)
    pub fdc_planes_per_package: u32,

    /// Distance between planes within a package (cm, default: 2.0)
    pub fdc_plane_spacing: f64,

    /// Wires per plane (default: 96)
    pub fdc_wires: u32,

    /// Anode pitch (cm, default: 1.0)
    pub fdc_wire_spacing: f64,

    /// Active radius of the planes (cm, default: 48.0)
    pub fdc_radius: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cdc_rings: 12,
            cdc_inner_radius: 10.0,
            cdc_pitch: 1.6,
            cdc_center_z: 92.0,
            cdc_length: 150.0,
            cdc_stereo_angle: 6f64.to_radians(),
            cdc_stereo_rings: (4, 8),
            fdc_package_z: vec![176.0, 236.0, 296.0, 356.0],
            fdc_planes_per_package: 6,
            fdc_plane_spacing: 2.0,
            fdc_wires: 96,
            fdc_wire_spacing: 1.0,
            fdc_radius: 48.0,
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

/// Wire tables of the toy detector.
#[derive(Debug, Clone)]
pub struct ToyDetector {
    config: DetectorConfig,
    rings: Vec<Vec<Arc<CdcWire>>>,
    planes: Vec<Vec<Arc<FdcWire>>>,
}

impl Default for ToyDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl ToyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let rings = (0..config.cdc_rings)
            .map(|ring| Self::build_ring(&config, ring))
            .collect();

        let mut planes = Vec::new();
        let mut layer = 1;
        for &z0 in &config.fdc_package_z {
            for i in 0..config.fdc_planes_per_package {
                let z = z0 + config.fdc_plane_spacing * i as f64;
                let angle = match i % 3 {
                    0 => 0.0,
                    1 => PI / 3.0,
                    _ => -PI / 3.0,
                };
                planes.push(Self::build_plane(&config, layer, z, angle));
                layer += 1;
            }
        }

        Self {
            config,
            rings,
            planes,
        }
    }

    fn build_ring(config: &DetectorConfig, ring: u32) -> Vec<Arc<CdcWire>> {
        let radius = config.cdc_inner_radius + config.cdc_pitch * ring as f64;
        let straws = (2.0 * PI * radius / config.cdc_pitch).floor() as u32;
        let (first, last) = config.cdc_stereo_rings;
        let stereo = if (first..last).contains(&ring) {
            // Alternate sign between neighbouring stereo rings
            if ring % 2 == 0 {
                config.cdc_stereo_angle
            } else {
                -config.cdc_stereo_angle
            }
        } else {
            0.0
        };
        // Odd rings are staggered by half a straw
        let offset = if ring % 2 == 1 { 0.5 } else { 0.0 };

        (0..straws)
            .map(|straw| {
                let phi = 2.0 * PI * (straw as f64 + offset) / straws as f64;
                let (sin_phi, cos_phi) = phi.sin_cos();
                let origin = Vector3::new(radius * cos_phi, radius * sin_phi, config.cdc_center_z);
                let (sin_s, cos_s) = stereo.sin_cos();
                let direction = Vector3::new(-sin_phi * sin_s, cos_phi * sin_s, cos_s);
                Arc::new(CdcWire::new(
                    ring + 1,
                    straw + 1,
                    origin,
                    direction,
                    config.cdc_length,
                ))
            })
            .collect()
    }

    fn build_plane(config: &DetectorConfig, layer: u32, z: f64, angle: f64) -> Vec<Arc<FdcWire>> {
        let half = 0.5 * (config.fdc_wires as f64 - 1.0);
        (0..config.fdc_wires)
            .map(|w| {
                let u = (w as f64 - half) * config.fdc_wire_spacing;
                let chord = (config.fdc_radius * config.fdc_radius - u * u).max(0.0).sqrt();
                Arc::new(FdcWire::new(layer, w + 1, z, angle, u, 2.0 * chord))
            })
            .collect()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Straws of every ring, innermost first.
    pub fn rings(&self) -> &[Vec<Arc<CdcWire>>] {
        &self.rings
    }

    /// Wires of every plane, in increasing z.
    pub fn planes(&self) -> &[Vec<Arc<FdcWire>>] {
        &self.planes
    }

    /// Wire of `plane` nearest to the transverse coordinate `u`, if any.
    pub fn nearest_fdc_wire(&self, plane: usize, u: f64) -> Option<&Arc<FdcWire>> {
        let half = 0.5 * (self.config.fdc_wires as f64 - 1.0);
        let index = (u / self.config.fdc_wire_spacing + half).round();
        if index < 0.0 || index >= self.config.fdc_wires as f64 {
            return None;
        }
        self.planes.get(plane)?.get(index as usize)
    }

    pub fn num_straws(&self) -> usize {
        self.rings.iter().map(Vec::len).sum()
    }
}

impl WireGeometry for ToyDetector {
    fn cdc_wire(&self, ring: u32, straw: u32) -> Option<Arc<CdcWire>> {
        let ring = self.rings.get(ring.checked_sub(1)? as usize)?;
        ring.get(straw.checked_sub(1)? as usize).cloned()
    }

    fn fdc_wire(&self, layer: u32, wire: u32) -> Option<Arc<FdcWire>> {
        let plane = self.planes.get(layer.checked_sub(1)? as usize)?;
        plane.get(wire.checked_sub(1)? as usize).cloned()
    }
}

// ============================================================================
// TESTS
// ============================================================================
