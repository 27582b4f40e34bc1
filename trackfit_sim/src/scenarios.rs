//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: Forward tracks through the planar chambers only
    FdcForward,

    /// SIM-002: Cosmic rays through the straw barrel, with noise hits
    CdcCosmic,

    /// SIM-003: Forward tracks crossing both detectors
    Combined,

    /// SIM-004: Forward tracks with one hit from the wrong wire
    Misassigned,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FdcForward,
            ScenarioId::CdcCosmic,
            ScenarioId::Combined,
            ScenarioId::Misassigned,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FdcForward => "fdc_forward",
            ScenarioId::CdcCosmic => "cdc_cosmic",
            ScenarioId::Combined => "combined",
            ScenarioId::Misassigned => "misassigned",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FdcForward => "2-6° tracks from the target, 24 FDC planes",
            ScenarioId::CdcCosmic => "40-70° cosmics through the barrel, 3 noise straws per event",
            ScenarioId::Combined => "8-12° tracks, FDC seeds extended with matching CDC hits",
            ScenarioId::Misassigned => "FDC tracks with a hit two wires off added to the seed",
        }
    }

    /// Whether the scenario reads out the straw barrel.
    pub fn uses_cdc(&self) -> bool {
        matches!(self, ScenarioId::CdcCosmic | ScenarioId::Combined)
    }

    /// Whether the scenario reads out the planar chambers.
    pub fn uses_fdc(&self) -> bool {
        !matches!(self, ScenarioId::CdcCosmic)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fdc_forward" | "fdcforward" | "fdc" | "sim-001" => Ok(ScenarioId::FdcForward),
            "cdc_cosmic" | "cdccosmic" | "cosmic" | "sim-002" => Ok(ScenarioId::CdcCosmic),
            "combined" | "sim-003" => Ok(ScenarioId::Combined),
            "misassigned" | "sim-004" => Ok(ScenarioId::Misassigned),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
