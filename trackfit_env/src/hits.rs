//! Per-event hit collections.

use serde::{Deserialize, Serialize};

use crate::types::{CdcHit, FdcHit};

/// Ordered, read-only hit collections for one event.
pub trait HitSource {
    /// CDC hits in detector order.
    fn cdc_hits(&self) -> &[CdcHit];

    /// FDC pseudo hits in detector order.
    fn fdc_hits(&self) -> &[FdcHit];
}

/// Owned hit collections for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventHits {
    pub event_number: u64,
    pub cdc_hits: Vec<CdcHit>,
    pub fdc_hits: Vec<FdcHit>,
}

impl EventHits {
    pub fn new(event_number: u64) -> Self {
        Self {
            event_number,
            ..Default::default()
        }
    }

    /// Total number of hits of both kinds.
    pub fn len(&self) -> usize {
        self.cdc_hits.len() + self.fdc_hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HitSource for EventHits {
    fn cdc_hits(&self) -> &[CdcHit] {
        &self.cdc_hits
    }

    fn fdc_hits(&self) -> &[FdcHit] {
        &self.fdc_hits
    }
}
