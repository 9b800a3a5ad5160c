//! Cross-session start barrier.
//!
//! A run starts once every prepared camera has reconfigured with its record
//! target, or once the timeout fires with whatever subset made it. A camera
//! that errors or fails to configure while the barrier is open is dropped
//! from the expected set instead of holding everyone else back.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::SlotPosition;

pub const BARRIER_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierTimings {
    pub timeout: Duration,
}

impl Default for BarrierTimings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(BARRIER_TIMEOUT_MS),
        }
    }
}

/// Result of feeding one notification into the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierProgress {
    /// Not a slot this barrier is waiting for.
    Ignored,
    Waiting,
    /// The start action must run now, for these slots. Returned once.
    Complete(Vec<SlotPosition>),
}

#[derive(Debug, Clone)]
pub struct StartBarrier {
    expected: usize,
    pending: BTreeSet<SlotPosition>,
    ready: Vec<SlotPosition>,
    resolved: bool,
}

impl StartBarrier {
    pub fn new(slots: impl IntoIterator<Item = SlotPosition>) -> Self {
        let pending: BTreeSet<SlotPosition> = slots.into_iter().collect();
        Self {
            expected: pending.len(),
            pending,
            ready: Vec::new(),
            resolved: false,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn configured(&self) -> usize {
        self.ready.len()
    }

    pub fn is_pending(&self, slot: SlotPosition) -> bool {
        !self.resolved && self.pending.contains(&slot)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn mark_configured(&mut self, slot: SlotPosition) -> BarrierProgress {
        if !self.is_pending(slot) {
            return BarrierProgress::Ignored;
        }
        self.pending.remove(&slot);
        self.ready.push(slot);
        self.check()
    }

    /// Exclude `slot` from this run.
    pub fn mark_failed(&mut self, slot: SlotPosition) -> BarrierProgress {
        if !self.is_pending(slot) {
            return BarrierProgress::Ignored;
        }
        self.pending.remove(&slot);
        self.expected = self.expected.saturating_sub(1);
        self.check()
    }

    /// Timeout: resolve with whatever is ready. `None` if already resolved.
    pub fn force(&mut self) -> Option<Vec<SlotPosition>> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        Some(std::mem::take(&mut self.ready))
    }

    fn check(&mut self) -> BarrierProgress {
        if self.ready.len() >= self.expected {
            self.resolved = true;
            BarrierProgress::Complete(std::mem::take(&mut self.ready))
        } else {
            BarrierProgress::Waiting
        }
    }
}
