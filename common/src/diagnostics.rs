use log::warn;

use crate::error::{Fault, FaultKind};

/// Diagnostic sink shared by all components: every fault is logged and
/// counted, then swallowed.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    counts: [u64; FaultKind::COUNT],
    last: Option<Fault>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, fault: Fault) {
        warn!("{fault}");
        let slot = &mut self.counts[fault.kind().index()];
        *slot = slot.saturating_add(1);
        self.last = Some(fault);
    }

    pub fn count(&self, kind: FaultKind) -> u64 {
        self.counts[kind.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn last(&self) -> Option<&Fault> {
        self.last.as_ref()
    }
}
