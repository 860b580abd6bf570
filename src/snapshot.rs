use parking_lot::RwLock;
use std::sync::Arc;

use crate::device::{DeviceProfile, SecurityPatchOverrides};
use crate::policy::PolicySnapshot;

/// Everything a call handler reads from runtime configuration.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub policy: PolicySnapshot,
    pub device: DeviceProfile,
    pub security_patch: SecurityPatchOverrides,
}

/// Holds the current [`Snapshot`] behind an atomically replaced `Arc`.
///
/// Readers clone the `Arc` and never observe a partially applied update;
/// writers publish a complete replacement.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotCell {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn publish(&self, next: Snapshot) {
        *self.current.write() = Arc::new(next);
    }

    /// Read-modify-write under the writer lock, so concurrent updates compose.
    pub fn update(&self, f: impl FnOnce(&Snapshot) -> Snapshot) {
        let mut current = self.current.write();
        let next = f(&current);
        *current = Arc::new(next);
    }
}
