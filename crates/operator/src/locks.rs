//! Single-flight per owning spec.

use std::sync::{Arc, Mutex};

use amp_core::ResourceId;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type Slot = Arc<AsyncMutex<()>>;

/// One async lock per owning-spec identity. Passes for different identities
/// run concurrently; passes for the same identity queue behind each other.
#[derive(Clone, Default)]
pub struct PassLocks {
    slots: Arc<Mutex<FxHashMap<ResourceId, Slot>>>,
}

/// Held for the duration of one pass.
pub struct PassGuard {
    id: ResourceId,
    _guard: OwnedMutexGuard<()>,
}

impl PassGuard {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }
}

impl PassLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &ResourceId) -> PassGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on.
            slots.retain(|_, s| Arc::strong_count(s) > 1);
            slots.entry(id.clone()).or_default().clone()
        };
        if slot.try_lock().is_err() {
            debug!(%id, "pass already in flight; waiting");
        }
        let guard = slot.lock_owned().await;
        PassGuard { id: id.clone(), _guard: guard }
    }

    /// Identities with a pass running or queued.
    pub fn in_flight(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|s| Arc::strong_count(s) > 1).count()
    }
}
