//! Active-manager lifecycle.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::manager::SpillManager;

/// Decides which [`SpillManager`] governs buffer construction.
///
/// At most one manager is active at a time, or none when spilling is
/// disabled. The context is an explicit object handed to buffer
/// constructors rather than process-global state, which keeps test
/// isolation cheap: `reset` swaps in a fresh manager, `clear` turns
/// spilling off entirely.
///
/// Installing a new manager supersedes the previous one without merging
/// its registry. Buffers registered with a superseded manager keep
/// deregistering against it through their own back-reference, so both
/// managers stay exact over their own populations.
pub struct ManagerContext {
    active: RwLock<Option<Arc<SpillManager>>>,
}

impl ManagerContext {
    /// Creates a context with spilling disabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
        }
    }

    /// Installs `manager` as the sole active instance and returns it.
    pub fn reset(&self, manager: SpillManager) -> Arc<SpillManager> {
        let manager = Arc::new(manager);
        *self.active.write() = Some(Arc::clone(&manager));
        manager
    }

    /// Deactivates spilling. Buffers constructed afterwards register with
    /// nothing and are never automatically spilled.
    pub fn clear(&self) {
        *self.active.write() = None;
    }

    /// The active manager, if any.
    #[must_use]
    pub fn active(&self) -> Option<Arc<SpillManager>> {
        self.active.read().clone()
    }

    /// Whether a manager is currently active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.active.read().is_some()
    }
}

impl Default for ManagerContext {
    fn default() -> Self {
        Self::new()
    }
}
