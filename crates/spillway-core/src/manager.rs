//! Registry-wide accounting and the eviction policy.
//!
//! The [`SpillManager`] holds a non-owning registry of every live buffer
//! created while it was the active manager. It answers aggregate
//! accounting queries and evicts eligible buffers to host memory, either
//! wholesale or until a device-memory budget is met.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      SpillManager                       │
//! │  registry: BufferId -> Weak<buffer state>,              │
//! │            insertion order == registration order        │
//! │                                                         │
//! │  spilled_and_unspilled()   fresh byte totals            │
//! │  spill_device_memory()     spill everything eligible    │
//! │  spill_to_device_limit()   spill until budget is met    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Eviction order is registration order, oldest first. The order is
//! deliberately simple and deterministic so tests and callers can reason
//! about exactly which buffers move.
//!
//! The registry never owns a buffer: entries are weak, registration
//! happens at buffer construction, and deregistration is an explicit
//! callback from buffer destruction, so the totals always reflect only
//! currently-live buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use spillway_common::utils::hash::FxIndexMap;
use spillway_common::{BufferId, Error, Result};

use crate::buffer::BufferInner;

/// Configuration for a [`SpillManager`].
#[derive(Debug, Clone, Default)]
pub struct SpillConfig {
    /// Default device-memory budget in bytes, used by
    /// [`SpillManager::spill_to_device_limit`] when no explicit limit is
    /// passed. `None` leaves the budget-driven path disabled.
    pub device_limit: Option<usize>,
}

impl SpillConfig {
    /// Creates a configuration with no device budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default device-memory budget.
    #[must_use]
    pub fn with_device_limit(mut self, bytes: usize) -> Self {
        self.device_limit = Some(bytes);
        self
    }
}

/// Snapshot of a manager's cumulative transition counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpillStats {
    /// Completed device-to-host transitions.
    pub spill_count: u64,
    /// Completed host-to-device transitions.
    pub unspill_count: u64,
    /// Total bytes moved device-to-host.
    pub bytes_spilled: u64,
    /// Total bytes moved host-to-device.
    pub bytes_unspilled: u64,
}

#[derive(Debug, Default)]
struct SpillCounters {
    spills: AtomicU64,
    unspills: AtomicU64,
    bytes_spilled: AtomicU64,
    bytes_unspilled: AtomicU64,
}

/// Non-owning registry of live buffers, iterated in registration order.
#[derive(Default)]
struct SpillRegistry {
    entries: FxIndexMap<BufferId, Weak<BufferInner>>,
}

/// Orchestrates spilling across all buffers registered with it.
///
/// The manager holds only weak references and never extends a buffer's
/// lifetime beyond the duration of a single operation. All operations are
/// synchronous; every transition re-validates the buffer's eligibility
/// under the buffer's own lock immediately before moving it.
pub struct SpillManager {
    config: SpillConfig,
    registry: Mutex<SpillRegistry>,
    counters: SpillCounters,
}

impl SpillManager {
    /// Creates a manager with the given configuration.
    #[must_use]
    pub fn new(config: SpillConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(SpillRegistry::default()),
            counters: SpillCounters::default(),
        }
    }

    /// Creates a manager with the default configuration (no device
    /// budget).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SpillConfig::default())
    }

    /// The manager's configuration.
    #[must_use]
    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    /// Adds a buffer to the registry. Called at buffer construction while
    /// this manager is active.
    pub(crate) fn register(&self, inner: &Arc<BufferInner>) {
        self.registry
            .lock()
            .entries
            .insert(inner.id(), Arc::downgrade(inner));
    }

    /// Removes a destroyed buffer. Called from buffer destruction, so the
    /// totals fall in the same step with no lag.
    pub(crate) fn unregister(&self, id: BufferId) {
        self.registry.lock().entries.shift_remove(&id);
    }

    pub(crate) fn note_spill(&self, bytes: usize) {
        self.counters.spills.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_spilled
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_unspill(&self, bytes: usize) {
        self.counters.unspills.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_unspilled
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Strong references to every live registered buffer, in registration
    /// order. The registry lock is released before the snapshot is used,
    /// so a buffer whose last handle drops mid-operation can run its
    /// deregistration without deadlocking against us.
    fn snapshot(&self) -> Vec<Arc<BufferInner>> {
        self.registry
            .lock()
            .entries
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of live registered buffers.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Sums buffer sizes bucketed by residency, as
    /// `(spilled_bytes, unspilled_bytes)`.
    ///
    /// Computed fresh on every call; entries mid-destruction are skipped,
    /// never counted. The two totals always add up to the combined size
    /// of all live registered buffers.
    #[must_use]
    pub fn spilled_and_unspilled(&self) -> (usize, usize) {
        let mut spilled = 0;
        let mut unspilled = 0;
        for buffer in self.snapshot() {
            if buffer.is_spilled() {
                spilled += buffer.size();
            } else {
                unspilled += buffer.size();
            }
        }
        (spilled, unspilled)
    }

    /// Spills every currently eligible buffer to host memory.
    ///
    /// Ineligible buffers (exposed, shared, or already spilled) are
    /// skipped silently. The first allocator failure is surfaced and
    /// already-completed transitions stay in place.
    pub fn spill_device_memory(&self) -> Result<()> {
        let mut moved = 0usize;
        let mut bytes = 0usize;
        for buffer in self.snapshot() {
            match buffer.move_to_host() {
                Ok(()) => {
                    moved += 1;
                    bytes += buffer.size();
                }
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!("Spilled {} buffers ({} bytes) to host", moved, bytes);
        Ok(())
    }

    /// Spills eligible buffers, oldest registration first, until no more
    /// than `device_limit` bytes remain device-resident or nothing
    /// eligible is left.
    ///
    /// With `None`, the configured [`SpillConfig::device_limit`] applies;
    /// if that is also unset the call is a no-op. Best effort: if the
    /// remaining device-resident buffers are all ineligible the call
    /// completes without error, and callers that need a hard guarantee
    /// re-check [`SpillManager::spilled_and_unspilled`] afterward.
    pub fn spill_to_device_limit(&self, device_limit: Option<usize>) -> Result<()> {
        let Some(limit) = device_limit.or(self.config.device_limit) else {
            return Ok(());
        };

        let snapshot = self.snapshot();
        let mut unspilled: usize = snapshot
            .iter()
            .filter(|b| !b.is_spilled())
            .map(|b| b.size())
            .sum();

        for buffer in &snapshot {
            if unspilled <= limit {
                break;
            }
            match buffer.move_to_host() {
                Ok(()) => unspilled -= buffer.size(),
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if unspilled > limit {
            tracing::debug!(
                "Device limit {} not reached, {} bytes remain unspillable",
                limit,
                unspilled
            );
        }
        Ok(())
    }

    /// Snapshot of the cumulative transition counters.
    #[must_use]
    pub fn statistics(&self) -> SpillStats {
        SpillStats {
            spill_count: self.counters.spills.load(Ordering::Relaxed),
            unspill_count: self.counters.unspills.load(Ordering::Relaxed),
            bytes_spilled: self.counters.bytes_spilled.load(Ordering::Relaxed),
            bytes_unspilled: self.counters.bytes_unspilled.load(Ordering::Relaxed),
        }
    }
}
