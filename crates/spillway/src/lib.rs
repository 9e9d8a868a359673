//! # Spillway
//!
//! Transparent host-memory spilling for device-resident buffers.
//!
//! Buffers created while a [`SpillManager`] is active register with it.
//! Under memory pressure the manager relocates eligible buffers to host
//! memory and back, and it will never move a buffer that has handed out
//! its raw device address or that is shared between live owners. Start
//! with [`ManagerContext`] to install a manager, then create [`Buffer`]s
//! against it.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use spillway::{Buffer, HeapAllocator, ManagerContext, SpillConfig, SpillManager};
//!
//! let ctx = ManagerContext::new();
//! let manager = ctx.reset(SpillManager::new(SpillConfig::default()));
//!
//! let allocator = Arc::new(HeapAllocator::new());
//! let buf = Buffer::new(allocator, 24, &ctx)?;
//!
//! // Evict everything eligible from the device.
//! manager.spill_to_device_limit(Some(0))?;
//! assert!(buf.is_spilled());
//! assert_eq!(manager.spilled_and_unspilled(), (24, 0));
//!
//! // Taking the raw address brings the contents back and pins them.
//! let _ptr = buf.expose_pointer()?;
//! assert!(!buf.is_spilled());
//! assert!(!buf.spillable());
//! # Ok::<(), spillway::Error>(())
//! ```

// Re-export the spill machinery
pub use spillway_core::{
    AccessCounter, Buffer, ManagerContext, Residency, SpillConfig, SpillManager, SpillStats,
};

// Re-export foundation types - you'll need these for allocator plumbing
pub use spillway_common::{
    BufferId, DeviceAllocation, DeviceAllocator, DevicePtr, Error, HeapAllocator, Result,
};
