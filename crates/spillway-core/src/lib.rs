//! # spillway-core
//!
//! Core layer for Spillway: spillable buffers, the spill manager, and the
//! process lifecycle context.
//!
//! A [`Buffer`] wraps one device allocation and tracks the three things
//! that decide whether it may move: residency, pointer exposure, and
//! shared ownership. A [`SpillManager`] holds non-owning references to
//! every buffer created while it was active, aggregates byte totals, and
//! spills eligible buffers until a device-memory budget is met. A
//! [`ManagerContext`] decides which manager (if any) governs the process.
//!
//! ## Modules
//!
//! - [`buffer`] - Spillable buffers and shared-ownership tracking
//! - [`manager`] - Registry-wide accounting and eviction policy
//! - [`context`] - Active-manager lifecycle

pub mod buffer;
pub mod context;
pub mod manager;

// Re-export commonly used types
pub use buffer::{AccessCounter, Buffer, Residency};
pub use context::ManagerContext;
pub use manager::{SpillConfig, SpillManager, SpillStats};
