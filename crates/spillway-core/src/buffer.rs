//! Spillable buffers and shared-ownership tracking.
//!
//! A [`Buffer`] is an owning handle to one logical device allocation whose
//! contents can be relocated to host memory ("spilled") and back. A buffer
//! must never move while external code holds a raw device address into it,
//! or while more than one owner is actively using it:
//!
//! - [`Buffer::expose_pointer`] hands out the raw device address and
//!   permanently pins the buffer on the device. Exposure is one-way: a
//!   leaked pointer is assumed to outlive the exposing call indefinitely,
//!   so the flag is never reset.
//! - Cloning a [`Buffer`] duplicates ownership. While more than one handle
//!   is live, the buffer is ineligible for spilling; dropping the extra
//!   handles restores eligibility.
//!
//! The only spillable state is device-resident, never exposed, sole owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use spillway_common::{BufferId, DeviceAllocation, DeviceAllocator, DevicePtr, Error, Result};

use crate::context::ManagerContext;
use crate::manager::SpillManager;

/// Issues process-unique buffer ids.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Residency of a buffer's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Contents live in device memory.
    Device,
    /// Contents are spilled to host memory.
    Host,
}

/// Shared counter attached to a buffer's underlying allocation, tracking
/// how many live owning handles reference it.
///
/// Cloning a [`Buffer`] shares the counter; dropping a handle releases its
/// share. A derived view holding a second handle keeps the buffer
/// unspillable for the view's lifetime without any action by the original.
#[derive(Debug)]
pub struct AccessCounter {
    token: Arc<()>,
}

impl AccessCounter {
    fn new() -> Self {
        Self { token: Arc::new(()) }
    }

    /// Number of live owning handles sharing the allocation. Always at
    /// least 1 when read through a live handle.
    #[must_use]
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.token)
    }

    fn share(&self) -> Self {
        Self {
            token: Arc::clone(&self.token),
        }
    }

    fn observer(&self) -> CounterObserver {
        CounterObserver {
            token: Arc::downgrade(&self.token),
        }
    }
}

/// Read-only view of an [`AccessCounter`] that does not contribute to the
/// count. Held by the shared buffer state so eligibility checks never
/// inflate the count they are checking.
#[derive(Debug)]
struct CounterObserver {
    token: Weak<()>,
}

impl CounterObserver {
    fn use_count(&self) -> usize {
        self.token.strong_count()
    }
}

/// Where the buffer's bytes currently live. Exactly one side holds
/// storage at any time outside the transient copy window.
enum Storage {
    /// Live device allocation.
    Device(DevicePtr),
    /// Spilled contents held on the host.
    Host(Box<[u8]>),
}

/// Mutable buffer state. Residency and exposure are read and written only
/// under the state lock; transitions validate eligibility and perform the
/// copy under the same lock acquisition, so a concurrent duplication or
/// exposure cannot interleave with a move already found eligible.
struct BufferState {
    storage: Storage,
    exposed: bool,
}

/// State shared by every handle to the same allocation. The registry
/// holds this weakly; destruction of the last handle deregisters it.
pub(crate) struct BufferInner {
    id: BufferId,
    size: usize,
    allocator: Arc<dyn DeviceAllocator>,
    state: Mutex<BufferState>,
    counter: CounterObserver,
    /// Manager this buffer registered with at construction, if any.
    manager: Weak<SpillManager>,
}

impl BufferInner {
    pub(crate) fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_spilled(&self) -> bool {
        matches!(self.state.lock().storage, Storage::Host(_))
    }

    pub(crate) fn spillable(&self) -> bool {
        let state = self.state.lock();
        !state.exposed
            && self.counter.use_count() == 1
            && matches!(state.storage, Storage::Device(_))
    }

    /// Moves the contents to host memory and frees the device allocation.
    ///
    /// Validates eligibility immediately before the copy, under the state
    /// lock. On failure nothing is freed and residency is unchanged.
    pub(crate) fn move_to_host(&self) -> Result<()> {
        let mut state = self.state.lock();
        let ptr = match &state.storage {
            Storage::Device(ptr) => *ptr,
            Storage::Host(_) => {
                return Err(Error::InvalidTransition {
                    reason: "already spilled",
                });
            }
        };
        if state.exposed {
            return Err(Error::InvalidTransition {
                reason: "exposed pointer",
            });
        }
        if self.counter.use_count() != 1 {
            return Err(Error::InvalidTransition {
                reason: "shared between owners",
            });
        }

        let mut host = vec![0u8; self.size];
        self.allocator.copy_to_host(ptr, &mut host)?;
        self.allocator.free(ptr)?;
        state.storage = Storage::Host(host.into_boxed_slice());
        drop(state);

        if let Some(manager) = self.manager.upgrade() {
            manager.note_spill(self.size);
        }
        tracing::debug!("Spilled {} ({} bytes) to host", self.id, self.size);
        Ok(())
    }

    /// Moves the contents back to device memory. A no-op if already
    /// device-resident; unspilling never threatens a held pointer.
    pub(crate) fn move_to_device(&self) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        self.unspill_locked(&mut state)
    }

    fn unspill_locked(&self, state: &mut BufferState) -> Result<DevicePtr> {
        let bytes = match &state.storage {
            Storage::Device(ptr) => return Ok(*ptr),
            Storage::Host(bytes) => bytes,
        };

        let ptr = self.allocator.allocate(self.size)?;
        if let Err(copy_err) = self.allocator.copy_from_host(bytes, ptr) {
            if let Err(free_err) = self.allocator.free(ptr) {
                tracing::warn!(
                    "Failed to free device allocation after copy error: {}",
                    free_err
                );
            }
            return Err(copy_err);
        }
        state.storage = Storage::Device(ptr);

        if let Some(manager) = self.manager.upgrade() {
            manager.note_unspill(self.size);
        }
        tracing::debug!("Unspilled {} ({} bytes) to device", self.id, self.size);
        Ok(ptr)
    }

    fn expose_pointer(&self) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        let ptr = self.unspill_locked(&mut state)?;
        state.exposed = true;
        Ok(ptr)
    }

    /// Overwrites the buffer contents without exposing it, in either
    /// residency. `data` must match the buffer size exactly.
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.size {
            return Err(Error::Internal(format!(
                "source length {} does not match buffer size {}",
                data.len(),
                self.size
            )));
        }
        let mut state = self.state.lock();
        match &mut state.storage {
            Storage::Device(ptr) => self.allocator.copy_from_host(data, *ptr),
            Storage::Host(bytes) => {
                bytes.copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Reads the full buffer contents without exposing it, in either
    /// residency.
    fn read_bytes(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        match &state.storage {
            Storage::Device(ptr) => {
                let mut out = vec![0u8; self.size];
                self.allocator.copy_to_host(*ptr, &mut out)?;
                Ok(out)
            }
            Storage::Host(bytes) => Ok(bytes.to_vec()),
        }
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self.id);
        }
        if let Storage::Device(ptr) = self.state.get_mut().storage {
            if let Err(e) = self.allocator.free(ptr) {
                tracing::warn!("Failed to free device allocation for {}: {}", self.id, e);
            }
        }
    }
}

/// An owning handle to one spillable device allocation.
///
/// Handles are cheap to clone; every clone is an independent owner of the
/// same underlying allocation, and the allocation is released when the
/// last handle drops. Registration with the active manager happens at
/// construction, deregistration when the last handle drops, so manager
/// accounting always reflects exactly the live buffers.
pub struct Buffer {
    inner: Arc<BufferInner>,
    access: AccessCounter,
}

impl Buffer {
    /// Allocates `size` bytes of device memory and wraps them in a new
    /// sole-owner buffer, registering it with the context's active
    /// manager, if any.
    pub fn new(
        allocator: Arc<dyn DeviceAllocator>,
        size: usize,
        ctx: &ManagerContext,
    ) -> Result<Self> {
        let ptr = allocator.allocate(size)?;
        Ok(Self::wrap(
            allocator,
            DeviceAllocation { ptr, size },
            true,
            ctx,
        ))
    }

    /// Wraps an externally-supplied device allocation.
    ///
    /// The buffer takes over freeing the allocation. When `sole_owner` is
    /// false, other code is assumed to hold the raw address already, and
    /// the buffer starts out exposed (permanently unspillable).
    pub fn from_device(
        allocator: Arc<dyn DeviceAllocator>,
        allocation: DeviceAllocation,
        sole_owner: bool,
        ctx: &ManagerContext,
    ) -> Self {
        Self::wrap(allocator, allocation, sole_owner, ctx)
    }

    fn wrap(
        allocator: Arc<dyn DeviceAllocator>,
        allocation: DeviceAllocation,
        sole_owner: bool,
        ctx: &ManagerContext,
    ) -> Self {
        let access = AccessCounter::new();
        let manager = ctx.active();
        let inner = Arc::new(BufferInner {
            id: BufferId::new(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            size: allocation.size,
            allocator,
            state: Mutex::new(BufferState {
                storage: Storage::Device(allocation.ptr),
                exposed: !sole_owner,
            }),
            counter: access.observer(),
            manager: manager.as_ref().map_or_else(Weak::new, Arc::downgrade),
        });
        if let Some(manager) = manager {
            manager.register(&inner);
        }
        Self { inner, access }
    }

    /// Buffer size in bytes. Immutable for the buffer's lifetime.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// The buffer's process-unique id.
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// The shared ownership counter for this allocation.
    #[must_use]
    pub fn access_counter(&self) -> &AccessCounter {
        &self.access
    }

    /// Whether the buffer is eligible to be spilled right now: device
    /// resident, never exposed, and sole owner. Pure predicate, no side
    /// effects.
    #[must_use]
    pub fn spillable(&self) -> bool {
        self.inner.spillable()
    }

    /// Whether the contents currently live in host memory.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.inner.is_spilled()
    }

    /// Current residency of the contents.
    #[must_use]
    pub fn residency(&self) -> Residency {
        if self.inner.is_spilled() {
            Residency::Host
        } else {
            Residency::Device
        }
    }

    /// Returns the raw device address, unspilling first if needed, and
    /// permanently marks the buffer exposed.
    ///
    /// This is the only way external code legitimately obtains a
    /// long-lived raw address. After the first call the buffer can never
    /// again be chosen for spilling; repeated calls are idempotent.
    pub fn expose_pointer(&self) -> Result<DevicePtr> {
        self.inner.expose_pointer()
    }

    /// Explicitly moves the contents to the target residency.
    ///
    /// Spilling (`target == Residency::Host`) fails with an "unspillable
    /// buffer" error if the buffer is exposed, shared between owners, or
    /// already spilled. Unspilling carries no such restriction and is a
    /// no-op on a device-resident buffer.
    pub fn move_inplace(&self, target: Residency) -> Result<()> {
        match target {
            Residency::Host => self.inner.move_to_host(),
            Residency::Device => self.inner.move_to_device().map(|_| ()),
        }
    }

    /// Overwrites the buffer contents from a host slice, without exposing
    /// the buffer or changing its residency. `data` must match the buffer
    /// size exactly.
    pub fn copy_from_slice(&self, data: &[u8]) -> Result<()> {
        self.inner.write_bytes(data)
    }

    /// Copies the buffer contents into a host vector, without exposing
    /// the buffer or changing its residency.
    pub fn to_host_vec(&self) -> Result<Vec<u8>> {
        self.inner.read_bytes()
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        // Duplication holds the state lock so it cannot interleave with a
        // transition that already validated sole ownership.
        let _state = self.inner.state.lock();
        Self {
            inner: Arc::clone(&self.inner),
            access: self.access.share(),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field(
                "residency",
                match &state.storage {
                    Storage::Device(_) => &Residency::Device,
                    Storage::Host(_) => &Residency::Host,
                },
            )
            .field("exposed", &state.exposed)
            .field("use_count", &self.access.use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spillway_common::HeapAllocator;

    fn heap() -> Arc<HeapAllocator> {
        Arc::new(HeapAllocator::new())
    }

    #[test]
    fn test_spillable_buffer() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();
        assert!(buf.spillable());
        assert_eq!(buf.access_counter().use_count(), 1);

        buf.expose_pointer().unwrap();
        assert!(!buf.spillable());
    }

    #[test]
    fn test_expose_pointer_is_idempotent() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();

        let first = buf.expose_pointer().unwrap();
        let second = buf.expose_pointer().unwrap();
        assert_eq!(first, second);
        assert!(!buf.spillable());
    }

    #[test]
    fn test_spilling_buffer() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();

        buf.move_inplace(Residency::Host).unwrap();
        assert!(buf.is_spilled());
        assert_eq!(buf.residency(), Residency::Host);

        // Exposing triggers an implicit unspill.
        buf.expose_pointer().unwrap();
        assert!(!buf.is_spilled());

        let err = buf.move_inplace(Residency::Host).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(err.to_string().starts_with("unspillable buffer"));
    }

    #[test]
    fn test_spill_already_spilled() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();

        buf.move_inplace(Residency::Host).unwrap();
        let err = buf.move_inplace(Residency::Host).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                reason: "already spilled"
            }
        ));
    }

    #[test]
    fn test_unspill_on_device_is_noop() {
        let allocator = heap();
        let ctx = ManagerContext::new();
        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();

        buf.move_inplace(Residency::Device).unwrap();
        assert!(!buf.is_spilled());
        assert_eq!(allocator.allocation_count(), 1);
    }

    #[test]
    fn test_shared_ownership_blocks_spilling() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();
        assert!(buf.spillable());

        let view = buf.clone();
        assert_eq!(buf.access_counter().use_count(), 2);
        assert_eq!(view.access_counter().use_count(), 2);
        assert!(!buf.spillable());
        assert!(matches!(
            buf.move_inplace(Residency::Host).unwrap_err(),
            Error::InvalidTransition {
                reason: "shared between owners"
            }
        ));

        drop(view);
        assert_eq!(buf.access_counter().use_count(), 1);
        assert!(buf.spillable());
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 4, &ctx).unwrap();
        buf.copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        buf.move_inplace(Residency::Host).unwrap();
        // Contents stay readable while spilled.
        assert_eq!(buf.to_host_vec().unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);

        buf.move_inplace(Residency::Device).unwrap();
        assert_eq!(buf.residency(), Residency::Device);
        assert_eq!(buf.to_host_vec().unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_writes_survive_spill_in_either_residency() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 3, &ctx).unwrap();

        buf.move_inplace(Residency::Host).unwrap();
        buf.copy_from_slice(&[1, 2, 3]).unwrap();
        buf.move_inplace(Residency::Device).unwrap();
        assert_eq!(buf.to_host_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_copy_from_slice_rejects_wrong_length() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 4, &ctx).unwrap();
        assert!(buf.copy_from_slice(&[1, 2]).is_err());
    }

    #[test]
    fn test_non_sole_owner_starts_exposed() {
        let allocator = heap();
        let ctx = ManagerContext::new();
        let allocation = DeviceAllocation {
            ptr: allocator.allocate(10).unwrap(),
            size: 10,
        };
        let buf = Buffer::from_device(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, allocation, false, &ctx);

        assert!(!buf.spillable());
        assert!(matches!(
            buf.move_inplace(Residency::Host).unwrap_err(),
            Error::InvalidTransition {
                reason: "exposed pointer"
            }
        ));
    }

    #[test]
    fn test_spill_frees_device_side() {
        let allocator = heap();
        let ctx = ManagerContext::new();
        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();
        assert_eq!(allocator.allocated_bytes(), 10);

        buf.move_inplace(Residency::Host).unwrap();
        assert_eq!(allocator.allocated_bytes(), 0);

        buf.move_inplace(Residency::Device).unwrap();
        assert_eq!(allocator.allocated_bytes(), 10);
    }

    #[test]
    fn test_drop_frees_storage() {
        let allocator = heap();
        let ctx = ManagerContext::new();

        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();
        drop(buf);
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.allocation_count(), 0);

        // Dropping while spilled has no device side to free.
        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();
        buf.move_inplace(Residency::Host).unwrap();
        drop(buf);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_drop_of_clone_keeps_allocation() {
        let allocator = heap();
        let ctx = ManagerContext::new();

        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();
        let view = buf.clone();
        drop(buf);
        assert_eq!(allocator.allocated_bytes(), 10);
        assert_eq!(view.access_counter().use_count(), 1);
        assert!(view.spillable());
    }

    #[test]
    fn test_failed_unspill_leaves_buffer_spilled() {
        let allocator = Arc::new(HeapAllocator::with_capacity(16));
        let ctx = ManagerContext::new();

        let buf = Buffer::new(Arc::clone(&allocator) as Arc<dyn DeviceAllocator>, 10, &ctx).unwrap();
        buf.copy_from_slice(&[7u8; 10]).unwrap();
        buf.move_inplace(Residency::Host).unwrap();

        // Another allocation eats the headroom the unspill would need.
        let hog = allocator.allocate(10).unwrap();
        let err = buf.move_inplace(Residency::Device).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion { requested: 10 }));
        assert!(buf.is_spilled());
        assert_eq!(buf.to_host_vec().unwrap(), vec![7u8; 10]);

        allocator.free(hog).unwrap();
        buf.move_inplace(Residency::Device).unwrap();
        assert_eq!(buf.to_host_vec().unwrap(), vec![7u8; 10]);
    }

    #[test]
    fn test_exposure_survives_residency_changes() {
        let ctx = ManagerContext::new();
        let buf = Buffer::new(heap(), 10, &ctx).unwrap();

        buf.move_inplace(Residency::Host).unwrap();
        buf.expose_pointer().unwrap();

        // Unspilled by exposure, and exposure never resets.
        assert!(!buf.is_spilled());
        assert!(!buf.spillable());
        buf.move_inplace(Residency::Device).unwrap();
        assert!(!buf.spillable());
    }
}
