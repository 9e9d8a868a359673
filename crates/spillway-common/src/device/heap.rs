//! Heap-backed device emulation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{DeviceAllocator, DevicePtr};
use crate::utils::error::{Error, Result};
use crate::utils::hash::FxHashMap;

/// First synthetic address handed out. Address zero is never valid.
const BASE_ADDR: u64 = 0x1000;

/// Spacing unit between synthetic addresses.
const ADDR_ALIGN: usize = 256;

/// Device allocator emulated on the host heap.
///
/// Hands out synthetic addresses backed by heap storage, so the full
/// spill machinery can run without a GPU. An optional byte capacity makes
/// allocation failure reachable in tests. A real backend implements
/// [`DeviceAllocator`] against its driver instead.
pub struct HeapAllocator {
    /// Live allocations keyed by synthetic address.
    allocations: Mutex<FxHashMap<u64, Box<[u8]>>>,
    /// Next synthetic address to hand out.
    next_addr: AtomicU64,
    /// Optional capacity cap in bytes.
    capacity: Option<usize>,
    /// Bytes currently allocated. Mutated only under the allocations
    /// lock; read lock-free by accounting queries.
    allocated: AtomicUsize,
}

impl HeapAllocator {
    /// Creates an allocator with unbounded capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates an allocator that fails allocations once `capacity` live
    /// bytes would be exceeded.
    #[must_use]
    pub fn with_capacity(capacity: impl Into<Option<usize>>) -> Self {
        Self {
            allocations: Mutex::new(FxHashMap::default()),
            next_addr: AtomicU64::new(BASE_ADDR),
            capacity: capacity.into(),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated on the emulated device.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    /// The configured capacity cap, if any.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<DevicePtr> {
        let mut allocations = self.allocations.lock();

        if let Some(capacity) = self.capacity {
            let live = self.allocated.load(Ordering::Acquire);
            if live + size > capacity {
                return Err(Error::ResourceExhaustion { requested: size });
            }
        }

        let step = size.max(1).next_multiple_of(ADDR_ALIGN) as u64;
        let addr = self.next_addr.fetch_add(step, Ordering::Relaxed);
        allocations.insert(addr, vec![0u8; size].into_boxed_slice());
        self.allocated.fetch_add(size, Ordering::Release);

        Ok(DevicePtr::new(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let region = allocations
            .remove(&ptr.as_u64())
            .ok_or(Error::InvalidAddress(ptr.as_u64()))?;
        self.allocated.fetch_sub(region.len(), Ordering::Release);
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let allocations = self.allocations.lock();
        let region = allocations
            .get(&src.as_u64())
            .ok_or(Error::InvalidAddress(src.as_u64()))?;
        if dst.len() > region.len() {
            return Err(Error::Internal(format!(
                "copy of {} bytes exceeds allocation of {} bytes",
                dst.len(),
                region.len()
            )));
        }
        dst.copy_from_slice(&region[..dst.len()]);
        Ok(())
    }

    fn copy_from_host(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let region = allocations
            .get_mut(&dst.as_u64())
            .ok_or(Error::InvalidAddress(dst.as_u64()))?;
        if src.len() > region.len() {
            return Err(Error::Internal(format!(
                "copy of {} bytes exceeds allocation of {} bytes",
                src.len(),
                region.len()
            )));
        }
        region[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let alloc = HeapAllocator::new();
        let ptr = alloc.allocate(64).unwrap();
        assert_eq!(alloc.allocated_bytes(), 64);
        assert_eq!(alloc.allocation_count(), 1);

        alloc.free(ptr).unwrap();
        assert_eq!(alloc.allocated_bytes(), 0);
        assert_eq!(alloc.allocation_count(), 0);
    }

    #[test]
    fn test_copy_round_trip() {
        let alloc = HeapAllocator::new();
        let ptr = alloc.allocate(4).unwrap();

        alloc.copy_from_host(&[0xDE, 0xAD, 0xBE, 0xEF], ptr).unwrap();
        let mut out = [0u8; 4];
        alloc.copy_to_host(ptr, &mut out).unwrap();
        assert_eq!(out, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let alloc = HeapAllocator::with_capacity(100);
        let ptr = alloc.allocate(80).unwrap();

        let err = alloc.allocate(32).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion { requested: 32 }));

        // Freeing restores headroom.
        alloc.free(ptr).unwrap();
        alloc.allocate(100).unwrap();
    }

    #[test]
    fn test_free_unknown_address() {
        let alloc = HeapAllocator::new();
        let err = alloc.free(DevicePtr::new(0xDEAD)).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(0xDEAD)));
    }

    #[test]
    fn test_oversized_copy_rejected() {
        let alloc = HeapAllocator::new();
        let ptr = alloc.allocate(2).unwrap();
        let mut out = [0u8; 4];
        assert!(alloc.copy_to_host(ptr, &mut out).is_err());
        assert!(alloc.copy_from_host(&[0u8; 4], ptr).is_err());
    }

    #[test]
    fn test_zero_sized_allocation() {
        let alloc = HeapAllocator::new();
        let a = alloc.allocate(0).unwrap();
        let b = alloc.allocate(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.allocated_bytes(), 0);
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
    }
}
