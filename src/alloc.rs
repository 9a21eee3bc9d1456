use std::{
    alloc::{AllocError, Allocator, Global, Layout},
    borrow::Borrow,
    ops::Deref,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ahash::AHashMap;
use getset::CopyGetters;
use log::warn;
use parking_lot::Mutex;

/// Freed memory is filled with this so that use after free reads garbage
/// instead of stale values.
const POISON: u8 = 0xed;

/// What a live allocation looked like when it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Allocation {
    /// Position in the allocation order, starting at 0.
    index: usize,
    layout: Layout,
}

/// Allocator wrapper that records every allocation until it is returned.
///
/// Releasing memory it never handed out, or with a different layout than it
/// was allocated with, panics. Freed memory is poisoned. Allocations still
/// live when the allocator drops are logged as leaks; tests call
/// [`check_done`] to turn them into failures instead.
///
/// A specific allocation can be made to fail through [`fail_at`], for
/// driving the failure paths of callers.
///
/// [`check_done`]: TrackingAllocator::check_done
/// [`fail_at`]: TrackingAllocator::fail_at
pub struct TrackingAllocator<A: Allocator = Global> {
    base: A,
    live: Mutex<AHashMap<usize, Allocation>>,
    total: AtomicUsize,
    fail_index: AtomicUsize,
}

impl TrackingAllocator<Global> {
    pub fn new() -> Self {
        Self::wrap(Global)
    }
}

impl<A: Allocator> TrackingAllocator<A> {
    pub fn wrap(base: A) -> Self {
        Self {
            base,
            live: Mutex::new(AHashMap::new()),
            total: AtomicUsize::new(0),
            fail_index: AtomicUsize::new(usize::MAX),
        }
    }

    /// Number of allocations currently out.
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    /// Number of allocations made over the lifetime, including failed ones.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// The record of the live allocation at `address`, if any.
    pub fn allocation_at(&self, address: usize) -> Option<Allocation> {
        self.live.lock().get(&address).copied()
    }

    /// Makes the allocation with the given index fail with [`AllocError`].
    pub fn fail_at(&self, index: usize) {
        self.fail_index.store(index, Ordering::Relaxed);
    }

    /// Panics unless everything allocated has been returned.
    pub fn check_done(&self) {
        let live = self.live.lock();
        assert!(
            live.is_empty(),
            "{} allocations were not returned, first is no. {}",
            live.len(),
            live.values().map(|allocation| allocation.index).min().unwrap()
        );
    }
}

impl Default for TrackingAllocator<Global> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let index = self.total.fetch_add(1, Ordering::Relaxed);
        if index == self.fail_index.load(Ordering::Relaxed) {
            return Err(AllocError);
        }

        let memory = self.base.allocate(layout)?;
        let address = memory.cast::<u8>().as_ptr() as usize;
        let previous = self.live.lock().insert(address, Allocation { index, layout });
        assert!(
            previous.is_none(),
            "Base allocator returned live memory at {:#x}",
            address
        );
        Ok(memory)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let address = ptr.as_ptr() as usize;
        match self.live.lock().remove(&address) {
            Some(allocation) => assert!(
                allocation.layout() == layout,
                "Returned allocation no. {} at {:#x} with layout {:?}, allocated as {:?}",
                allocation.index(),
                address,
                layout,
                allocation.layout()
            ),
            None => panic!("Returned memory at {:#x} that was never allocated", address),
        }

        // This is safe since the memory is still allocated and the caller
        // hands exclusive access to it over to us.
        unsafe { ptr.as_ptr().write_bytes(POISON, layout.size()) };
        unsafe { self.base.deallocate(ptr, layout) };
    }
}

impl<A: Allocator> Drop for TrackingAllocator<A> {
    fn drop(&mut self) {
        for (address, allocation) in self.live.get_mut().iter() {
            warn!(
                "Leaked allocation no. {} of {:?} at {:#x}",
                allocation.index(),
                allocation.layout(),
                address
            );
        }
    }
}

/// Clonable handle to a [`TrackingAllocator`], for use as a pointer
/// allocator. Two handles compare equal iff they share the underlying
/// allocator.
pub struct SharedTracking<A: Allocator = Global>(Arc<TrackingAllocator<A>>);

impl SharedTracking<Global> {
    pub fn new() -> Self {
        Self::wrap(Global)
    }
}

impl<A: Allocator> SharedTracking<A> {
    pub fn wrap(base: A) -> Self {
        Self(Arc::new(TrackingAllocator::wrap(base)))
    }
}

impl<A: Allocator> Clone for SharedTracking<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Default for SharedTracking<Global> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<A: Allocator> Allocator for SharedTracking<A> {
    #[inline(always)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.0.allocate(layout)
    }

    #[inline(always)]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.deallocate(ptr, layout)
    }
}

impl<A: Allocator> PartialEq for SharedTracking<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<A: Allocator> Eq for SharedTracking<A> {}

impl<A: Allocator> Borrow<TrackingAllocator<A>> for SharedTracking<A> {
    fn borrow(&self) -> &TrackingAllocator<A> {
        &self.0
    }
}

impl<A: Allocator> Deref for SharedTracking<A> {
    type Target = TrackingAllocator<A>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_slices(
        allocator: &TrackingAllocator,
        n: usize,
        start: u8,
    ) -> Vec<(NonNull<[u8]>, Layout)> {
        let mut slices = Vec::new();
        let mut sum = start;

        for i in 0..n {
            let layout = Layout::from_size_align(i + 1, 1).unwrap();
            let mut slice_ptr = allocator.allocate(layout).unwrap();
            let slice = unsafe { slice_ptr.as_mut() };
            for byte in &mut slice[..layout.size()] {
                *byte = sum;
                sum = sum.wrapping_add(1);
            }
            slices.push((slice_ptr, layout));
        }

        slices
    }

    fn validate_slices(slices: &[(NonNull<[u8]>, Layout)], start: u8) {
        let mut sum = start;
        for (slice_ptr, layout) in slices {
            let slice = unsafe { slice_ptr.as_ref() };
            for byte in &slice[..layout.size()] {
                assert_eq!(*byte, sum);
                sum = sum.wrapping_add(1);
            }
        }
    }

    fn deallocate_slices(allocator: &TrackingAllocator, slices: Vec<(NonNull<[u8]>, Layout)>) {
        for (slice_ptr, layout) in slices {
            unsafe { allocator.deallocate(slice_ptr.cast(), layout) };
        }
    }

    #[test]
    fn tracks_allocations() {
        let allocator = TrackingAllocator::new();
        let slices = add_slices(&allocator, 100, 0);
        assert_eq!(allocator.live(), 100);
        assert_eq!(allocator.total(), 100);

        validate_slices(&slices, 0);

        let (first, _) = slices[0];
        let record = allocator
            .allocation_at(first.cast::<u8>().as_ptr() as usize)
            .unwrap();
        assert_eq!(record.index(), 0);
        assert_eq!(record.layout(), Layout::from_size_align(1, 1).unwrap());

        deallocate_slices(&allocator, slices);
        allocator.check_done();
        assert_eq!(allocator.total(), 100);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn rejects_foreign_memory() {
        let allocator = TrackingAllocator::new();
        let layout = Layout::new::<u64>();
        let memory = Global.allocate(layout).unwrap();
        unsafe { allocator.deallocate(memory.cast(), layout) };
    }

    #[test]
    #[should_panic(expected = "layout")]
    fn rejects_wrong_layout() {
        let allocator = TrackingAllocator::new();
        let memory = allocator.allocate(Layout::new::<u64>()).unwrap();
        unsafe { allocator.deallocate(memory.cast(), Layout::new::<u32>()) };
    }

    #[test]
    fn injects_failure() {
        let allocator = TrackingAllocator::new();
        allocator.fail_at(1);

        let layout = Layout::new::<u64>();
        let memory = allocator.allocate(layout).unwrap();
        assert!(allocator.allocate(layout).is_err());
        let recovered = allocator.allocate(layout).unwrap();

        unsafe {
            allocator.deallocate(memory.cast(), layout);
            allocator.deallocate(recovered.cast(), layout);
        }
        allocator.check_done();
        assert_eq!(allocator.total(), 3);
    }

    #[test]
    fn shared_handles_compare_by_identity() {
        let one = SharedTracking::new();
        let alias = one.clone();
        let other = SharedTracking::new();

        assert!(one == alias);
        assert!(one != other);
    }

    #[test]
    fn multi_thread() {
        let threads = 16;
        let repetitions = 50;
        let allocator = Arc::new(TrackingAllocator::new());

        let mut handles = Vec::new();
        for i in 0..threads {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..repetitions {
                    let slices = add_slices(&allocator, 20, (i * j) as u8);
                    validate_slices(&slices, (i * j) as u8);
                    deallocate_slices(&allocator, slices);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        allocator.check_done();
    }
}
