use std::{
    alloc::{AllocError, Allocator, Layout},
    ptr::NonNull,
};

use crate::error::ConstructError;

/// Returns the allocation on drop unless disarmed.
///
/// Covers the window between allocating memory and successfully writing the
/// payload into it. If the initializer unwinds or errors inside that window,
/// the memory goes back to the allocator instead of leaking.
struct DeallocGuard<'a, T, A: Allocator> {
    object: NonNull<T>,
    allocator: &'a A,
    armed: bool,
}

impl<'a, T, A: Allocator> DeallocGuard<'a, T, A> {
    fn new(object: NonNull<T>, allocator: &'a A) -> Self {
        Self {
            object,
            allocator,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T, A: Allocator> Drop for DeallocGuard<'_, T, A> {
    fn drop(&mut self) {
        if self.armed {
            // Nothing was constructed, only the memory needs to go back.
            unsafe {
                self.allocator
                    .deallocate(self.object.cast(), Layout::new::<T>())
            };
        }
    }
}

fn allocate_one<T, A: Allocator>(allocator: &A) -> Result<NonNull<T>, AllocError> {
    Ok(allocator.allocate(Layout::new::<T>())?.cast::<T>())
}

/// Allocates from `allocator` and moves a finished value in.
///
/// Placing a finished value cannot fail, so no guard is engaged.
pub(crate) fn place_in<T, A: Allocator>(allocator: &A, value: T) -> NonNull<T> {
    let object: NonNull<T> = allocate_one(allocator).expect("Failed to allocate");
    // This is safe since we just allocated the memory and nothing else
    // has access to it.
    unsafe { object.as_ptr().write(value) };
    object
}

/// Allocates from `allocator`, then builds the payload with `init`.
///
/// A panic in `init` returns the memory before the unwind continues.
pub(crate) fn construct_in<T, A: Allocator>(
    allocator: &A,
    init: impl FnOnce() -> T,
) -> NonNull<T> {
    let object: NonNull<T> = allocate_one(allocator).expect("Failed to allocate");
    let guard = DeallocGuard::new(object, allocator);
    let value = init();
    // This is safe since we just allocated the memory and nothing else
    // has access to it.
    unsafe { object.as_ptr().write(value) };
    guard.disarm();
    object
}

/// Fallible variant of [`construct_in`]: `init` may report failure instead
/// of panicking, and allocation failure is reported rather than fatal.
pub(crate) fn try_construct_in<T, A: Allocator, E>(
    allocator: &A,
    init: impl FnOnce() -> Result<T, E>,
) -> Result<NonNull<T>, ConstructError<E>> {
    let object: NonNull<T> = allocate_one(allocator).map_err(|_| ConstructError::alloc::<T>())?;
    let guard = DeallocGuard::new(object, allocator);
    let value = init().map_err(ConstructError::Init)?;
    // This is safe since we just allocated the memory and nothing else
    // has access to it.
    unsafe { object.as_ptr().write(value) };
    guard.disarm();
    Ok(object)
}
