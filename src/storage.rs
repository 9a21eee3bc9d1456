use std::{
    alloc::{Allocator, Global, Layout},
    ptr::NonNull,
};

use crate::{
    error::ConstructError,
    guard::{construct_in, place_in, try_construct_in},
};

/// Where a managed object lives and how its memory is released.
///
/// A storage is a dumb (pointer, allocator) pair. It gives raw access to the
/// object and knows how to return its memory, but it never destructs the
/// object on its own; deciding when to do that belongs to a lifetime layer
/// such as [`RefCounted`].
///
/// Cloning a storage copies the pointer and clones the allocator without
/// touching any count.
///
/// [`RefCounted`]: crate::lifetime::RefCounted
pub trait Storage: Clone {
    type Value;
    type Alloc: Allocator + Clone;

    /// The managed object, if any.
    fn object(&self) -> Option<NonNull<Self::Value>>;

    /// The allocator the object's memory came from.
    fn allocator(&self) -> &Self::Alloc;

    /// Empties this storage without destructing the referent.
    /// Used when ownership has been transferred elsewhere.
    fn reset(&mut self);

    /// Splits the pointer off into a new storage, leaving this one empty.
    fn take(&mut self) -> Self;

    /// Runs the referent's destructor and returns its memory to the
    /// allocator. Panics if empty.
    ///
    /// SAFETY: the caller must have exclusive access to the referent, must
    /// not have destructed it before, and must not touch it afterwards.
    unsafe fn destruct(&mut self);

    /// Exchanges pointer and allocator with `that`.
    fn swap(&mut self, that: &mut Self);

    fn is_empty(&self) -> bool {
        self.object().is_none()
    }
}

/// Storage in the global heap.
///
/// Carries no allocator state, so a handle over it is a single pointer.
pub struct HeapStorage<T> {
    pointer: Option<NonNull<T>>,
}

impl<T> HeapStorage<T> {
    pub fn new() -> Self {
        Self { pointer: None }
    }

    /// Allocates and moves `value` into the global heap.
    pub fn with_value(value: T) -> Self {
        Self {
            pointer: Some(place_in(&Global, value)),
        }
    }

    /// Allocates first, then builds the payload with `init`.
    pub fn with(init: impl FnOnce() -> T) -> Self {
        Self {
            pointer: Some(construct_in(&Global, init)),
        }
    }

    pub fn try_with<E>(init: impl FnOnce() -> Result<T, E>) -> Result<Self, ConstructError<E>> {
        Ok(Self {
            pointer: Some(try_construct_in(&Global, init)?),
        })
    }
}

impl<T> Storage for HeapStorage<T> {
    type Value = T;
    type Alloc = Global;

    fn object(&self) -> Option<NonNull<T>> {
        self.pointer
    }

    fn allocator(&self) -> &Global {
        &Global
    }

    fn reset(&mut self) {
        self.pointer = None;
    }

    fn take(&mut self) -> Self {
        Self {
            pointer: self.pointer.take(),
        }
    }

    unsafe fn destruct(&mut self) {
        let pointer = self.pointer.expect("Destruct of empty storage");
        // This is safe since the caller guarantees exclusive access to a
        // live referent.
        unsafe {
            std::ptr::drop_in_place(pointer.as_ptr());
            Global.deallocate(pointer.cast(), Layout::new::<T>());
        }
    }

    fn swap(&mut self, that: &mut Self) {
        std::mem::swap(&mut self.pointer, &mut that.pointer);
    }
}

// No count is touched; this is a raw alias of the same object.
impl<T> Clone for HeapStorage<T> {
    fn clone(&self) -> Self {
        Self {
            pointer: self.pointer,
        }
    }
}

impl<T> Default for HeapStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

// This is safe since the storage hands out the referent only through
// shared or exclusive access of the owning handles.
unsafe impl<T: Send + Sync> Send for HeapStorage<T> {}
unsafe impl<T: Send + Sync> Sync for HeapStorage<T> {}

/// Storage in memory of a caller-supplied allocator.
///
/// The allocator rides along with the pointer so that release always goes
/// back to the pool the object came from.
pub struct AllocStorage<T, A: Allocator + Clone> {
    pointer: Option<NonNull<T>>,
    allocator: A,
}

impl<T, A: Allocator + Clone> AllocStorage<T, A> {
    /// Empty storage associated with `allocator`.
    pub fn new_in(allocator: A) -> Self {
        Self {
            pointer: None,
            allocator,
        }
    }

    /// Allocates from `allocator` and moves `value` in.
    pub fn with_value_in(allocator: A, value: T) -> Self {
        Self {
            pointer: Some(place_in(&allocator, value)),
            allocator,
        }
    }

    /// Allocates first, then builds the payload with `init`.
    pub fn with_in(allocator: A, init: impl FnOnce() -> T) -> Self {
        Self {
            pointer: Some(construct_in(&allocator, init)),
            allocator,
        }
    }

    pub fn try_with_in<E>(
        allocator: A,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Self, ConstructError<E>> {
        Ok(Self {
            pointer: Some(try_construct_in(&allocator, init)?),
            allocator,
        })
    }

    /// Adopts an object other code placed in memory of `allocator`.
    ///
    /// SAFETY: `object` must have been allocated from `allocator`, or from
    /// an allocator equal to it, with the layout of `T`, and must hold a
    /// live value.
    pub unsafe fn from_raw(object: NonNull<T>, allocator: A) -> Self {
        Self {
            pointer: Some(object),
            allocator,
        }
    }
}

impl<T, A: Allocator + Clone> Storage for AllocStorage<T, A> {
    type Value = T;
    type Alloc = A;

    fn object(&self) -> Option<NonNull<T>> {
        self.pointer
    }

    fn allocator(&self) -> &A {
        &self.allocator
    }

    fn reset(&mut self) {
        self.pointer = None;
    }

    fn take(&mut self) -> Self {
        Self {
            pointer: self.pointer.take(),
            allocator: self.allocator.clone(),
        }
    }

    unsafe fn destruct(&mut self) {
        let pointer = self.pointer.expect("Destruct of empty storage");
        // This is safe since the caller guarantees exclusive access to a
        // live referent allocated from this allocator.
        unsafe {
            std::ptr::drop_in_place(pointer.as_ptr());
            self.allocator.deallocate(pointer.cast(), Layout::new::<T>());
        }
    }

    fn swap(&mut self, that: &mut Self) {
        std::mem::swap(&mut self.pointer, &mut that.pointer);
        std::mem::swap(&mut self.allocator, &mut that.allocator);
    }
}

// No count is touched; this is a raw alias of the same object.
impl<T, A: Allocator + Clone> Clone for AllocStorage<T, A> {
    fn clone(&self) -> Self {
        Self {
            pointer: self.pointer,
            allocator: self.allocator.clone(),
        }
    }
}

// This is safe since the storage hands out the referent only through
// shared or exclusive access of the owning handles.
unsafe impl<T: Send + Sync, A: Allocator + Clone + Send> Send for AllocStorage<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Clone + Sync> Sync for AllocStorage<T, A> {}
