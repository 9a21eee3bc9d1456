use std::{
    alloc::{Allocator, Global},
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    ptr::NonNull,
};

use crate::{
    count::Counted,
    error::ConstructError,
    lifetime::RefCounted,
    recursive::Recursive,
    storage::{AllocStorage, HeapStorage, Storage},
};

/// Shared ownership pointer assembled from policies.
///
/// A `Pointer` is a [`RefCounted`] lifetime over a [`Recursive`]
/// chain-aware decorator over the storage `S`, with pointer-like access and
/// owner based ordering on top. Swapping the storage yields a different
/// pointer flavor with the same behavior; [`SmallPtr`] and [`HeapPtr`] are
/// the two provided ones.
///
/// The payload embeds the count (see [`Counted`]), so a handle is just the
/// storage: one pointer for [`HeapPtr`], a (pointer, allocator) pair for
/// [`SmallPtr`]. That makes these a good fit for use inside containers and
/// inside the payload type itself. A payload that points to its own type
/// should also implement [`RecursiveNext`] so that long chains are torn
/// down iteratively; see that trait for the contract.
///
/// Comparisons are owner based: two pointers are equal iff they reference
/// the same object, or are both empty. The order is over referent addresses
/// and carries no meaning about the payload, it only makes pointers usable
/// as map keys.
///
/// [`RecursiveNext`]: crate::recursive::RecursiveNext
pub struct Pointer<S: Storage>
where
    S::Value: Counted,
{
    inner: RefCounted<Recursive<S>>,
}

/// Pointer to an object in memory of a caller-supplied allocator.
pub type SmallPtr<T, A = Global> = Pointer<AllocStorage<T, A>>;

/// Pointer to an object in the global heap.
pub type HeapPtr<T> = Pointer<HeapStorage<T>>;

impl<S: Storage> Pointer<S>
where
    S::Value: Counted,
{
    /// Wraps a storage, registering as an owner of its referent.
    pub fn from_storage(storage: S) -> Self {
        Self {
            inner: RefCounted::new(Recursive::new(storage)),
        }
    }

    /// The managed object, or None if empty.
    pub fn get(&self) -> Option<&S::Value> {
        // This is safe since a live handle keeps the referent alive.
        self.inner.object().map(|object| unsafe { &*object.as_ptr() })
    }

    /// Exclusive access to the managed object, available only while no
    /// other handle shares it.
    pub fn get_mut(&mut self) -> Option<&mut S::Value> {
        if self.unique() {
            // This is safe since we are the only owner and hold the handle
            // exclusively.
            self.inner.object().map(|object| unsafe { &mut *object.as_ptr() })
        } else {
            None
        }
    }

    /// Raw address of the managed object; null if empty.
    pub fn as_ptr(&self) -> *mut S::Value {
        match self.inner.object() {
            Some(object) => object.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The allocator this pointer releases memory through.
    pub fn allocator(&self) -> &S::Alloc {
        self.inner.allocator()
    }

    /// Number of pointers owning the object. 0 if empty.
    pub fn use_count(&self) -> usize {
        self.inner.use_count()
    }

    /// True iff this is the only owner of the object.
    pub fn unique(&self) -> bool {
        self.inner.unique()
    }

    /// Moves ownership into the returned pointer, leaving this one empty.
    pub fn take(&mut self) -> Self {
        Self {
            inner: self.inner.take(),
        }
    }

    pub fn swap(&mut self, that: &mut Self) {
        self.inner.swap(&mut that.inner);
    }

    /// Dismantles the handle without releasing.
    pub(crate) fn into_storage(self) -> Recursive<S> {
        self.inner.into_storage()
    }
}

impl<T: Counted, A: Allocator + Clone> SmallPtr<T, A> {
    /// Empty pointer associated with `allocator`.
    pub fn new_in(allocator: A) -> Self {
        Self::from_storage(AllocStorage::new_in(allocator))
    }

    /// The preferred way of creating a managed object: allocates from
    /// `allocator`, moves `value` in, and returns the sole owner.
    pub fn construct(allocator: A, value: T) -> Self {
        Self::from_storage(AllocStorage::with_value_in(allocator, value))
    }

    /// Two phase variant: allocates first, then builds the payload with
    /// `init`. If `init` panics the memory goes back to the allocator
    /// before the unwind continues.
    pub fn construct_with(allocator: A, init: impl FnOnce() -> T) -> Self {
        Self::from_storage(AllocStorage::with_in(allocator, init))
    }

    /// Fallible variant of [`construct_with`]: allocation failure and
    /// initializer errors are reported instead of fatal, with nothing
    /// leaked either way.
    ///
    /// [`construct_with`]: SmallPtr::construct_with
    pub fn try_construct_with<E>(
        allocator: A,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Self, ConstructError<E>> {
        Ok(Self::from_storage(AllocStorage::try_with_in(
            allocator, init,
        )?))
    }

    /// Starts owning an object other code placed in memory of `allocator`.
    /// The object's owner count is increased, so sharing works.
    ///
    /// SAFETY: `object` must have been allocated from `allocator`, or from
    /// an allocator equal to it, with the layout of `T`, must hold a live
    /// value, and its count must reflect exactly the handles that exist.
    pub unsafe fn from_raw(object: NonNull<T>, allocator: A) -> Self {
        Self::from_storage(unsafe { AllocStorage::from_raw(object, allocator) })
    }
}

impl<T: Counted> HeapPtr<T> {
    /// Empty pointer.
    pub fn new() -> Self {
        Self::from_storage(HeapStorage::new())
    }

    /// The preferred way of creating a managed object in the global heap.
    pub fn construct(value: T) -> Self {
        Self::from_storage(HeapStorage::with_value(value))
    }

    /// Two phase variant; see [`SmallPtr::construct_with`].
    pub fn construct_with(init: impl FnOnce() -> T) -> Self {
        Self::from_storage(HeapStorage::with(init))
    }

    /// Fallible variant; see [`SmallPtr::try_construct_with`].
    pub fn try_construct_with<E>(
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Self, ConstructError<E>> {
        Ok(Self::from_storage(HeapStorage::try_with(init)?))
    }
}

impl<T: Counted> Default for HeapPtr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> Clone for Pointer<S>
where
    S::Value: Counted,
{
    /// Another owning pointer to the same object.
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Storage> Deref for Pointer<S>
where
    S::Value: Counted,
{
    type Target = S::Value;

    /// Panics if empty.
    fn deref(&self) -> &S::Value {
        self.get().expect("Dereferenced an empty pointer")
    }
}

impl<S: Storage> Eq for Pointer<S> where S::Value: Counted {}

impl<S: Storage> PartialEq for Pointer<S>
where
    S::Value: Counted,
{
    fn eq(&self, that: &Self) -> bool {
        self.as_ptr() == that.as_ptr()
    }
}

impl<S: Storage> Ord for Pointer<S>
where
    S::Value: Counted,
{
    fn cmp(&self, that: &Self) -> std::cmp::Ordering {
        self.as_ptr().cmp(&that.as_ptr())
    }
}

impl<S: Storage> PartialOrd for Pointer<S>
where
    S::Value: Counted,
{
    fn partial_cmp(&self, that: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(that))
    }
}

// Hash
impl<S: Storage> Hash for Pointer<S>
where
    S::Value: Counted,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.as_ptr() as usize).hash(state);
    }
}

// Debug
impl<S: Storage> fmt::Debug for Pointer<S>
where
    S::Value: Counted,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.object() {
            Some(object) => write!(f, "Pointer({:p})", object),
            None => write!(f, "Pointer(empty)"),
        }
    }
}
