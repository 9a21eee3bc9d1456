use std::ptr::NonNull;

use crate::{count::Counted, storage::Storage};

/// Ownership policy over a [`Storage`]: counts handles and destructs the
/// referent when the last one lets go.
///
/// The count lives inside the referent, so a handle has no state beyond its
/// storage. Wrapping and cloning register an owner, dropping deregisters
/// one, and the handle that observes the drop to zero delegates teardown to
/// the storage. Which teardown that is (plain or chain-aware) is the
/// storage's business.
///
/// Moving a handle transfers ownership without count traffic. Assigning over
/// a handle forms the incoming value before the old one is released, so
/// assigning something reachable through the current value is safe.
pub struct RefCounted<S: Storage>
where
    S::Value: Counted,
{
    storage: S,
}

impl<S: Storage> RefCounted<S>
where
    S::Value: Counted,
{
    /// Wraps a storage, registering as an owner of its referent.
    pub fn new(storage: S) -> Self {
        if let Some(object) = storage.object() {
            // This is safe since the storage holds a live referent.
            unsafe { object.as_ref() }.counter().acquire();
        }
        Self { storage }
    }

    pub fn object(&self) -> Option<NonNull<S::Value>> {
        self.storage.object()
    }

    pub fn allocator(&self) -> &S::Alloc {
        self.storage.allocator()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Number of handles owning the referent. 0 when empty.
    pub fn use_count(&self) -> usize {
        match self.storage.object() {
            // This is safe since the storage holds a live referent.
            Some(object) => unsafe { object.as_ref() }.counter().count(),
            None => 0,
        }
    }

    /// True iff this is the only owner.
    pub fn unique(&self) -> bool {
        self.use_count() == 1
    }

    /// Moves ownership into the returned handle, leaving this one empty.
    /// The count is not touched.
    pub fn take(&mut self) -> Self {
        Self {
            storage: self.storage.take(),
        }
    }

    pub fn swap(&mut self, that: &mut Self) {
        self.storage.swap(&mut that.storage);
    }

    /// Dismantles the handle without releasing; the caller takes over the
    /// ownership this handle held.
    pub(crate) fn into_storage(self) -> S {
        // SAFETY: We are immediately forgetting self so read/copy is safe.
        unsafe {
            let storage = std::ptr::read(&self.storage);
            std::mem::forget(self);
            storage
        }
    }
}

impl<S: Storage> Clone for RefCounted<S>
where
    S::Value: Counted,
{
    /// Another owning handle to the same referent.
    fn clone(&self) -> Self {
        Self::new(self.storage.clone())
    }
}

impl<S: Storage> Drop for RefCounted<S>
where
    S::Value: Counted,
{
    fn drop(&mut self) {
        if let Some(object) = self.storage.object() {
            // This is safe since the storage holds a live referent.
            if unsafe { object.as_ref() }.counter().release() {
                // Last owner out destructs.
                unsafe { self.storage.destruct() };
            }
        }
    }
}
