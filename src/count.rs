use std::{
    fmt,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

/// Embeddable ownership count.
///
/// A managed object carries one of these by composition and exposes it
/// through [`Counted`]. Handles register and deregister themselves with
/// [`acquire`]/[`release`]; the handle that observes the drop to zero is
/// responsible for destructing the object.
///
/// The count belongs to the object's identity, not its value, so copying or
/// defaulting a `Shared` always yields a fresh zero count.
///
/// [`acquire`]: Shared::acquire
/// [`release`]: Shared::release
pub struct Shared {
    count: AtomicUsize,
}

impl Shared {
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Registers an owner. Never allocates, never fails.
    pub fn acquire(&self) {
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(previous != usize::MAX, "Shared count overflow");
    }

    /// Deregisters an owner.
    ///
    /// True iff this was the last owner, in which case the caller must
    /// destruct the object. Exactly one of any number of concurrently
    /// releasing threads observes true.
    pub fn release(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous != 0, "Shared count underflow");
        if previous == 1 {
            // Order the destructor after every preceding release.
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Current number of owners.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

// The count is never carried over to a new object.
impl Clone for Shared {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({})", self.count())
    }
}

/// Contract of objects whose lifetime is governed by a [`Shared`] count.
///
/// Implement by embedding a `Shared` field and returning it here.
pub trait Counted {
    fn counter(&self) -> &Shared;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Value {
        shared: Shared,
    }

    impl Counted for Value {
        fn counter(&self) -> &Shared {
            &self.shared
        }
    }

    #[test]
    fn acquire_release_sequence() {
        let value = Value {
            shared: Shared::new(),
        };
        let counter = value.counter();
        assert_eq!(counter.count(), 0);

        counter.acquire();
        counter.acquire();
        assert_eq!(counter.count(), 2);

        assert!(!counter.release());
        assert_eq!(counter.count(), 1);
        assert!(counter.release());
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn copies_start_at_zero() {
        let shared = Shared::new();
        shared.acquire();
        shared.acquire();

        assert_eq!(shared.clone().count(), 0);
        assert_eq!(Shared::default().count(), 0);
        assert_eq!(shared.count(), 2);
    }

    /// Exactly one of the concurrently releasing threads may observe the
    /// drop to zero.
    #[test]
    fn zero_observed_once() {
        let threads = 16;
        let shared = Arc::new(Shared::new());
        for _ in 0..threads {
            shared.acquire();
        }

        let mut handles = Vec::new();
        for _ in 0..threads {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || shared.release() as usize));
        }

        let zero_transitions: usize = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();
        assert_eq!(zero_transitions, 1);
        assert_eq!(shared.count(), 0);
    }
}
