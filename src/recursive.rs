use crate::{count::Counted, pointer::Pointer, storage::Storage};

/* Notes:
- A node owning the next node of the same type turns teardown into a chain:
  dropping the last handle to the head would nest one destructor call per
  node and overflow the stack somewhere in the hundred thousands.
- Moving the successor link out before the node's destructor runs breaks the
  nesting, and the moved-out links can then be walked in a loop.
- Whether a payload forms chains is a per-type fact, so it's expressed as a
  specializable trait with a blanket "no" default.
*/

/// Moves the link to the successor out of a chain node.
///
/// Implement this for payload types that contain a pointer of their own
/// type, returning the moved-out field.
///
/// ```ignore
/// impl RecursiveNext<AllocStorage<Node, Pool>> for Node {
///     fn take_next(&mut self) -> Option<SmallPtr<Node, Pool>> {
///         Some(self.next.take())
///     }
/// }
/// ```
///
/// Without an implementation the blanket default answers `None` and chains
/// of the type are torn down the ordinary, recursive way.
///
/// Chains must be acyclic. A link that reaches itself again keeps its own
/// count above zero and the structure leaks.
pub trait RecursiveNext<S: Storage<Value = Self>>: Counted + Sized {
    /// Takes the successor out, leaving the field empty.
    /// `None` marks the payload as not forming chains.
    fn take_next(&mut self) -> Option<Pointer<S>>;
}

impl<T: Counted, S: Storage<Value = T>> RecursiveNext<S> for T {
    default fn take_next(&mut self) -> Option<Pointer<S>> {
        None
    }
}

/// Storage decorator that destructs chains iteratively.
///
/// Delegates everything to the base storage except [`destruct`], which
/// extracts the successor link before the node dies and then walks the
/// remaining links in a loop, keeping stack depth constant no matter how
/// long the chain is. For payloads without a [`RecursiveNext`]
/// implementation it behaves exactly like the base storage.
///
/// [`destruct`]: Storage::destruct
#[derive(Clone)]
pub struct Recursive<S: Storage> {
    base: S,
}

impl<S: Storage> Recursive<S> {
    pub fn new(base: S) -> Self {
        Self { base }
    }
}

impl<S: Storage> Storage for Recursive<S>
where
    S::Value: Counted,
{
    type Value = S::Value;
    type Alloc = S::Alloc;

    fn object(&self) -> Option<std::ptr::NonNull<S::Value>> {
        self.base.object()
    }

    fn allocator(&self) -> &S::Alloc {
        self.base.allocator()
    }

    fn reset(&mut self) {
        self.base.reset();
    }

    fn take(&mut self) -> Self {
        Self {
            base: self.base.take(),
        }
    }

    unsafe fn destruct(&mut self) {
        let mut object = self.base.object().expect("Destruct of empty storage");
        // Pull the successor out first. The node then dies with an empty
        // next field and its destructor cannot re-enter the chain.
        // This is safe since the caller guarantees exclusive access.
        let next = RecursiveNext::<S>::take_next(unsafe { object.as_mut() });
        unsafe { self.base.destruct() };
        if let Some(next) = next {
            if !next.is_empty() {
                release_chain(next);
            }
        }
    }

    fn swap(&mut self, that: &mut Self) {
        self.base.swap(&mut that.base);
    }
}

/// Releases a chain of links one loop iteration at a time.
///
/// Each iteration deregisters the handle taken over from the just-destructed
/// predecessor. A link someone else still owns ends the walk; a link that
/// drops to zero is destructed after its own successor has been moved out,
/// and the walk continues there.
fn release_chain<S: Storage>(head: Pointer<S>)
where
    S::Value: Counted,
{
    // Dismantled so that dropping the handle cannot release a second time.
    let mut current = head.into_storage();
    loop {
        let mut object = match current.base.object() {
            Some(object) => object,
            None => break,
        };
        // This is safe since the storage holds a live referent.
        if !unsafe { object.as_ref() }.counter().release() {
            // The rest of the chain is still owned elsewhere.
            break;
        }
        let next = RecursiveNext::<S>::take_next(unsafe { object.as_mut() });
        // This is safe since the count just dropped to zero, leaving us the
        // only owner.
        unsafe { current.base.destruct() };
        match next {
            Some(next) => current = next.into_storage(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc::SharedTracking,
        count::Shared,
        pointer::SmallPtr,
        storage::AllocStorage,
    };

    struct Link {
        value: usize,
        next: SmallPtr<Link, SharedTracking>,
        shared: Shared,
    }

    impl Link {
        fn new(value: usize, next: SmallPtr<Link, SharedTracking>) -> Self {
            Self {
                value,
                next,
                shared: Shared::new(),
            }
        }
    }

    impl Counted for Link {
        fn counter(&self) -> &Shared {
            &self.shared
        }
    }

    impl RecursiveNext<AllocStorage<Link, SharedTracking>> for Link {
        fn take_next(&mut self) -> Option<SmallPtr<Link, SharedTracking>> {
            Some(self.next.take())
        }
    }

    struct Flat {
        shared: Shared,
    }

    impl Counted for Flat {
        fn counter(&self) -> &Shared {
            &self.shared
        }
    }

    fn make_chain(allocator: &SharedTracking, length: usize) -> SmallPtr<Link, SharedTracking> {
        let mut head = SmallPtr::new_in(allocator.clone());
        for value in (0..length).rev() {
            head = SmallPtr::construct(allocator.clone(), Link::new(value, head));
        }
        head
    }

    /// Payloads without an accessor go through the plain storage path.
    #[test]
    fn degenerates_for_flat_payloads() {
        let allocator = SharedTracking::new();
        let pointer = SmallPtr::construct(
            allocator.clone(),
            Flat {
                shared: Shared::new(),
            },
        );
        drop(pointer);
        allocator.check_done();
    }

    #[test]
    fn releases_whole_chain() {
        let allocator = SharedTracking::new();
        let head = make_chain(&allocator, 100);
        assert_eq!(allocator.live(), 100);

        drop(head);
        allocator.check_done();
    }

    /// The walk must stop at the first link someone else still owns.
    #[test]
    fn stops_at_shared_link() {
        let allocator = SharedTracking::new();
        let head = make_chain(&allocator, 10);

        let mut fifth = head.clone();
        for _ in 0..5 {
            let next = fifth.next.clone();
            fifth = next;
        }
        assert_eq!(fifth.value, 5);
        assert_eq!(fifth.use_count(), 2);

        drop(head);
        assert_eq!(allocator.live(), 5);
        assert!(fifth.unique());
        assert_eq!(fifth.value, 5);

        drop(fifth);
        allocator.check_done();
    }

    #[test]
    fn take_next_leaves_field_empty() {
        let allocator = SharedTracking::new();
        let tail = make_chain(&allocator, 1);
        let mut head = SmallPtr::construct(allocator.clone(), Link::new(9, tail));

        let taken: SmallPtr<Link, SharedTracking> =
            RecursiveNext::take_next(head.get_mut().unwrap()).unwrap();
        assert_eq!(taken.value, 0);
        assert!(head.next.is_empty());

        drop(taken);
        drop(head);
        allocator.check_done();
    }
}
