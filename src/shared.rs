use crate::cell::CopyCell;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

/// The heap block all handles to one value point at.
///
/// `value` lives inside `ManuallyDrop` because it is dropped in place the
/// moment the last strong handle goes away, while the block itself has to
/// outlive it for as long as any `WeakRef` needs to observe the counts.
struct SharedInner<T> {
    value: ManuallyDrop<T>,
    strong: CopyCell<usize>,
    // All strong handles together hold one weak reference. When `weak` hits
    // zero the block is gone.
    weak: CopyCell<usize>,
}

/// Single-threaded reference-counted ownership of a heap value.
///
/// `SharedOwner<T>` provides shared ownership of a value of type `T` allocated
/// on the heap. Cloning produces a new handle to the same allocation and bumps
/// the strong count; when the last strong handle is dropped, the inner value
/// is dropped too. The counters are plain (unsynchronized) cells, so the
/// handles are neither `Send` nor `Sync`; sharing across threads is what
/// [`AtomicSharedOwner`](crate::AtomicSharedOwner) is for.
///
/// The owner by itself grants only shared access to the value. Mutation goes
/// through interior mutability inside `T`, typically a
/// [`CheckedCell`](crate::CheckedCell).
pub struct SharedOwner<T> {
    inner: NonNull<SharedInner<T>>,
    _marker: PhantomData<SharedInner<T>>,
}

impl<T> SharedOwner<T> {
    pub fn new(value: T) -> Self {
        let inner = Box::new(SharedInner {
            value: ManuallyDrop::new(value),
            strong: CopyCell::new(1),
            weak: CopyCell::new(1),
        });

        Self {
            inner: NonNull::from(Box::leak(inner)),
            _marker: PhantomData,
        }
    }

    fn inner(&self) -> &SharedInner<T> {
        // SAFETY: a live strong handle keeps the block allocated.
        unsafe { self.inner.as_ref() }
    }

    /// Creates a non-owning handle to the same allocation. The value may be
    /// dropped while `WeakRef`s still exist; they observe that through
    /// [`WeakRef::upgrade`].
    pub fn downgrade(&self) -> WeakRef<T> {
        let inner = self.inner();
        inner.weak.set(inner.weak.get() + 1);
        WeakRef {
            inner: self.inner,
            _marker: PhantomData,
        }
    }

    /// Exclusive access to the value, granted only when this is the sole
    /// handle of any kind. With other strong handles it would alias their
    /// shared access; with weak handles an upgrade could appear later.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let unique = self.inner().strong.get() == 1 && self.inner().weak.get() == 1;
        if unique {
            // SAFETY: uniqueness checked above, and &mut self pins this as
            // the only path to the block for the borrow's duration.
            Some(unsafe { &mut *(*self.inner.as_ptr()).value })
        } else {
            None
        }
    }

    /// Number of strong handles to this allocation.
    pub fn strong_count(&self) -> usize {
        self.inner().strong.get()
    }

    /// Number of weak handles to this allocation.
    pub fn weak_count(&self) -> usize {
        self.inner().weak.get() - 1
    }
}

impl<T> Clone for SharedOwner<T> {
    fn clone(&self) -> Self {
        let inner = self.inner();
        let strong = inner.strong.get();
        // A count this high can only mean handles are being leaked in a loop;
        // wrapping it would alias a freed value, so die instead.
        if strong == usize::MAX {
            std::process::abort();
        }
        inner.strong.set(strong + 1);
        Self {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<T> std::ops::Deref for SharedOwner<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner().value
    }
}

impl<T> Drop for SharedOwner<T> {
    fn drop(&mut self) {
        let strong = self.inner().strong.get() - 1;
        self.inner().strong.set(strong);

        if strong == 0 {
            // SAFETY: last strong handle; nobody can reach the value again
            // (upgrade sees strong == 0 from here on).
            unsafe { ManuallyDrop::drop(&mut (*self.inner.as_ptr()).value) };

            // Release the weak reference held collectively by the strong
            // handles. Re-read the count afterwards: dropping the value may
            // itself have dropped WeakRefs to this block.
            let weak = self.inner().weak.get() - 1;
            self.inner().weak.set(weak);
            if weak == 0 {
                // SAFETY: no handle of any kind is left; the value was
                // already dropped above and ManuallyDrop keeps the Box drop
                // from running it again.
                unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
            }
        }
    }
}

/// A non-owning handle to a [`SharedOwner`] allocation.
///
/// A `WeakRef` does not keep the value alive; it keeps only the block of
/// counters alive so that [`upgrade`](Self::upgrade) can tell whether the
/// value still exists. This is the tool for back-edges and parent pointers in
/// cyclic topologies: a cycle of strong handles never reaches a strong count
/// of zero and leaks.
pub struct WeakRef<T> {
    inner: NonNull<SharedInner<T>>,
    _marker: PhantomData<SharedInner<T>>,
}

impl<T> WeakRef<T> {
    fn inner(&self) -> &SharedInner<T> {
        // SAFETY: a live weak handle keeps the block allocated (not the
        // value, but we only touch the counters here).
        unsafe { self.inner.as_ref() }
    }

    /// Attempts to promote this into a strong handle. Fails once the last
    /// strong handle has dropped the value.
    pub fn upgrade(&self) -> Option<SharedOwner<T>> {
        let inner = self.inner();
        let strong = inner.strong.get();
        if strong == 0 {
            return None;
        }
        // An upgrade is a clone in disguise; same exhaustion policy.
        if strong == usize::MAX {
            std::process::abort();
        }
        inner.strong.set(strong + 1);
        Some(SharedOwner {
            inner: self.inner,
            _marker: PhantomData,
        })
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        let inner = self.inner();
        inner.weak.set(inner.weak.get() + 1);
        Self {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WeakRef<T> {
    fn drop(&mut self) {
        let inner = self.inner();
        let weak = inner.weak.get() - 1;
        inner.weak.set(weak);
        if weak == 0 {
            // SAFETY: weak == 0 implies strong == 0 (strong handles hold a
            // weak reference), so the value is already dropped and this is
            // the last handle to the block.
            unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_clone_then_drop_restores_count() {
        let a = SharedOwner::new("hello".to_string());
        assert_eq!(a.strong_count(), 1);
        let b = a.clone();
        assert_eq!(a.strong_count(), 2);
        assert_eq!(*b, "hello");
        drop(b);
        assert_eq!(*a, "hello");
        assert_eq!(a.strong_count(), 1);
    }

    #[test]
    fn test_upgrade_after_last_strong_drop() {
        let owner = SharedOwner::new(42);
        let weak = owner.downgrade();
        assert_eq!(owner.weak_count(), 1);

        let upgraded = weak.upgrade().unwrap();
        assert_eq!(*upgraded, 42);
        drop(upgraded);

        drop(owner);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_value_dropped_exactly_once() {
        struct Counter<'a>(&'a Cell<usize>);
        impl Drop for Counter<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Cell::new(0);
        {
            let a = SharedOwner::new(Counter(&drops));
            let b = a.clone();
            let weak = a.downgrade();
            drop(a);
            assert_eq!(drops.get(), 0);
            drop(b);
            assert_eq!(drops.get(), 1);
            assert!(weak.upgrade().is_none());
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_get_mut_requires_uniqueness() {
        let mut owner = SharedOwner::new(1);
        *owner.get_mut().unwrap() = 2;

        let other = owner.clone();
        assert!(owner.get_mut().is_none());
        drop(other);

        let weak = owner.downgrade();
        assert!(owner.get_mut().is_none());
        drop(weak);

        assert_eq!(*owner.get_mut().unwrap(), 2);
    }

    #[test]
    fn test_weak_clone_keeps_block_alive() {
        let owner = SharedOwner::new(7);
        let w1 = owner.downgrade();
        let w2 = w1.clone();
        assert_eq!(owner.weak_count(), 2);
        drop(owner);
        assert!(w1.upgrade().is_none());
        assert!(w2.upgrade().is_none());
    }
}
