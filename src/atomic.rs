use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Past this the strong count can only mean a leak loop; `isize::MAX` leaves
/// headroom so a race of increments cannot wrap before the abort fires.
const MAX_OWNERS: usize = isize::MAX as usize;

struct AtomicInner<T> {
    value: ManuallyDrop<T>,
    strong: AtomicUsize,
    // All strong handles together hold one weak reference.
    weak: AtomicUsize,
}

/// Thread-safe reference-counted ownership of a heap value.
///
/// The contract is identical to [`SharedOwner`](crate::SharedOwner); only the
/// counter synchronization differs. Every increment and decrement is a single
/// indivisible atomic operation, so handles can be cloned and dropped from
/// any number of threads without corrupting the counts.
///
/// Orderings: increments are `Relaxed` (a thread incrementing already holds a
/// handle, so the block is known alive), while the decrement that may free
/// the value pairs `Release` with an `Acquire` fence. That pairing makes all
/// writes done through other handles visible to the thread that runs the
/// destructor.
///
/// The owner grants only shared access; cross-thread mutation of the pointee
/// composes this with a [`GuardedLock`](crate::GuardedLock) inside `T`.
pub struct AtomicSharedOwner<T> {
    ptr: NonNull<AtomicInner<T>>,
    _marker: PhantomData<AtomicInner<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicSharedOwner<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSharedOwner<T> {}

impl<T> AtomicSharedOwner<T> {
    pub fn new(value: T) -> AtomicSharedOwner<T> {
        let inner = Box::new(AtomicInner {
            value: ManuallyDrop::new(value),
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
        });
        Self {
            ptr: NonNull::from(Box::leak(inner)),
            _marker: PhantomData,
        }
    }

    fn inner(&self) -> &AtomicInner<T> {
        // SAFETY: a live strong handle keeps the block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Creates a non-owning handle to the same allocation.
    pub fn downgrade(&self) -> AtomicWeakRef<T> {
        let mut weak = self.inner().weak.load(Ordering::Relaxed);
        loop {
            // `get_mut` parks the count at usize::MAX while it probes for
            // uniqueness; wait it out rather than increment the sentinel.
            if weak == usize::MAX {
                std::hint::spin_loop();
                weak = self.inner().weak.load(Ordering::Relaxed);
                continue;
            }
            match self.inner().weak.compare_exchange_weak(
                weak,
                weak + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return AtomicWeakRef {
                        ptr: self.ptr,
                        _marker: PhantomData,
                    };
                }
                Err(actual) => weak = actual,
            }
        }
    }

    /// Exclusive access to the value, granted only when this is the sole
    /// handle of any kind.
    ///
    /// Two separate loads would not do here: a weak handle on another thread
    /// could upgrade between them and be missed. So the weak count is first
    /// parked at a sentinel; that only succeeds when no weak handle exists,
    /// which rules out any concurrent upgrade while the strong count is
    /// probed. `&mut self` keeps this handle from minting new ones meanwhile.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let inner = self.inner();
        if inner
            .weak
            .compare_exchange(1, usize::MAX, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let unique = inner.strong.load(Ordering::Acquire) == 1;
        inner.weak.store(1, Ordering::Release);
        if unique {
            // SAFETY: no weak handle existed while the sentinel was held and
            // the strong count was 1, so this is the only handle of any kind.
            Some(unsafe { &mut *(*self.ptr.as_ptr()).value })
        } else {
            None
        }
    }

    pub fn strong_count(&self) -> usize {
        self.inner().strong.load(Ordering::Acquire)
    }

    pub fn weak_count(&self) -> usize {
        match self.inner().weak.load(Ordering::Acquire) {
            // Another handle is probing for uniqueness; no weak handle exists
            // while it holds the sentinel.
            usize::MAX => 0,
            weak => weak - 1,
        }
    }
}

impl<T> Clone for AtomicSharedOwner<T> {
    fn clone(&self) -> Self {
        let old = self.inner().strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_OWNERS {
            std::process::abort();
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> std::ops::Deref for AtomicSharedOwner<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner().value
    }
}

impl<T> Drop for AtomicSharedOwner<T> {
    fn drop(&mut self) {
        if self.inner().strong.fetch_sub(1, Ordering::Release) == 1 {
            // Pairs with the Release decrements of every other strong handle:
            // their accesses to the value happen-before this drop.
            fence(Ordering::Acquire);
            // SAFETY: last strong handle; upgrade refuses strong == 0, so the
            // value is unreachable from here on.
            unsafe { ManuallyDrop::drop(&mut (*self.ptr.as_ptr()).value) };

            // Release the weak reference held by the strong handles.
            if self.inner().weak.fetch_sub(1, Ordering::Release) == 1 {
                fence(Ordering::Acquire);
                // SAFETY: no handle left; ManuallyDrop keeps the Box drop
                // from running the value destructor a second time.
                unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
            }
        }
    }
}

/// A non-owning handle to an [`AtomicSharedOwner`] allocation; the thread-safe
/// sibling of [`WeakRef`](crate::WeakRef).
pub struct AtomicWeakRef<T> {
    ptr: NonNull<AtomicInner<T>>,
    _marker: PhantomData<AtomicInner<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicWeakRef<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWeakRef<T> {}

impl<T> AtomicWeakRef<T> {
    fn inner(&self) -> &AtomicInner<T> {
        // SAFETY: a live weak handle keeps the block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Attempts to promote this into a strong handle.
    ///
    /// The increment must not race with the final strong drop, so it goes
    /// through a compare-and-swap loop that refuses to resurrect a count that
    /// has already reached zero.
    pub fn upgrade(&self) -> Option<AtomicSharedOwner<T>> {
        self.inner()
            .strong
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |strong| {
                if strong == 0 {
                    None
                } else if strong > MAX_OWNERS {
                    // An upgrade is a clone in disguise; same exhaustion
                    // policy as `clone`.
                    std::process::abort();
                } else {
                    Some(strong + 1)
                }
            })
            .ok()
            .map(|_| AtomicSharedOwner {
                ptr: self.ptr,
                _marker: PhantomData,
            })
    }
}

impl<T> Clone for AtomicWeakRef<T> {
    fn clone(&self) -> Self {
        self.inner().weak.fetch_add(1, Ordering::Relaxed);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for AtomicWeakRef<T> {
    fn drop(&mut self) {
        if self.inner().weak.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // SAFETY: weak == 0 implies strong == 0 (the strong handles hold
            // a weak reference), so the value is already dropped and this was
            // the last handle to the block.
            unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicSharedOwner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_concurrent_clone_read_drop() {
        let owner = AtomicSharedOwner::new(5i64);
        let mut handles = vec![];

        for _ in 0..10 {
            let current = owner.clone();
            handles.push(thread::spawn(move || {
                let again = current.clone();
                assert_eq!(*again, 5);
                assert_eq!(*current, 5);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(owner.strong_count(), 1);
        assert_eq!(*owner, 5);
    }

    #[test]
    fn test_drop_exactly_once() {
        struct Counter<'a>(&'a AtomicUsize);
        impl Drop for Counter<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = AtomicUsize::new(0);
        {
            let a = AtomicSharedOwner::new(Counter(&drops));
            let b = a.clone();
            let c = b.clone();
            drop(a);
            drop(b);
            drop(c);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upgrade_while_strong_exists() {
        let owner = AtomicSharedOwner::new(vec![1, 2, 3]);
        let weak = owner.downgrade();
        assert_eq!(owner.weak_count(), 1);

        let upgraded = weak.upgrade().unwrap();
        assert_eq!(upgraded[1], 2);
        assert_eq!(owner.strong_count(), 2);
    }

    #[test]
    fn test_upgrade_fails_after_last_strong_drop() {
        let owner = AtomicSharedOwner::new(99);
        let weak = owner.downgrade();
        let weak2 = weak.clone();
        drop(owner);
        assert!(weak.upgrade().is_none());
        assert!(weak2.upgrade().is_none());
    }

    #[test]
    fn test_weak_upgrade_races_with_final_drop() {
        // Either the upgrade wins and reads the value, or it loses and gets
        // None. It must never observe a dropped value.
        for _ in 0..100 {
            let owner = AtomicSharedOwner::new(123u64);
            let weak = owner.downgrade();

            let racer = thread::spawn(move || match weak.upgrade() {
                Some(strong) => assert_eq!(*strong, 123),
                None => {}
            });
            drop(owner);
            racer.join().unwrap();
        }
    }

    #[test]
    fn test_get_mut_refused_while_weak_can_upgrade() {
        let mut owner = AtomicSharedOwner::new(0u64);
        let weak = owner.downgrade();

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..1000 {
                    if let Some(strong) = weak.upgrade() {
                        assert_eq!(*strong, 0);
                    }
                }
            });
            // The weak handle stays alive for the whole scope, so exclusive
            // access must be refused no matter how the upgrades on the other
            // thread interleave with the uniqueness probe.
            for _ in 0..1000 {
                assert!(owner.get_mut().is_none());
            }
        });

        drop(weak);
        assert!(owner.get_mut().is_some());
    }

    #[test]
    fn test_concurrent_downgrades_during_get_mut() {
        let mut owner = AtomicSharedOwner::new(1u32);
        let other = owner.clone();

        thread::scope(|s| {
            s.spawn(move || {
                for _ in 0..1000 {
                    drop(other.downgrade());
                }
            });
            // A second strong handle exists throughout, so never unique; the
            // downgrades on the other thread must wait out the probe's
            // sentinel rather than land an increment on it.
            for _ in 0..1000 {
                assert!(owner.get_mut().is_none());
            }
        });

        assert!(owner.get_mut().is_some());
        assert_eq!(owner.weak_count(), 0);
    }

    #[test]
    fn test_get_mut_requires_uniqueness() {
        let mut owner = AtomicSharedOwner::new(1);
        *owner.get_mut().unwrap() = 2;

        let other = owner.clone();
        assert!(owner.get_mut().is_none());
        drop(other);

        let weak = owner.downgrade();
        assert!(owner.get_mut().is_none());
        drop(weak);

        assert_eq!(*owner.get_mut().unwrap(), 2);
    }
}
