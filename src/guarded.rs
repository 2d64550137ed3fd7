use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(target_os = "linux")]
use linux_futex::{Futex, Private};
#[cfg(not(target_os = "linux"))]
use std::sync::atomic::AtomicU32;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A blocking mutual exclusion primitive with panic poisoning.
///
/// `lock` suspends the calling thread until the lock is free and hands out a
/// scoped [`ExclusiveGuard`]; releasing the guard unlocks. If a holder panics
/// while the guard is live, the lock becomes *poisoned*: later acquisitions
/// still succeed, but they report the poisoning so the caller must decide
/// explicitly whether to trust the possibly half-updated value. Refusing
/// access forever would make the data permanently unusable, so poisoning is
/// advisory, and [`clear_poison`](Self::clear_poison) exists as a last-resort
/// reset.
///
/// Unlock/lock pairs order memory: whatever the previous holder wrote is
/// visible to the next thread that acquires the lock.
pub struct GuardedLock<T> {
    value: UnsafeCell<T>,
    #[cfg(target_os = "linux")]
    state: Futex<Private>,
    #[cfg(not(target_os = "linux"))]
    state: AtomicU32,
    // Orthogonal to the lock state and sticky until explicitly cleared.
    poisoned: AtomicBool,
}

unsafe impl<T: Send> Sync for GuardedLock<T> {}

impl<T> GuardedLock<T> {
    pub fn new(value: T) -> GuardedLock<T> {
        Self {
            value: UnsafeCell::new(value),
            #[cfg(target_os = "linux")]
            state: Futex::new(UNLOCKED),
            #[cfg(not(target_os = "linux"))]
            state: AtomicU32::new(UNLOCKED),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, suspending the calling thread until it is free.
    ///
    /// On a poisoned lock the acquisition still happens, but the guard comes
    /// back wrapped in `Err` so recovery is a deliberate act:
    /// `lock.lock().unwrap_or_else(Poisoned::into_inner)`.
    pub fn lock(&self) -> Result<ExclusiveGuard<'_, T>, Poisoned<ExclusiveGuard<'_, T>>> {
        while self
            .raw_state()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.wait_until_unlocked();
        }
        self.guard()
    }

    /// Non-blocking acquisition: fails immediately with
    /// [`TryLockFailure::WouldBlock`] instead of suspending.
    pub fn try_lock(&self) -> Result<ExclusiveGuard<'_, T>, TryLockFailure<'_, T>> {
        if self
            .raw_state()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.guard().map_err(TryLockFailure::Poisoned)
        } else {
            Err(TryLockFailure::WouldBlock)
        }
    }

    // Called with the lock word already owned by this thread.
    fn guard(&self) -> Result<ExclusiveGuard<'_, T>, Poisoned<ExclusiveGuard<'_, T>>> {
        let guard = ExclusiveGuard { lock: self };
        if self.poisoned.load(Ordering::Relaxed) {
            Err(Poisoned::new(guard))
        } else {
            Ok(guard)
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    /// Resets the poison flag without validating the protected value.
    ///
    /// This does not make the value consistent; it only stops subsequent
    /// acquisitions from reporting poisoning. Reach for it only after
    /// independently verifying (or deciding to accept) the state of the data.
    pub fn clear_poison(&self) {
        self.poisoned.store(false, Ordering::Relaxed);
    }

    /// Exclusive access without locking; `&mut self` already proves no other
    /// thread holds a handle.
    pub fn get_mut(&mut self) -> Result<&mut T, Poisoned<&mut T>> {
        let poisoned = self.is_poisoned();
        let value = self.value.get_mut();
        if poisoned {
            Err(Poisoned::new(value))
        } else {
            Ok(value)
        }
    }

    /// Consumes the lock and returns the protected value, reporting poisoning
    /// the same way [`lock`](Self::lock) does.
    pub fn into_inner(self) -> Result<T, Poisoned<T>> {
        let poisoned = self.is_poisoned();
        let value = self.value.into_inner();
        if poisoned {
            Err(Poisoned::new(value))
        } else {
            Ok(value)
        }
    }
}

#[cfg(target_os = "linux")]
impl<T> GuardedLock<T> {
    fn raw_state(&self) -> &std::sync::atomic::AtomicU32 {
        &self.state.value
    }

    fn wait_until_unlocked(&self) {
        // Returns on wake or when the word no longer reads LOCKED; the CAS
        // loop in `lock` re-checks either way.
        let _ = self.state.wait(LOCKED);
    }

    fn wake_one(&self) {
        self.state.wake(1);
    }
}

#[cfg(not(target_os = "linux"))]
impl<T> GuardedLock<T> {
    fn raw_state(&self) -> &AtomicU32 {
        &self.state
    }

    fn wait_until_unlocked(&self) {
        // No futex off Linux; yield instead of burning the timeslice.
        std::thread::yield_now();
    }

    fn wake_one(&self) {}
}

/// Scoped exclusive access to a [`GuardedLock`]'s value. Unlocks on drop, and
/// poisons the lock if the drop happens while the holding thread is
/// unwinding from a panic.
pub struct ExclusiveGuard<'lock, T> {
    lock: &'lock GuardedLock<T>,
}

unsafe impl<T: Sync> Sync for ExclusiveGuard<'_, T> {}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock word, so this is
        // the only access to the value.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.poisoned.store(true, Ordering::Relaxed);
        }
        self.lock.raw_state().store(UNLOCKED, Ordering::Release);
        self.lock.wake_one();
    }
}

/// Carrier for a value whose lock was poisoned. Holding the inner guard (or
/// value) hostage here forces the caller to acknowledge the poisoning before
/// touching possibly inconsistent data.
pub struct Poisoned<G> {
    inner: G,
}

impl<G> Poisoned<G> {
    fn new(inner: G) -> Poisoned<G> {
        Poisoned { inner }
    }

    /// Accepts the risk and takes the guard or value anyway.
    pub fn into_inner(self) -> G {
        self.inner
    }

    pub fn get_ref(&self) -> &G {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut G {
        &mut self.inner
    }
}

impl<G> fmt::Debug for Poisoned<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poisoned").finish_non_exhaustive()
    }
}

impl<G> fmt::Display for Poisoned<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a holder panicked while the lock was held")
    }
}

impl<G> std::error::Error for Poisoned<G> {}

/// Why [`GuardedLock::try_lock`] did not hand out a clean guard.
pub enum TryLockFailure<'lock, T> {
    /// The lock is held by another thread; acquiring would have to block.
    WouldBlock,
    /// The lock was acquired but is poisoned; the guard rides inside.
    Poisoned(Poisoned<ExclusiveGuard<'lock, T>>),
}

impl<T> fmt::Debug for TryLockFailure<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryLockFailure::WouldBlock => f.write_str("WouldBlock"),
            TryLockFailure::Poisoned(_) => f.debug_tuple("Poisoned").finish(),
        }
    }
}

impl<T> fmt::Display for TryLockFailure<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryLockFailure::WouldBlock => write!(f, "lock is held, acquiring would block"),
            TryLockFailure::Poisoned(poisoned) => fmt::Display::fmt(poisoned, f),
        }
    }
}

impl<T> std::error::Error for TryLockFailure<'_, T> {}

#[cfg(test)]
mod tests {
    use super::{GuardedLock, Poisoned, TryLockFailure};
    use crate::atomic::AtomicSharedOwner;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_writes_visible_to_next_acquirer() {
        let lock = Arc::new(GuardedLock::new(0));
        let c_lock = Arc::clone(&lock);

        thread::spawn(move || {
            *c_lock.lock().unwrap() = 10;
        })
        .join()
        .expect("thread::spawn failed");
        assert_eq!(*lock.lock().unwrap(), 10);
    }

    #[test]
    fn test_contended_increments() {
        let lock = Arc::new(GuardedLock::new(0i64));
        let mut handles = vec![];

        for _ in 0..10 {
            let l = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = l.lock().unwrap();
                    *guard += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock().unwrap(), 10000);
        assert!(!lock.is_poisoned());
    }

    #[test]
    fn test_panic_while_holding_poisons() {
        let lock = Arc::new(GuardedLock::new(1));
        let c_lock = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let mut guard = c_lock.lock().unwrap();
            *guard = 2;
            panic!("holder dies");
        })
        .join();

        assert!(lock.is_poisoned());
        // The data stays reachable; the last in-place write survives.
        let guard = lock.lock().unwrap_or_else(Poisoned::into_inner);
        assert_eq!(*guard, 2);
    }

    #[test]
    fn test_clear_poison() {
        let lock = GuardedLock::new(0);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock().unwrap();
            panic!("boom");
        }));
        assert!(lock.is_poisoned());
        assert!(lock.lock().is_err());

        lock.clear_poison();
        assert!(!lock.is_poisoned());
        assert!(lock.lock().is_ok());
    }

    #[test]
    fn test_try_lock_would_block_while_held() {
        let lock = GuardedLock::new(5);
        let guard = lock.try_lock().unwrap();
        assert!(matches!(lock.try_lock(), Err(TryLockFailure::WouldBlock)));
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 5);
    }

    #[test]
    fn test_into_inner_recovers_after_poison() {
        let lock = GuardedLock::new(5);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = lock.lock().unwrap();
            *guard = 6;
            panic!("boom");
        }));
        assert!(lock.is_poisoned());
        assert_eq!(lock.into_inner().unwrap_err().into_inner(), 6);
    }

    #[test]
    fn test_get_mut_without_locking() {
        let mut lock = GuardedLock::new(7);
        *lock.get_mut().unwrap() = 8;
        assert_eq!(*lock.lock().unwrap(), 8);
    }

    #[test]
    fn test_shared_lock_across_owners() {
        // The idiomatic cross-thread shared-mutable-state composition.
        let shared = AtomicSharedOwner::new(GuardedLock::new(0i64));
        let mut handles = vec![];

        for _ in 0..8 {
            let owner = shared.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let mut guard = owner.lock().unwrap();
                    *guard += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*shared.lock().unwrap(), 4000);
        assert!(!shared.is_poisoned());
        assert_eq!(shared.strong_count(), 1);
    }
}
