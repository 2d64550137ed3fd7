mod atomic;
mod cell;
mod checked;
mod guarded;
mod raw;
mod shared;

/*
# CopyCell

## Copy-by-Value Interior Mutability:
Mutation through a shared handle by replacing or copying the entire value
(get, set, replace, swap); no reference to the interior is ever given out.
!Sync, so confined to one thread; that confinement is the whole safety
argument.

# CheckedCell

## Interior Mutability via Runtime Borrow Checking:
Shared or exclusive views through a shared handle, with the borrow rules
enforced at runtime by a {Unshared, Shared(n), Exclusive} state machine.
`try_` variants report conflicts as values; borrow/borrow_mut panic.

# SharedOwner / WeakRef

## Multiple Ownership:
Single-threaded reference counting. Cloning bumps the strong count; the value
is dropped with the last strong handle; WeakRef observes liveness without
extending it. Mutation of the pointee composes with CheckedCell.

# AtomicSharedOwner / AtomicWeakRef

## Thread-Safe Multiple Ownership:
Same contract with atomic counters and acquire/release ordering on the final
decrement, so handles can be cloned and dropped from many threads.

# GuardedLock

## Blocking Mutual Exclusion with Poisoning:
lock() suspends until the lock is free and yields a scoped exclusive guard;
a holder that panics poisons the lock, and later acquirers must opt in to the
possibly inconsistent value. AtomicSharedOwner<GuardedLock<T>> is the
idiomatic cross-thread shared-mutable-state composition.
*/

pub use atomic::{AtomicSharedOwner, AtomicWeakRef};
pub use cell::CopyCell;
pub use checked::{BorrowConflict, CheckedCell, ExclusiveView, SharedView};
pub use guarded::{ExclusiveGuard, GuardedLock, Poisoned, TryLockFailure};
pub use shared::{SharedOwner, WeakRef};
