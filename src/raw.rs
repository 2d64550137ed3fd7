use std::cell::UnsafeCell;

/// The unchecked leaf every other primitive in this crate is built on.
///
/// `RawCell<T>` hands out a raw exclusive pointer to its interior through a
/// shared handle and performs no bookkeeping whatsoever. It is the only place
/// in the crate allowed to create aliasing mutable access; each consumer
/// (`CopyCell`, `CheckedCell`) must prove on its own that no two live
/// exclusive accesses ever overlap. It is crate-private so application code
/// can never reach it directly.
pub(crate) struct RawCell<T> {
    value: UnsafeCell<T>,
}

impl<T> RawCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Returns an unchecked exclusive pointer to the interior, valid for as
    /// long as the cell is alive.
    ///
    /// Calling this is safe; dereferencing the result is not. The caller must
    /// guarantee that no other access to the interior is live while the
    /// pointer is used, shared or exclusive.
    pub(crate) fn raw_access(&self) -> *mut T {
        self.value.get()
    }

    /// Consumes the cell. Ownership of `self` structurally rules out any
    /// outstanding pointer from `raw_access` being used afterwards.
    pub(crate) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
