use crate::raw::RawCell;

/// `CopyCell<T>` implements interior mutability by moving values in and out of
/// the cell. A reference to the inner value can never be obtained: reads hand
/// back independent copies and writes replace the value wholesale.
///
/// The cell is not `Sync` (implied by its `UnsafeCell` interior), so it cannot
/// be shared across threads. That restriction is exactly what makes mutation
/// through `&self` sound here: within a single thread, each `set`/`get`/`swap`
/// call runs to completion before the next one can start, and no reference to
/// the interior ever escapes.
///
/// ```compile_fail
/// use owncell::CopyCell;
/// use std::sync::Arc;
///
/// let cell = Arc::new(CopyCell::new(0));
/// let cell2 = Arc::clone(&cell);
/// std::thread::spawn(move || cell2.set(1));
/// ```
pub struct CopyCell<T> {
    raw: RawCell<T>,
}

impl<T> CopyCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            raw: RawCell::new(value),
        }
    }

    /// Replaces the interior value. The old value is dropped after the write
    /// has completed, so a destructor that touches this cell observes the new
    /// value rather than a half-written one.
    pub fn set(&self, value: T) {
        let old = self.replace(value);
        drop(old);
    }

    /// Returns a copy of the interior value.
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        // SAFETY: !Sync means only this thread can touch the cell, and no
        // reference to the interior is ever given out, so nothing else is
        // mid-mutation while we copy.
        unsafe { *self.raw.raw_access() }
    }

    /// Swaps in `value` and returns the previous interior value by move.
    pub fn replace(&self, value: T) -> T {
        // SAFETY: same single-threaded, no-escaping-references argument as
        // `get`; the exclusive access lasts only for the duration of the
        // replace itself.
        unsafe { std::mem::replace(&mut *self.raw.raw_access(), value) }
    }

    /// Takes the interior value, leaving `T::default()` in its place.
    pub fn take(&self) -> T
    where
        T: Default,
    {
        self.replace(T::default())
    }

    /// Exchanges the contents of two cells.
    ///
    /// A self-swap is a no-op: without the pointer-identity guard it would
    /// request two exclusive accesses to the same interior at once.
    pub fn swap(&self, other: &CopyCell<T>) {
        if std::ptr::eq(self, other) {
            return;
        }
        // SAFETY: the cells are distinct (checked above) and confined to this
        // thread, so the two exclusive accesses never alias.
        unsafe { std::ptr::swap(self.raw.raw_access(), other.raw.raw_access()) };
    }

    /// Consumes the cell and returns the final value. Taking `self` by value
    /// structurally guarantees no shared handle is outstanding.
    pub fn into_inner(self) -> T {
        self.raw.into_inner()
    }
}

impl<T: Default> Default for CopyCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for CopyCell<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
