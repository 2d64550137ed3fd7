use crate::cell::CopyCell;
use crate::raw::RawCell;

/// The dynamic borrow state of a [`CheckedCell`].
///
/// `Shared(n)` means `n` live [`SharedView`]s and no exclusive view;
/// `Exclusive` means exactly one live [`ExclusiveView`] and no shared ones.
/// All transitions go through view acquisition and release.
#[derive(Debug, Copy, Clone)]
enum BorrowState {
    Unshared,
    Shared(usize),
    Exclusive,
}

/// A request for a view that is incompatible with the views currently
/// outstanding on the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BorrowConflict {
    /// An exclusive view is live, so no further view can be handed out.
    #[error("already borrowed exclusively")]
    AlreadyExclusive,
    /// At least one shared view is live, so an exclusive view is refused.
    #[error("already borrowed")]
    AlreadyShared,
}

/// A mutable memory location with dynamically checked borrow rules.
///
/// Where native references are checked entirely at compile time,
/// `CheckedCell<T>` tracks borrows at runtime: one can claim temporary shared
/// or exclusive access to the inner value through `&self`, and conflicting
/// claims are reported at the call site instead of rejected by the compiler.
/// That trade is what makes aliasing patterns the static checker cannot see
/// through (graphs, back-edges) expressible.
///
/// The borrow counter itself is unsynchronized, so the cell is not `Sync` and
/// must stay confined to one thread.
pub struct CheckedCell<T> {
    raw: RawCell<T>,
    state: CopyCell<BorrowState>,
}

impl<T> CheckedCell<T> {
    pub fn new(value: T) -> CheckedCell<T> {
        Self {
            raw: RawCell::new(value),
            state: CopyCell::new(BorrowState::Unshared),
        }
    }

    /// Attempts to acquire a shared view, failing if an exclusive view is
    /// live.
    pub fn try_borrow(&self) -> Result<SharedView<'_, T>, BorrowConflict> {
        match self.state.get() {
            BorrowState::Exclusive => Err(BorrowConflict::AlreadyExclusive),
            BorrowState::Shared(views) => {
                // SAFETY: no exclusive view is live, adding a reader is fine.
                self.state.set(BorrowState::Shared(views + 1));
                Ok(SharedView { cell: self })
            }
            BorrowState::Unshared => {
                // SAFETY: no view of any kind is live.
                self.state.set(BorrowState::Shared(1));
                Ok(SharedView { cell: self })
            }
        }
    }

    /// Attempts to acquire the exclusive view, failing if any view is live.
    pub fn try_borrow_mut(&self) -> Result<ExclusiveView<'_, T>, BorrowConflict> {
        match self.state.get() {
            BorrowState::Exclusive => Err(BorrowConflict::AlreadyExclusive),
            BorrowState::Shared(_) => Err(BorrowConflict::AlreadyShared),
            BorrowState::Unshared => {
                // SAFETY: state Unshared means no other view exists, so the
                // exclusive view cannot alias anything.
                self.state.set(BorrowState::Exclusive);
                Ok(ExclusiveView { cell: self })
            }
        }
    }

    /// Like [`try_borrow`](Self::try_borrow), but a conflict is treated as a
    /// bug in the caller and aborts the borrow with a panic.
    pub fn borrow(&self) -> SharedView<'_, T> {
        match self.try_borrow() {
            Ok(view) => view,
            Err(conflict) => panic!("{conflict}"),
        }
    }

    /// Like [`try_borrow_mut`](Self::try_borrow_mut), but panics on conflict.
    pub fn borrow_mut(&self) -> ExclusiveView<'_, T> {
        match self.try_borrow_mut() {
            Ok(view) => view,
            Err(conflict) => panic!("{conflict}"),
        }
    }

    /// Consumes the cell and returns the inner value. Owning `self` means no
    /// view can be outstanding, so no runtime check is needed.
    pub fn into_inner(self) -> T {
        self.raw.into_inner()
    }
}

/// A shared view into a [`CheckedCell`]; releases its slot in the borrow
/// count on drop.
pub struct SharedView<'cell, T> {
    cell: &'cell CheckedCell<T>,
}

impl<T> Drop for SharedView<'_, T> {
    fn drop(&mut self) {
        match self.cell.state.get() {
            BorrowState::Exclusive | BorrowState::Unshared => unreachable!(),
            BorrowState::Shared(1) => self.cell.state.set(BorrowState::Unshared),
            BorrowState::Shared(views) => self.cell.state.set(BorrowState::Shared(views - 1)),
        }
    }
}

impl<T> std::ops::Deref for SharedView<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY: a live SharedView keeps the state at Shared(n), so no
        // exclusive access can exist while this reference is usable.
        unsafe { &*self.cell.raw.raw_access() }
    }
}

/// The exclusive view into a [`CheckedCell`]; returns the state to `Unshared`
/// on drop.
pub struct ExclusiveView<'cell, T> {
    cell: &'cell CheckedCell<T>,
}

impl<T> Drop for ExclusiveView<'_, T> {
    fn drop(&mut self) {
        self.cell.state.set(BorrowState::Unshared);
    }
}

impl<T> std::ops::Deref for ExclusiveView<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY: a live ExclusiveView keeps the state at Exclusive, so this
        // view is the only access to the interior.
        unsafe { &*self.cell.raw.raw_access() }
    }
}

impl<T> std::ops::DerefMut for ExclusiveView<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as above, and &mut self keeps this the only use of the view.
        unsafe { &mut *self.cell.raw.raw_access() }
    }
}
