//! The non-owning handle.

use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};

use crate::internals::{self, ControlBlock, Count, Raw};
use crate::SharedPtr;

/// A reference-counted pointer that observes a [`SharedPtr`]'s pointee
/// without keeping it alive.
///
/// A `WeakPtr` keeps the control block allocated, so [`WeakPtr::expired`]
/// stays answerable after the pointee is destroyed. [`WeakPtr::lock`] is the
/// only way back to the pointee.
///
/// See the [module](crate) documentation for more information.
pub struct WeakPtr<T: ?Sized> {
    raw: Option<Raw<T>>,
}

impl<T: ?Sized> Drop for WeakPtr<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: the `WeakPtr` cannot be used anymore after this point.
            unsafe { internals::release_weak(raw.block) };
        }
    }
}

impl<T: ?Sized> Clone for WeakPtr<T> {
    /// Copies the reference and increases the weak count.
    ///
    /// # Panics
    ///
    /// Panics if the number of `WeakPtr`s overflows `usize::MAX`.
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            // SAFETY: `self` keeps the block allocated.
            unsafe { raw.header() }.increase_weak();
        }
        Self { raw: self.raw }
    }
}

impl<T: ?Sized> Default for WeakPtr<T> {
    /// Creates a `WeakPtr` that refers to nothing.
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for WeakPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => f.debug_tuple("WeakPtr").field(&raw.block).finish(),
            None => f.write_str("WeakPtr(<empty>)"),
        }
    }
}

impl<T: ?Sized> From<&SharedPtr<T>> for WeakPtr<T> {
    #[inline]
    fn from(shared: &SharedPtr<T>) -> Self {
        SharedPtr::downgrade(shared)
    }
}

impl<T: ?Sized> PartialEq for WeakPtr<T> {
    /// Returns true if both `WeakPtr`s share a control block.
    ///
    /// This compares the block addresses, not the pointees, which makes it
    /// very fast and works after the pointee is destroyed.
    fn eq(&self, other: &Self) -> bool {
        self.block() == other.block()
    }
}

impl<T: ?Sized> Eq for WeakPtr<T> {}

impl<T: ?Sized> WeakPtr<T> {
    /// Creates a `WeakPtr` that refers to nothing. It is always expired.
    #[inline]
    pub const fn new() -> Self {
        Self { raw: None }
    }

    /// Wraps a handle around a block whose weak count it now owns.
    #[inline]
    pub(crate) fn from_inner(raw: Raw<T>) -> Self {
        Self { raw: Some(raw) }
    }

    #[inline]
    fn header(&self) -> Option<&ControlBlock> {
        // SAFETY: a `WeakPtr` keeps the block allocated as long as it lives,
        // and the reference never covers the (possibly destroyed) pointee.
        self.raw.map(|raw| unsafe { raw.header() })
    }

    /// Returns true if the pointee has been destroyed, or if this `WeakPtr`
    /// refers to nothing.
    #[inline]
    pub fn expired(&self) -> bool {
        !self.header().is_some_and(ControlBlock::is_alive)
    }

    /// Creates a [`SharedPtr`] to the pointee, or an empty one if the
    /// `WeakPtr` is expired.
    ///
    /// # Panics
    ///
    /// Panics if the number of `SharedPtr`s overflows `usize::MAX`.
    pub fn lock(&self) -> SharedPtr<T> {
        match self.raw {
            Some(raw) if !self.expired() => {
                // SAFETY: `self` keeps the block allocated.
                unsafe { raw.header() }.increase_shared();
                SharedPtr::from_inner(raw)
            }
            _ => SharedPtr::empty(),
        }
    }

    /// Returns the number of [`SharedPtr`]s to the pointee. This is 0 once the
    /// `WeakPtr` is expired.
    pub fn use_count(&self) -> Count {
        self.header().map_or(0, ControlBlock::shared_count)
    }

    /// Returns the number of `WeakPtr`s sharing the control block, this one
    /// included, or 0 if this `WeakPtr` refers to nothing.
    pub fn weak_count(&self) -> Count {
        self.header().map_or(0, ControlBlock::weak_count)
    }

    /// Lets go of the control block. The `WeakPtr` refers to nothing
    /// afterwards.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Moves the reference out into a new `WeakPtr`, leaving this one empty.
    /// The counts do not change.
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Returns true if this `WeakPtr` and the supplied [`SharedPtr`] share a
    /// control block.
    pub fn is(&self, owner: &SharedPtr<T>) -> bool {
        self.raw.is_some() && self.block() == owner.block()
    }

    /// Returns true if both handles view the same address, expired or not.
    /// Two empty `WeakPtr`s are equal.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.raw, other.raw) {
            (Some(a), Some(b)) => ptr::addr_eq(a.ptr.as_ptr(), b.ptr.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }

    /// Changes the view pointer while keeping the control block. Used by
    /// [`coerce_weak!`](crate::coerce_weak).
    ///
    /// # Safety
    ///
    /// Ensure `f` returns a pointer to the pointee or to a part of it. `f`
    /// must not read through its argument.
    #[doc(hidden)]
    pub unsafe fn map_raw<U, F>(this: Self, f: F) -> WeakPtr<U>
    where
        U: ?Sized,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        let Some(raw) = this.raw else {
            return WeakPtr::new();
        };
        let ptr = f(raw.ptr);
        // The weak count moves to the new handle.
        mem::forget(this);
        WeakPtr::from_inner(Raw { ptr, block: raw.block })
    }

    #[inline]
    fn block(&self) -> Option<NonNull<ControlBlock>> {
        self.raw.map(|raw| raw.block)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////
