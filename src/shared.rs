//! The owning handle.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::alloc::{handle_alloc_error, Layout};

use crate::alloc::{AllocError, Allocator, Global};
use crate::internals::{self, ControlBlock, Count, EmbeddedBlock, ExternalBlock, Raw};
use crate::WeakPtr;

/// A reference-counted pointer that keeps its pointee alive.
///
/// Every clone shares one control block and increases its shared count. The
/// pointee is destroyed when the last `SharedPtr` to it goes away; the control
/// block itself is freed once the last [`WeakPtr`] is gone as well.
///
/// A `SharedPtr` may be empty. Empty handles are created by
/// [`SharedPtr::empty`], [`SharedPtr::reset`], [`SharedPtr::take`] and by
/// locking an expired [`WeakPtr`].
///
/// See the [module](crate) documentation for more information.
pub struct SharedPtr<T: ?Sized> {
    raw: Option<Raw<T>>,
    /// A SharedPtr may own and drop a `T`.
    _p: PhantomData<T>,
}

impl<T: ?Sized> Drop for SharedPtr<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: this handle owned one shared count and is now empty.
            unsafe { internals::release_shared(raw.block) };
        }
    }
}

impl<T: ?Sized> Clone for SharedPtr<T> {
    /// Shares the pointee and increases the shared count.
    ///
    /// # Panics
    ///
    /// Panics if the number of `SharedPtr`s overflows `usize::MAX`.
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            // SAFETY: `self` keeps the block allocated.
            unsafe { raw.header() }.increase_shared();
        }
        Self {
            raw: self.raw,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Default for SharedPtr<T> {
    /// Creates an empty `SharedPtr`.
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Deref for SharedPtr<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the `SharedPtr` is empty.
    #[inline]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => empty_deref(),
        }
    }
}

/// Panics.
///
/// Is unlikely to be called, so it has a 'cold' attribute for optimization.
#[cold]
#[inline(never)]
fn empty_deref() -> ! {
    panic!("dereferenced an empty SharedPtr")
}

impl<T> From<T> for SharedPtr<T> {
    #[inline]
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> From<Box<T>> for SharedPtr<T> {
    #[inline]
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("SharedPtr").field(&value).finish(),
            None => f.write_str("SharedPtr(<empty>)"),
        }
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: ?Sized> fmt::Pointer for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => fmt::Pointer::fmt(&raw.ptr, f),
            None => fmt::Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

impl<T: ?Sized + PartialEq> PartialEq for SharedPtr<T> {
    /// Compares the pointees. Two empty handles are equal.
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T: ?Sized + Eq> Eq for SharedPtr<T> {}

impl<T: ?Sized + PartialOrd> PartialOrd for SharedPtr<T> {
    /// Compares the pointees. An empty handle orders before any other.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.get().partial_cmp(&other.get())
    }
}

impl<T: ?Sized + Ord> Ord for SharedPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.get().cmp(&other.get())
    }
}

impl<T: ?Sized + Hash> Hash for SharedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.get().hash(state)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Embedded construction
///////////////////////////////////////////////////////////////////////////////

impl<T> SharedPtr<T> {
    /// Creates a new `SharedPtr` with the pointee stored inside the control
    /// block, using the global allocator.
    ///
    /// Does not bind the self-handle of a [`SharedFromThis`] pointee, see
    /// [`SharedPtr::new_aware`].
    ///
    /// [`SharedFromThis`]: crate::SharedFromThis
    pub fn new(value: T) -> Self {
        Self::new_in(value, Global)
    }

    /// Allocates the control block first, then constructs the pointee in it
    /// from the result of `init`.
    ///
    /// If `init` panics, the control block is freed before the panic
    /// continues.
    pub fn new_with<F: FnOnce() -> T>(init: F) -> Self {
        match internals::new_embedded(Global, init) {
            Ok(raw) => Self::from_inner(raw),
            Err(AllocError) => handle_alloc_error(Layout::new::<EmbeddedBlock<T, Global>>()),
        }
    }

    /// Creates a new `SharedPtr` with the pointee stored inside a control
    /// block allocated by `alloc`.
    ///
    /// Calls [`handle_alloc_error`] if the allocation fails. See
    /// [`SharedPtr::try_new_in`] for a version that returns the error.
    pub fn new_in<A: Allocator + 'static>(value: T, alloc: A) -> Self {
        match Self::try_new_in(value, alloc) {
            Ok(this) => this,
            Err(AllocError) => handle_alloc_error(Layout::new::<EmbeddedBlock<T, A>>()),
        }
    }

    /// Tries to create a new `SharedPtr` with the pointee stored inside a
    /// control block allocated by `alloc`.
    ///
    /// # Returns
    ///
    /// * `Ok(SharedPtr)` if the allocation succeeded.
    /// * `Err(AllocError)` if it failed. `value` is dropped and nothing else
    ///   happened.
    pub fn try_new_in<A: Allocator + 'static>(value: T, alloc: A) -> Result<Self, AllocError> {
        Self::try_new_with_in(|| value, alloc)
    }

    /// Tries to allocate a control block with `alloc`, then constructs the
    /// pointee in it from the result of `init`.
    ///
    /// `init` is not called if the allocation fails.
    pub fn try_new_with_in<A, F>(init: F, alloc: A) -> Result<Self, AllocError>
    where
        A: Allocator + 'static,
        F: FnOnce() -> T,
    {
        internals::new_embedded(alloc, init).map(Self::from_inner)
    }
}

///////////////////////////////////////////////////////////////////////////////
// External construction
///////////////////////////////////////////////////////////////////////////////

impl<T: ?Sized> SharedPtr<T> {
    /// Creates an empty `SharedPtr` that owns nothing.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            raw: None,
            _p: PhantomData,
        }
    }

    /// Wraps a handle around a block whose shared count it now owns.
    #[inline]
    pub(crate) fn from_inner(raw: Raw<T>) -> Self {
        Self {
            raw: Some(raw),
            _p: PhantomData,
        }
    }

    /// Takes ownership of a boxed value. Only the control block is allocated;
    /// the box is dropped when the last `SharedPtr` goes away.
    ///
    /// Does not bind the self-handle of a [`SharedFromThis`] pointee, see
    /// [`SharedPtr::from_box_aware`].
    ///
    /// [`SharedFromThis`]: crate::SharedFromThis
    pub fn from_box(value: Box<T>) -> Self {
        let ptr = NonNull::from(Box::leak(value));
        // SAFETY: the pointer came from a box and is freed by turning it back
        // into one, exactly once.
        unsafe { Self::from_raw_with(ptr, drop_box::<T>) }
    }

    /// Shares a value that lives for the whole program. Dropping the last
    /// `SharedPtr` does nothing to the value.
    pub fn from_static(value: &'static T) -> Self {
        // SAFETY: the reference is valid forever and the deleter ignores it.
        unsafe { Self::from_raw_with(NonNull::from(value), |_| {}) }
    }

    /// Takes ownership of `ptr`; `deleter` is called on it exactly once, when
    /// the last `SharedPtr` goes away. The control block is allocated with the
    /// global allocator.
    ///
    /// Calls [`handle_alloc_error`] if the allocation fails, after calling
    /// `deleter` on `ptr`.
    ///
    /// # Safety
    ///
    /// 1. Ensure `ptr` is valid for reads until `deleter` is called.
    /// 2. Ensure nothing mutates the pointee through other pointers while a
    ///    `SharedPtr` or a `WeakPtr` can reach it.
    /// 3. Ensure everything `deleter` borrows outlives every handle to the
    ///    new control block.
    pub unsafe fn from_raw_with<D>(ptr: NonNull<T>, deleter: D) -> Self
    where
        D: FnOnce(NonNull<T>),
    {
        // SAFETY: the caller must uphold the safety requirements
        match unsafe { Self::try_from_raw_with_in(ptr, deleter, Global) } {
            Ok(this) => this,
            Err(AllocError) => handle_alloc_error(Layout::new::<ExternalBlock<T, D, Global>>()),
        }
    }

    /// Like [`SharedPtr::from_raw_with`], with the control block allocated by
    /// `alloc`.
    ///
    /// # Safety
    ///
    /// See [`SharedPtr::from_raw_with`]. Additionally, ensure everything
    /// `alloc` borrows outlives every handle to the new control block.
    pub unsafe fn from_raw_with_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Self
    where
        D: FnOnce(NonNull<T>),
        A: Allocator,
    {
        // SAFETY: the caller must uphold the safety requirements
        match unsafe { Self::try_from_raw_with_in(ptr, deleter, alloc) } {
            Ok(this) => this,
            Err(AllocError) => handle_alloc_error(Layout::new::<ExternalBlock<T, D, A>>()),
        }
    }

    /// Tries to take ownership of `ptr` with a control block allocated by
    /// `alloc`.
    ///
    /// # Returns
    ///
    /// * `Ok(SharedPtr)` if the allocation succeeded.
    /// * `Err(AllocError)` if it failed. `deleter` has been called on `ptr`.
    ///
    /// # Safety
    ///
    /// See [`SharedPtr::from_raw_with_in`].
    pub unsafe fn try_from_raw_with_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>),
        A: Allocator,
    {
        internals::new_external(ptr, deleter, alloc).map(Self::from_inner)
    }
}

/// Drops a pointer that came from `Box::leak`.
fn drop_box<T: ?Sized>(ptr: NonNull<T>) {
    // SAFETY: only used as the deleter of `SharedPtr::from_box`.
    drop(unsafe { Box::from_raw(ptr.as_ptr()) });
}

///////////////////////////////////////////////////////////////////////////////
// Handle operations
///////////////////////////////////////////////////////////////////////////////

impl<T: ?Sized> SharedPtr<T> {
    /// Returns a reference to the pointee, or `None` if the `SharedPtr` is
    /// empty.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-empty handle keeps the pointee alive, and the pointee
        // is only ever accessed through shared references.
        self.raw.map(|raw| unsafe { &*raw.ptr.as_ptr() })
    }

    /// Returns true if the `SharedPtr` owns nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Returns the number of `SharedPtr`s sharing the pointee, or 0 if this
    /// one is empty.
    pub fn use_count(&self) -> Count {
        // SAFETY: `self` keeps the block allocated.
        self.raw.map_or(0, |raw| unsafe { raw.header() }.shared_count())
    }

    /// Returns the number of [`WeakPtr`]s to the pointee, or 0 if this
    /// `SharedPtr` is empty.
    ///
    /// The self-handle of a bound [`EnableSharedFromThis`] counts as one.
    ///
    /// [`EnableSharedFromThis`]: crate::EnableSharedFromThis
    pub fn weak_count(&self) -> Count {
        // SAFETY: `self` keeps the block allocated.
        self.raw.map_or(0, |raw| unsafe { raw.header() }.weak_count())
    }

    /// Gives up ownership. The `SharedPtr` is empty afterwards.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Gives up ownership, then takes ownership of `value` as if created by
    /// [`SharedPtr::from_box`]. See [`SharedPtr::reset_to_aware`] for a
    /// [`SharedFromThis`](crate::SharedFromThis) pointee.
    pub fn reset_to(&mut self, value: Box<T>) {
        *self = Self::from_box(value);
    }

    /// Moves the ownership out into a new `SharedPtr`, leaving this one
    /// empty. The counts do not change.
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Creates a [`WeakPtr`] to the pointee. Downgrading an empty `SharedPtr`
    /// gives an empty `WeakPtr`.
    ///
    /// # Panics
    ///
    /// Panics if the number of `WeakPtr`s overflows `usize::MAX`.
    pub fn downgrade(this: &Self) -> WeakPtr<T> {
        match this.raw {
            Some(raw) => {
                // SAFETY: `this` keeps the block allocated.
                unsafe { raw.header() }.increase_weak();
                WeakPtr::from_inner(raw)
            }
            None => WeakPtr::new(),
        }
    }

    /// Returns a `SharedPtr` to a part of the pointee, sharing the control
    /// block. The whole pointee stays alive as long as the new handle does.
    ///
    /// Mapping an empty `SharedPtr` gives an empty one and does not call `f`.
    ///
    /// # Examples
    ///
    /// ```
    /// use shareptr::SharedPtr;
    ///
    /// struct Pair {
    ///     left: String,
    ///     right: String,
    /// }
    ///
    /// let pair = SharedPtr::new(Pair { left: "l".into(), right: "r".into() });
    /// let right = SharedPtr::map(pair.clone(), |pair| &pair.right);
    ///
    /// assert_eq!(*right, "r");
    /// assert_eq!(pair.use_count(), 2);
    /// ```
    pub fn map<U, F>(this: Self, f: F) -> SharedPtr<U>
    where
        T: 'static,
        U: ?Sized,
        F: FnOnce(&T) -> &U,
    {
        let Some(raw) = this.raw else {
            return SharedPtr::empty();
        };
        // SAFETY: `this` keeps the pointee alive while `f` runs, and drops
        // its count normally if `f` panics.
        let ptr = NonNull::from(f(unsafe { &*raw.ptr.as_ptr() }));
        // The count moves to the new handle.
        mem::forget(this);
        SharedPtr::from_inner(Raw { ptr, block: raw.block })
    }

    /// Changes the view pointer while keeping the control block. Used by
    /// [`coerce!`](crate::coerce).
    ///
    /// # Safety
    ///
    /// Ensure `f` returns a pointer to the pointee or to a part of it.
    #[doc(hidden)]
    pub unsafe fn map_raw<U, F>(this: Self, f: F) -> SharedPtr<U>
    where
        U: ?Sized,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        let Some(raw) = this.raw else {
            return SharedPtr::empty();
        };
        let ptr = f(raw.ptr);
        mem::forget(this);
        SharedPtr::from_inner(Raw { ptr, block: raw.block })
    }

    /// Returns true if both handles view the same address. Two empty handles
    /// are equal.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (this.raw, other.raw) {
            (Some(a), Some(b)) => ptr::addr_eq(a.ptr.as_ptr(), b.ptr.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }

    /// Returns true if both handles share a control block, whatever part of
    /// the pointee they view. Two empty handles are equal.
    pub fn owner_eq<U: ?Sized>(this: &Self, other: &SharedPtr<U>) -> bool {
        this.block() == other.block()
    }

    #[inline]
    pub(crate) fn block(&self) -> Option<NonNull<ControlBlock>> {
        self.raw.map(|raw| raw.block)
    }
}

impl<T> SharedPtr<T> {
    /// Returns a raw pointer to the pointee, or null if the `SharedPtr` is
    /// empty.
    ///
    /// Only sized pointees have a null pointer. For a `SharedPtr<dyn Trait>`
    /// or `SharedPtr<[T]>`, use `get().map(|value| value as *const _)`.
    pub fn as_ptr(this: &Self) -> *const T {
        match this.raw {
            Some(raw) => raw.ptr.as_ptr(),
            None => ptr::null(),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////
