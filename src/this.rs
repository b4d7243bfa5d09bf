//! Lets a managed object hand out owning handles to itself.

use core::cell::OnceCell;
use core::fmt;
use core::ptr::NonNull;
use std::alloc::{handle_alloc_error, Layout};

use log::debug;

use crate::alloc::{AllocError, Allocator, Global};
use crate::internals::EmbeddedBlock;
use crate::{BadWeakPtr, SharedPtr, WeakPtr};

/// The self-handle of an object implementing [`SharedFromThis`].
///
/// It starts out unbound. The `_aware` constructors of [`SharedPtr`] bind it
/// to the new control block, once; later constructors leave a bound slot
/// alone. Cloning a slot gives an unbound one, since the clone is a different
/// object.
pub struct EnableSharedFromThis<T> {
    this: OnceCell<WeakPtr<T>>,
}

impl<T> EnableSharedFromThis<T> {
    /// Creates an unbound slot.
    #[inline]
    pub const fn new() -> Self {
        Self {
            this: OnceCell::new(),
        }
    }

    /// Returns true once an owning handle has been created for the object.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.this.get().is_some()
    }

    /// Records a weak handle to `owner`'s block, unless one was recorded
    /// already.
    fn bind(&self, owner: &SharedPtr<T>) {
        self.this.get_or_init(|| SharedPtr::downgrade(owner));
    }
}

impl<T> Default for EnableSharedFromThis<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EnableSharedFromThis<T> {
    /// Returns an unbound slot.
    #[inline]
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EnableSharedFromThis<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnableSharedFromThis")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// An object that can produce [`SharedPtr`]s to itself while it is owned by
/// one.
///
/// # Examples
///
/// ```
/// use shareptr::{EnableSharedFromThis, SharedFromThis, SharedPtr};
///
/// struct Node {
///     this: EnableSharedFromThis<Node>,
///     name: String,
/// }
///
/// impl SharedFromThis for Node {
///     fn this_slot(&self) -> &EnableSharedFromThis<Self> {
///         &self.this
///     }
/// }
///
/// let node = SharedPtr::new_aware(Node {
///     this: EnableSharedFromThis::new(),
///     name: "root".into(),
/// });
///
/// let again = node.shared_from_this().unwrap();
/// assert_eq!(again.name, "root");
/// assert_eq!(node.use_count(), 2);
/// ```
pub trait SharedFromThis: Sized {
    /// Returns the slot holding the self-handle.
    fn this_slot(&self) -> &EnableSharedFromThis<Self>;

    /// Returns a new [`SharedPtr`] to `self`.
    ///
    /// # Returns
    ///
    /// * `Ok(SharedPtr)` if `self` is owned by a `SharedPtr`.
    /// * `Err(BadWeakPtr::Unbound)` if no `_aware` constructor ever took
    ///   ownership of `self`.
    /// * `Err(BadWeakPtr::Expired)` if `self` is being destroyed.
    fn shared_from_this(&self) -> Result<SharedPtr<Self>, BadWeakPtr> {
        let Some(this) = self.this_slot().this.get() else {
            debug!("shared_from_this on an object that is not owned yet");
            return Err(BadWeakPtr::Unbound);
        };

        let owner = this.lock();
        if owner.is_empty() {
            debug!("shared_from_this on an object that is being destroyed");
            Err(BadWeakPtr::Expired)
        } else {
            Ok(owner)
        }
    }

    /// Returns a [`WeakPtr`] to `self`, or an empty one if `self` is not owned
    /// by a `SharedPtr` yet.
    fn weak_from_this(&self) -> WeakPtr<Self> {
        self.this_slot().this.get().cloned().unwrap_or_default()
    }
}

impl<T: SharedFromThis> SharedPtr<T> {
    /// Binds the self-handle of the pointee to this handle's block.
    fn bind_this(self) -> Self {
        if let Some(value) = self.get() {
            value.this_slot().bind(&self);
        }
        self
    }

    /// Like [`SharedPtr::new`], and binds the self-handle of `value`.
    pub fn new_aware(value: T) -> Self {
        Self::new(value).bind_this()
    }

    /// Like [`SharedPtr::new_in`], and binds the self-handle of `value`.
    pub fn new_aware_in<A: Allocator + 'static>(value: T, alloc: A) -> Self {
        match Self::try_new_aware_in(value, alloc) {
            Ok(this) => this,
            Err(AllocError) => handle_alloc_error(Layout::new::<EmbeddedBlock<T, A>>()),
        }
    }

    /// Like [`SharedPtr::try_new_in`], and binds the self-handle of `value`.
    pub fn try_new_aware_in<A: Allocator + 'static>(value: T, alloc: A) -> Result<Self, AllocError> {
        Self::try_new_in(value, alloc).map(Self::bind_this)
    }

    /// Like [`SharedPtr::from_box`], and binds the self-handle of `value`.
    pub fn from_box_aware(value: Box<T>) -> Self {
        Self::from_box(value).bind_this()
    }

    /// Like [`SharedPtr::from_raw_with`], and binds the self-handle of the
    /// pointee.
    ///
    /// # Safety
    ///
    /// See [`SharedPtr::from_raw_with`].
    pub unsafe fn from_raw_with_aware<D>(ptr: NonNull<T>, deleter: D) -> Self
    where
        D: FnOnce(NonNull<T>),
    {
        // SAFETY: the caller must uphold the safety requirements
        unsafe { Self::from_raw_with_aware_in(ptr, deleter, Global) }
    }

    /// Like [`SharedPtr::from_raw_with_in`], and binds the self-handle of the
    /// pointee.
    ///
    /// # Safety
    ///
    /// See [`SharedPtr::from_raw_with_in`].
    pub unsafe fn from_raw_with_aware_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Self
    where
        D: FnOnce(NonNull<T>),
        A: Allocator,
    {
        // SAFETY: the caller must uphold the safety requirements
        unsafe { Self::from_raw_with_in(ptr, deleter, alloc) }.bind_this()
    }

    /// Like [`SharedPtr::try_from_raw_with_in`], and binds the self-handle of
    /// the pointee on success.
    ///
    /// # Safety
    ///
    /// See [`SharedPtr::from_raw_with_in`].
    pub unsafe fn try_from_raw_with_aware_in<D, A>(
        ptr: NonNull<T>,
        deleter: D,
        alloc: A,
    ) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>),
        A: Allocator,
    {
        // SAFETY: the caller must uphold the safety requirements
        unsafe { Self::try_from_raw_with_in(ptr, deleter, alloc) }.map(Self::bind_this)
    }

    /// Like [`SharedPtr::reset_to`], and binds the self-handle of `value`.
    pub fn reset_to_aware(&mut self, value: Box<T>) {
        *self = Self::from_box_aware(value);
    }
}
