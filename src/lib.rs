//! Shared and weak reference-counted pointers.
//!
//! A [`SharedPtr`] owns its pointee together with every clone of it: the
//! pointee is dropped when the last `SharedPtr` goes away. A [`WeakPtr`]
//! observes the same pointee without keeping it alive, and can be turned back
//! into a `SharedPtr` with [`WeakPtr::lock`] for as long as the pointee lives.
//! Cycles of `SharedPtr`s leak; break them with `WeakPtr`s.
//!
//! Both handles point to a *control block* holding two counters: the number
//! of `SharedPtr`s and the number of `WeakPtr`s. Teardown happens in two
//! stages. When the shared count reaches 0 the pointee is destroyed; the
//! block itself is freed once the weak count is 0 as well, so that a
//! `WeakPtr` can always tell that its pointee is gone.
//!
//! ## Allocation strategies
//!
//! |                  | Embedded                                        | External                                            |
//! |------------------|-------------------------------------------------|-----------------------------------------------------|
//! | Constructors     | `new`, `new_with`, `new_in`, `try_new_in`       | `from_box`, `from_static`, `from_raw_with(_in)`     |
//! | Allocations      | One: the pointee lives inside the block         | One for the block, the pointee is allocated already |
//! | Teardown         | The pointee is dropped in place                 | A deleter is called with the pointer, once          |
//! | Block memory     | The given [`Allocator`] (default [`Global`])    | The given [`Allocator`] (default [`Global`])        |
//!
//! ## Views
//!
//! A handle may view a part of its pointee, or the pointee through an unsized
//! type, while sharing the pointee's counts: see [`SharedPtr::map`],
//! [`coerce!`] and [`coerce_weak!`]. The whole pointee stays alive as long as
//! any view of it does.
//!
//! ## Shared from this
//!
//! An object implementing [`SharedFromThis`] carries an
//! [`EnableSharedFromThis`] slot. The `_aware` constructors
//! ([`SharedPtr::new_aware`], [`SharedPtr::from_box_aware`], ...) bind that
//! slot, after which the object can hand out new `SharedPtr`s to itself with
//! [`SharedFromThis::shared_from_this`].
//!
//! ## Threads
//!
//! The counters are not atomic: `SharedPtr` and `WeakPtr` are neither `Send`
//! nor `Sync`.
//!
//! # Examples
//!
//! ```
//! use shareptr::SharedPtr;
//!
//! let first = SharedPtr::new(String::from("widget"));
//! let second = first.clone();
//! assert_eq!(first.use_count(), 2);
//!
//! let weak = SharedPtr::downgrade(&first);
//! assert!(!weak.expired());
//!
//! drop(first);
//! drop(second);
//! assert!(weak.expired());
//! assert!(weak.lock().is_empty());
//! ```
//!
//! # Logging
//!
//! Block allocation, pointee destruction and block deallocation are logged at
//! `trace` level through the [`log`](https://docs.rs/log) facade, failed
//! [`SharedFromThis::shared_from_this`] calls at `debug` level.

mod alloc;
mod internals;
mod shared;
mod this;
mod weak;

use core::fmt;
use std::error;

pub use crate::alloc::{AllocError, Allocator, Global};
pub use crate::shared::SharedPtr;
pub use crate::this::{EnableSharedFromThis, SharedFromThis};
pub use crate::weak::WeakPtr;

///////////////////////////////////////////////////////////////////////////////
// Helpers
///////////////////////////////////////////////////////////////////////////////

/// Coerces a `SharedPtr<T>` into a `SharedPtr<dyn Trait>` (or any other
/// unsized type `T` coerces to) on stable Rust.
///
/// Normally, performing custom coercions requires the [`CoerceUnsized`] trait
/// which is only available on Nightly Rust. This macro bypasses this trait by
/// performing the actual coercion on the view pointer, which is perfectly
/// possible on Stable Rust. The control block and the counts are kept.
///
/// # Examples
///
/// ```
/// use std::fmt::Display;
/// use shareptr::{coerce, SharedPtr};
///
/// let number = SharedPtr::new(42);
/// let display = coerce!(number.clone() => dyn Display);
///
/// assert_eq!(display.to_string(), "42");
/// assert_eq!(number.use_count(), 2);
/// ```
///
/// [`CoerceUnsized`]: std::ops::CoerceUnsized
#[macro_export]
macro_rules! coerce {
    ($shared:expr => $into_type:ty) => {{
        // SAFETY: an unsizing coercion keeps the address of the pointee.
        let __out: $crate::SharedPtr<$into_type> = unsafe {
            $crate::SharedPtr::map_raw($shared, |__ptr| {
                let __ptr: ::core::ptr::NonNull<$into_type> = __ptr;
                __ptr
            })
        };
        __out
    }};
}

/// Coerces a `WeakPtr<T>` into a `WeakPtr<dyn Trait>` on stable Rust.
///
/// Works like [`coerce!`], and also on expired `WeakPtr`s.
///
/// # Examples
///
/// ```
/// use std::fmt::Debug;
/// use shareptr::{coerce_weak, SharedPtr, WeakPtr};
///
/// let number = SharedPtr::new(42);
/// let weak = SharedPtr::downgrade(&number);
///
/// let dyn_weak: WeakPtr<dyn Debug> = coerce_weak!(weak => dyn Debug);
/// assert_eq!(format!("{:?}", dyn_weak.lock()), "SharedPtr(42)");
/// ```
#[macro_export]
macro_rules! coerce_weak {
    ($weak:expr => $into_type:ty) => {{
        // SAFETY: an unsizing coercion keeps the address of the pointee and
        // does not read through it.
        let __out: $crate::WeakPtr<$into_type> = unsafe {
            $crate::WeakPtr::map_raw($weak, |__ptr| {
                let __ptr: ::core::ptr::NonNull<$into_type> = __ptr;
                __ptr
            })
        };
        __out
    }};
}

///////////////////////////////////////////////////////////////////////////////
// Errors
///////////////////////////////////////////////////////////////////////////////

/// An error returned by [`SharedFromThis::shared_from_this`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadWeakPtr {
    /// No `SharedPtr` has taken ownership of the object yet.
    Unbound,
    /// The object is being destroyed.
    Expired,
}

impl fmt::Display for BadWeakPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadWeakPtr::Unbound => write!(f, "object is not owned by a SharedPtr"),
            BadWeakPtr::Expired => write!(f, "owning SharedPtr expired"),
        }
    }
}

impl error::Error for BadWeakPtr {}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////
