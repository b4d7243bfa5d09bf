//! The allocator interface consumed by the control blocks.

use core::fmt;
use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::error;

/// A source of raw memory for control blocks.
///
/// Control blocks ask for the [`Layout`] of their own concrete type, so a
/// single allocator value serves every block type it is handed to.
///
/// # Safety
///
/// 1. A pointer returned by `allocate` must be valid for reads and writes of
///    `layout.size()` bytes and aligned to `layout.align()` until it is passed
///    to `deallocate`.
/// 2. Clones of an allocator must be able to free each other's memory.
pub unsafe trait Allocator {
    /// Allocates a block of memory described by `layout`.
    ///
    /// `layout` never has a size of zero.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Frees a block of memory.
    ///
    /// # Safety
    ///
    /// Ensure `ptr` was returned by `allocate` on this allocator (or a clone
    /// of it) with the same `layout`, and has not been freed yet.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller must uphold the safety requirements
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// The global memory allocator, backed by [`std::alloc`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Global;

unsafe impl Allocator for Global {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert_ne!(layout.size(), 0);
        // SAFETY: control blocks are never zero-sized.
        NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller must uphold the safety requirements
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// The allocator could not provide memory for a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory allocation failed")
    }
}

impl error::Error for AllocError {}
