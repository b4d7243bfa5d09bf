//! Contains the control block, its two layouts and the release paths shared
//! by `SharedPtr` and `WeakPtr`.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use core::ptr::{self, NonNull};
use std::alloc::Layout;

use log::trace;

use crate::alloc::{AllocError, Allocator};

///////////////////////////////////////////////////////////////////////////////
// Control Block
///////////////////////////////////////////////////////////////////////////////

/// The reference counter.
pub(crate) type Count = usize;

/// The operations a concrete block layout provides.
///
/// Every entry receives the block it was stored in.
pub(crate) struct BlockVTable {
    /// Returns the address of the tracked object.
    pointee: unsafe fn(NonNull<ControlBlock>) -> NonNull<()>,
    /// Runs the destructor or the deleter. Never frees the block.
    destroy_pointee: unsafe fn(NonNull<ControlBlock>),
    /// Frees the storage of the block.
    deallocate: unsafe fn(NonNull<ControlBlock>),
}

/// The bookkeeping shared by all handles to one object.
///
/// This is the first field of both block layouts, so a pointer to either
/// layout is also a pointer to its `ControlBlock`.
#[repr(C)]
pub struct ControlBlock {
    /// The number of `SharedPtr`s.
    shared: Cell<Count>,
    /// The number of `WeakPtr`s.
    weak: Cell<Count>,
    vtable: &'static BlockVTable,
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("shared", &self.shared.get())
            .field("weak", &self.weak.get())
            .finish()
    }
}

impl ControlBlock {
    /// A header for a freshly created block, owned by one `SharedPtr`.
    fn new(vtable: &'static BlockVTable) -> Self {
        Self {
            shared: Cell::new(1),
            weak: Cell::new(0),
            vtable,
        }
    }

    /// Returns the current shared count.
    #[inline]
    pub(crate) fn shared_count(&self) -> Count {
        self.shared.get()
    }

    /// Returns the current weak count.
    #[inline]
    pub(crate) fn weak_count(&self) -> Count {
        self.weak.get()
    }

    /// Sets both counts. Used in tests.
    #[inline]
    #[cfg(test)]
    pub(crate) fn set_counts(&self, shared: Count, weak: Count) {
        self.shared.set(shared);
        self.weak.set(weak);
    }

    /// Returns true if the pointee has not been destroyed.
    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.shared_count() != 0
    }

    /// Increases the shared count by 1.
    ///
    /// # Panics
    ///
    /// Panics if the number of `SharedPtr`s overflows `usize::MAX`.
    #[inline]
    pub(crate) fn increase_shared(&self) {
        increase(&self.shared);
    }

    /// Increases the weak count by 1.
    ///
    /// # Panics
    ///
    /// Panics if the number of `WeakPtr`s overflows `usize::MAX`.
    #[inline]
    pub(crate) fn increase_weak(&self) {
        increase(&self.weak);
    }

    /// Decreases the shared count by 1 and returns the new count.
    #[inline]
    fn decrease_shared(&self) -> Count {
        let count = self.shared_count() - 1;
        self.shared.set(count);
        count
    }

    /// Decreases the weak count by 1 and returns the new count.
    #[inline]
    fn decrease_weak(&self) -> Count {
        let count = self.weak_count() - 1;
        self.weak.set(count);
        count
    }

    /// Returns the address of the object this block tracks.
    ///
    /// # Safety
    ///
    /// Ensure `this` points to a block that has not been deallocated.
    #[inline]
    pub(crate) unsafe fn pointee(this: NonNull<Self>) -> NonNull<()> {
        // SAFETY: the caller guarantees the block is allocated.
        unsafe { (this.as_ref().vtable.pointee)(this) }
    }
}

#[inline]
fn increase(counter: &Cell<Count>) {
    let count = counter.get();

    if count == Count::MAX {
        cold_panic();
    } else {
        counter.set(count + 1);
    }
}

/// Panics.
///
/// Is unlikely to be called, so it has a 'cold' attribute for optimization.
#[cold]
#[inline(never)]
fn cold_panic() {
    panic!("reference count overflow")
}

/// The view pointer and block of a non-empty handle.
pub(crate) struct Raw<T: ?Sized> {
    pub(crate) ptr: NonNull<T>,
    pub(crate) block: NonNull<ControlBlock>,
}

impl<T: ?Sized> Clone for Raw<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Raw<T> {}

impl<T: ?Sized> Raw<T> {
    /// Returns a read-only reference to the control block.
    ///
    /// # Safety
    ///
    /// Ensure the handle holding this `Raw` keeps the block allocated for the
    /// lifetime of the reference.
    #[inline(always)]
    pub(crate) unsafe fn header<'a>(self) -> &'a ControlBlock {
        // SAFETY (1): the caller guarantees the block stays allocated.
        // SAFETY (2): the reference only covers the header, which is always
        // initialized, never the pointee.
        unsafe { self.block.as_ref() }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Embedded Block
///////////////////////////////////////////////////////////////////////////////

/// A block with the pointee stored inline, created in one allocation.
#[repr(C)]
pub(crate) struct EmbeddedBlock<T, A> {
    header: ControlBlock,
    alloc: A,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T, A: Allocator> EmbeddedBlock<T, A> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        pointee: Self::pointee,
        destroy_pointee: Self::destroy_pointee,
        deallocate: Self::deallocate,
    };

    unsafe fn pointee(this: NonNull<ControlBlock>) -> NonNull<()> {
        let this = this.as_ptr().cast::<Self>();
        // SAFETY: `this` came from `new_embedded`, so it points to a whole
        // `EmbeddedBlock` and the field pointer is not null.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*this).value).cast()) }
    }

    unsafe fn destroy_pointee(this: NonNull<ControlBlock>) {
        let this = this.as_ptr().cast::<Self>();
        trace!("destroying embedded pointee of block {:p}", this);
        // SAFETY (1): `UnsafeCell<MaybeUninit<T>>` has the layout of `T`.
        // SAFETY (2): the value is initialized and this is the only call,
        // made when the shared count dropped to 0.
        unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*this).value).cast::<T>()) };
    }

    unsafe fn deallocate(this: NonNull<ControlBlock>) {
        let this = this.as_ptr().cast::<Self>();
        trace!("deallocating embedded block {:p}", this);
        // SAFETY (1): the allocator is moved out exactly once, right before
        // the memory holding it is freed.
        // SAFETY (2): the value was already dropped, it is not touched here.
        unsafe {
            let alloc = ptr::read(ptr::addr_of!((*this).alloc));
            alloc.deallocate(NonNull::new_unchecked(this.cast()), Layout::new::<Self>());
        }
    }
}

/// Frees a fresh allocation if constructing the pointee unwinds.
struct DeallocOnUnwind<'a, A: Allocator> {
    alloc: &'a A,
    mem: NonNull<u8>,
    layout: Layout,
}

impl<A: Allocator> Drop for DeallocOnUnwind<'_, A> {
    fn drop(&mut self) {
        // SAFETY: `mem` was allocated by `alloc` with `layout` and nothing
        // else refers to it yet.
        unsafe { self.alloc.deallocate(self.mem, self.layout) };
    }
}

/// Allocates an embedded block, then constructs the pointee in it.
///
/// If `init` panics, the block is freed before the panic continues.
pub(crate) fn new_embedded<T, A, F>(alloc: A, init: F) -> Result<Raw<T>, AllocError>
where
    A: Allocator,
    F: FnOnce() -> T,
{
    let layout = Layout::new::<EmbeddedBlock<T, A>>();
    let mem = alloc.allocate(layout)?;

    let guard = DeallocOnUnwind {
        alloc: &alloc,
        mem,
        layout,
    };
    let value = init();
    mem::forget(guard);

    let block = mem.as_ptr().cast::<EmbeddedBlock<T, A>>();
    // SAFETY: `block` is fresh memory sized and aligned for an
    // `EmbeddedBlock<T, A>`; no reference to it exists yet.
    unsafe {
        ptr::addr_of_mut!((*block).header).write(ControlBlock::new(EmbeddedBlock::<T, A>::VTABLE));
        ptr::addr_of_mut!((*block).alloc).write(alloc);
        ptr::addr_of_mut!((*block).value).write(UnsafeCell::new(MaybeUninit::new(value)));
    }
    trace!("allocated embedded block {:p} ({} bytes)", block, layout.size());

    // SAFETY: `mem` is not null, so neither is its cast.
    let block = unsafe { NonNull::new_unchecked(block.cast::<ControlBlock>()) };
    // SAFETY: the block was just initialized.
    let ptr = unsafe { ControlBlock::pointee(block) }.cast::<T>();
    Ok(Raw { ptr, block })
}

///////////////////////////////////////////////////////////////////////////////
// External Block
///////////////////////////////////////////////////////////////////////////////

/// A block tracking a separately allocated pointee through a deleter.
#[repr(C)]
pub(crate) struct ExternalBlock<T: ?Sized, D, A> {
    header: ControlBlock,
    alloc: A,
    /// Taken by `destroy_pointee`.
    deleter: ManuallyDrop<D>,
    ptr: NonNull<T>,
}

impl<T: ?Sized, D: FnOnce(NonNull<T>), A: Allocator> ExternalBlock<T, D, A> {
    const VTABLE: &'static BlockVTable = &BlockVTable {
        pointee: Self::pointee,
        destroy_pointee: Self::destroy_pointee,
        deallocate: Self::deallocate,
    };

    unsafe fn pointee(this: NonNull<ControlBlock>) -> NonNull<()> {
        let this = this.as_ptr().cast::<Self>();
        // SAFETY: `this` came from `new_external` and the pointer field is
        // never written after construction.
        unsafe { (*this).ptr.cast() }
    }

    unsafe fn destroy_pointee(this: NonNull<ControlBlock>) {
        let this = this.as_ptr().cast::<Self>();
        trace!("running deleter of block {:p}", this);
        // SAFETY: this is the only call, made when the shared count dropped
        // to 0, so the deleter has not been taken yet.
        unsafe {
            let deleter = ManuallyDrop::take(&mut *ptr::addr_of_mut!((*this).deleter));
            deleter((*this).ptr);
        }
    }

    unsafe fn deallocate(this: NonNull<ControlBlock>) {
        let this = this.as_ptr().cast::<Self>();
        trace!("deallocating external block {:p}", this);
        // SAFETY (1): the deleter was taken by `destroy_pointee`, only the
        // allocator still needs to be moved out.
        // SAFETY (2): the memory was allocated by that allocator with the
        // layout of `Self`.
        unsafe {
            let alloc = ptr::read(ptr::addr_of!((*this).alloc));
            alloc.deallocate(NonNull::new_unchecked(this.cast()), Layout::new::<Self>());
        }
    }
}

/// Allocates an external block for `ptr`.
///
/// If the allocation fails, `deleter` is called on `ptr` before the error is
/// returned: ownership of the pointee was handed over either way.
pub(crate) fn new_external<T, D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Result<Raw<T>, AllocError>
where
    T: ?Sized,
    D: FnOnce(NonNull<T>),
    A: Allocator,
{
    let layout = Layout::new::<ExternalBlock<T, D, A>>();
    let mem = match alloc.allocate(layout) {
        Ok(mem) => mem,
        Err(err) => {
            deleter(ptr);
            return Err(err);
        }
    };

    let block = mem.as_ptr().cast::<ExternalBlock<T, D, A>>();
    // SAFETY: `block` is fresh memory sized and aligned for an
    // `ExternalBlock<T, D, A>`; no reference to it exists yet.
    unsafe {
        block.write(ExternalBlock {
            header: ControlBlock::new(ExternalBlock::<T, D, A>::VTABLE),
            alloc,
            deleter: ManuallyDrop::new(deleter),
            ptr,
        });
    }
    trace!("allocated external block {:p} ({} bytes)", block, layout.size());

    // SAFETY: `mem` is not null, so neither is its cast.
    let block = unsafe { NonNull::new_unchecked(block.cast::<ControlBlock>()) };
    Ok(Raw { ptr, block })
}

///////////////////////////////////////////////////////////////////////////////
// Releasing
///////////////////////////////////////////////////////////////////////////////

/// Called when a `SharedPtr` is dropped or reset.
///
/// # Safety
///
/// Ensure the caller owned one shared count of `block` and does not use the
/// block after this call.
pub(crate) unsafe fn release_shared(block: NonNull<ControlBlock>) {
    // SAFETY: the caller's shared count keeps the block allocated up to here.
    let header = unsafe { block.as_ref() };

    if header.decrease_shared() != 0 {
        return;
    }

    // The pointee may hold weak handles to its own block. Hold an extra weak
    // count while it is destroyed so that dropping them cannot free the block
    // from under the destructor.
    header.increase_weak();
    // SAFETY: the shared count just reached 0, this is the only call.
    unsafe { (header.vtable.destroy_pointee)(block) };

    if header.decrease_weak() == 0 {
        let deallocate = header.vtable.deallocate;
        // SAFETY: both counts are 0, no handle refers to the block anymore.
        unsafe { deallocate(block) };
    }
}

/// Called when a `WeakPtr` is dropped or reset.
///
/// # Safety
///
/// Ensure the caller owned one weak count of `block` and does not use the
/// block after this call.
pub(crate) unsafe fn release_weak(block: NonNull<ControlBlock>) {
    // SAFETY: the caller's weak count keeps the block allocated up to here.
    let header = unsafe { block.as_ref() };

    // If there are no more references and the pointee is destroyed, the block
    // needs to be deallocated.
    if header.decrease_weak() == 0 && header.shared_count() == 0 {
        let deallocate = header.vtable.deallocate;
        // SAFETY: both counts are 0, no handle refers to the block anymore.
        unsafe { deallocate(block) };
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////
