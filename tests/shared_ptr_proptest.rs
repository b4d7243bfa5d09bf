use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use proptest::prelude::*;
use shareptr::{AllocError, Allocator, Global, SharedPtr, WeakPtr};

#[derive(Clone, Default)]
struct Tracking {
    live: Rc<Cell<isize>>,
}

unsafe impl Allocator for Tracking {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.live.set(self.live.get() + 1);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.set(self.live.get() - 1);
        unsafe { Global.deallocate(ptr, layout) }
    }
}

struct Tracked {
    value: u32,
    drops: Rc<Cell<usize>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

fn create(external: bool, value: u32, drops: &Rc<Cell<usize>>, alloc: &Tracking) -> SharedPtr<Tracked> {
    let tracked = Tracked {
        value,
        drops: drops.clone(),
    };
    if external {
        let ptr = NonNull::from(Box::leak(Box::new(tracked)));
        unsafe {
            SharedPtr::from_raw_with_in(
                ptr,
                |p: NonNull<Tracked>| drop(Box::from_raw(p.as_ptr())),
                alloc.clone(),
            )
        }
    } else {
        SharedPtr::new_in(tracked, alloc.clone())
    }
}

// Model the handles of one pointee and assert the counts, the single
// destruction and the block's lifetime after every step.
proptest! {
    #[test]
    fn prop_shared_weak_lifecycle(
        external in any::<bool>(),
        ops in proptest::collection::vec((0u8..=7u8, 0usize..100usize), 1..120),
    ) {
        let drops = Rc::new(Cell::new(0usize));
        let alloc = Tracking::default();
        // Only non-empty handles are kept.
        let mut shared: Vec<SharedPtr<Tracked>> = vec![create(external, 7, &drops, &alloc)];
        let mut weak: Vec<WeakPtr<Tracked>> = Vec::new();

        for (op, raw_i) in ops {
            match op {
                // Clone a SharedPtr
                0 => {
                    if !shared.is_empty() {
                        let copy = shared[raw_i % shared.len()].clone();
                        shared.push(copy);
                    }
                }
                // Drop a SharedPtr
                1 => {
                    if !shared.is_empty() {
                        drop(shared.swap_remove(raw_i % shared.len()));
                    }
                }
                // Downgrade a SharedPtr
                2 => {
                    if !shared.is_empty() {
                        weak.push(SharedPtr::downgrade(&shared[raw_i % shared.len()]));
                    }
                }
                // Clone a WeakPtr
                3 => {
                    if !weak.is_empty() {
                        let copy = weak[raw_i % weak.len()].clone();
                        weak.push(copy);
                    }
                }
                // Drop a WeakPtr
                4 => {
                    if !weak.is_empty() {
                        drop(weak.swap_remove(raw_i % weak.len()));
                    }
                }
                // Lock a WeakPtr
                5 => {
                    if !weak.is_empty() {
                        let locked = weak[raw_i % weak.len()].lock();
                        prop_assert_eq!(locked.is_empty(), shared.is_empty());
                        if !locked.is_empty() {
                            prop_assert_eq!(locked.value, 7);
                            shared.push(locked);
                        }
                    }
                }
                // Move a SharedPtr out with take
                6 => {
                    if !shared.is_empty() {
                        let mut source = shared.swap_remove(raw_i % shared.len());
                        let before = source.use_count();
                        let moved = source.take();
                        prop_assert!(source.is_empty());
                        prop_assert_eq!(moved.use_count(), before);
                        shared.push(moved);
                    }
                }
                // Reset a WeakPtr in place
                7 => {
                    if !weak.is_empty() {
                        let mut gone = weak.swap_remove(raw_i % weak.len());
                        gone.reset();
                        prop_assert!(gone.expired());
                    }
                }
                _ => unreachable!(),
            }

            // Invariants after each step
            let alive = !shared.is_empty();
            prop_assert_eq!(drops.get(), if alive { 0 } else { 1 });
            for handle in &shared {
                prop_assert_eq!(handle.use_count(), shared.len());
                prop_assert_eq!(handle.weak_count(), weak.len());
            }
            for handle in &weak {
                prop_assert_eq!(handle.expired(), !alive);
                prop_assert_eq!(handle.use_count(), shared.len());
                prop_assert_eq!(handle.weak_count(), weak.len());
            }
            let block_needed = alive || !weak.is_empty();
            prop_assert_eq!(alloc.live.get(), if block_needed { 1 } else { 0 });
        }

        drop(shared);
        drop(weak);
        prop_assert_eq!(drops.get(), 1);
        prop_assert_eq!(alloc.live.get(), 0);
    }
}

// Projections and coercions share the counts of the whole pointee.
proptest! {
    #[test]
    fn prop_views_share_counts(views in 1usize..20, drop_owner_first in any::<bool>()) {
        let drops = Rc::new(Cell::new(0usize));
        let alloc = Tracking::default();
        let owner = create(false, 3, &drops, &alloc);

        let mut fields: Vec<SharedPtr<u32>> = (0..views)
            .map(|_| SharedPtr::map(owner.clone(), |t| &t.value))
            .collect();
        prop_assert_eq!(owner.use_count(), views + 1);
        prop_assert!(fields.iter().all(|f| SharedPtr::owner_eq(f, &owner)));

        let owner = if drop_owner_first {
            drop(owner);
            None
        } else {
            Some(owner)
        };
        while let Some(field) = fields.pop() {
            prop_assert_eq!(*field, 3);
            drop(field);
            let remaining = fields.len() + usize::from(owner.is_some());
            prop_assert_eq!(drops.get(), if remaining == 0 { 1 } else { 0 });
        }
        drop(owner);
        prop_assert_eq!(drops.get(), 1);
        prop_assert_eq!(alloc.live.get(), 0);
    }
}
