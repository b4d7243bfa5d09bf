use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use shareptr::{
    AllocError, Allocator, BadWeakPtr, EnableSharedFromThis, Global, SharedFromThis, SharedPtr, WeakPtr,
};

/// Counts live blocks and every allocate/deallocate call.
#[derive(Clone, Default)]
struct Counting {
    live: Rc<Cell<isize>>,
    allocations: Rc<Cell<usize>>,
}

unsafe impl Allocator for Counting {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.live.set(self.live.get() + 1);
        self.allocations.set(self.allocations.get() + 1);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.set(self.live.get() - 1);
        unsafe { Global.deallocate(ptr, layout) }
    }
}

/// Refuses every allocation.
struct Exhausted;

unsafe impl Allocator for Exhausted {
    fn allocate(&self, _layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        unreachable!("nothing was allocated")
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Widget {
    name: String,
    size: u32,
    drops: Rc<Cell<usize>>,
}

impl Widget {
    fn new(name: &str, size: u32, drops: &Rc<Cell<usize>>) -> Self {
        Self {
            name: name.to_owned(),
            size,
            drops: drops.clone(),
        }
    }
}

impl Drop for Widget {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn widget_scenario() {
    init_logging();
    let drops = Rc::new(Cell::new(0));
    let alloc = Counting::default();

    let h1 = SharedPtr::new_in(Widget::new("w", 3, &drops), alloc.clone());
    assert_eq!(h1.use_count(), 1);
    assert_eq!(h1.name, "w");
    assert_eq!(h1.size, 3);

    let h2 = h1.clone();
    assert_eq!(h1.use_count(), 2);
    assert_eq!(h2.use_count(), 2);

    let w = SharedPtr::downgrade(&h1);
    assert!(!w.expired());
    assert_eq!(w.use_count(), 2);

    drop(h1);
    assert!(!w.expired());
    drop(h2);
    assert!(w.expired());
    assert!(w.lock().is_empty());
    assert_eq!(drops.get(), 1);

    // The block outlives the pointee while `w` exists.
    assert_eq!(alloc.live.get(), 1);
    drop(w);
    assert_eq!(alloc.live.get(), 0);
    assert_eq!(alloc.allocations.get(), 1);
}

#[test]
fn external_deleter_runs_once_with_weak_outstanding() {
    init_logging();
    let calls = Rc::new(Cell::new(0));
    let alloc = Counting::default();
    let counter = calls.clone();
    let ptr = NonNull::from(Box::leak(Box::new(17u32)));

    let shared = unsafe {
        SharedPtr::from_raw_with_in(
            ptr,
            move |p: NonNull<u32>| {
                counter.set(counter.get() + 1);
                drop(Box::from_raw(p.as_ptr()));
            },
            alloc.clone(),
        )
    };
    let copies: Vec<_> = (0..3).map(|_| shared.clone()).collect();
    let weaks: Vec<_> = copies.iter().map(SharedPtr::downgrade).collect();

    drop(shared);
    drop(copies);
    assert_eq!(calls.get(), 1);
    assert!(weaks.iter().all(WeakPtr::expired));
    assert_eq!(alloc.live.get(), 1);

    drop(weaks);
    assert_eq!(calls.get(), 1);
    assert_eq!(alloc.live.get(), 0);
}

#[test]
fn no_op_deleter_for_stack_object() {
    let value = Cell::new(10);
    {
        let shared = unsafe { SharedPtr::from_raw_with(NonNull::from(&value), |_| {}) };
        shared.set(11);
        let weak = SharedPtr::downgrade(&shared);
        assert_eq!(Cell::get(&weak.lock()), 11);
    }
    assert_eq!(value.get(), 11);
}

#[test]
fn failed_embedded_allocation_has_no_side_effects() {
    let drops = Rc::new(Cell::new(0));
    let result = SharedPtr::try_new_in(Widget::new("never", 0, &drops), Exhausted);
    assert!(matches!(result, Err(AllocError)));
    // The value was handed over and is dropped with the error.
    assert_eq!(drops.get(), 1);

    let ran = Cell::new(false);
    let result = SharedPtr::try_new_with_in(|| ran.set(true), Exhausted);
    assert!(result.is_err());
    assert!(!ran.get());
}

#[test]
fn failed_external_allocation_deletes_pointee() {
    let deleted = Rc::new(Cell::new(0));
    let counter = deleted.clone();
    let ptr = NonNull::from(Box::leak(Box::new(5u8)));
    let result = unsafe {
        SharedPtr::try_from_raw_with_in(
            ptr,
            move |p: NonNull<u8>| {
                counter.set(counter.get() + 1);
                drop(Box::from_raw(p.as_ptr()));
            },
            Exhausted,
        )
    };
    assert!(result.is_err());
    assert_eq!(deleted.get(), 1);
}

#[test]
fn moving_never_changes_counts() {
    let mut first = SharedPtr::new(1);
    let weak = SharedPtr::downgrade(&first);
    let keep = first.clone();

    let moved = first.take();
    assert!(first.is_empty());
    assert_eq!(first.use_count(), 0);
    assert_eq!(moved.use_count(), 2);
    assert_eq!(keep.weak_count(), 1);

    let rust_move = moved;
    assert_eq!(rust_move.use_count(), 2);
    assert_eq!(weak.use_count(), 2);
}

#[test]
fn use_count_matches_live_copies() {
    let shared = SharedPtr::new("counted");
    for n in 1..=16 {
        let copies: Vec<_> = (1..n).map(|_| shared.clone()).collect();
        assert_eq!(shared.use_count(), n);
        drop(copies);
    }
}

/// A tree with weak parent links is freed completely once the root goes.
#[test]
fn parent_links_break_cycles() {
    struct Node {
        parent: RefCell<WeakPtr<Node>>,
        children: RefCell<Vec<SharedPtr<Node>>>,
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    let drops = Rc::new(Cell::new(0));
    let alloc = Counting::default();
    let node = |alloc: &Counting| {
        SharedPtr::new_in(
            Node {
                parent: RefCell::new(WeakPtr::new()),
                children: RefCell::new(Vec::new()),
                drops: drops.clone(),
            },
            alloc.clone(),
        )
    };

    let root = node(&alloc);
    for _ in 0..3 {
        let child = node(&alloc);
        *child.parent.borrow_mut() = SharedPtr::downgrade(&root);
        root.children.borrow_mut().push(child);
    }
    let leaf = root.children.borrow()[0].clone();
    assert!(leaf.parent.borrow().is(&root));
    assert_eq!(root.weak_count(), 3);

    drop(root);
    assert_eq!(drops.get(), 3);
    assert!(leaf.parent.borrow().expired());
    drop(leaf);
    assert_eq!(drops.get(), 4);
    assert_eq!(alloc.live.get(), 0);
}

#[derive(Debug)]
struct Session {
    this: EnableSharedFromThis<Session>,
    id: u64,
}

impl SharedFromThis for Session {
    fn this_slot(&self) -> &EnableSharedFromThis<Self> {
        &self.this
    }
}

impl Session {
    fn handle(&self) -> Result<SharedPtr<Session>, BadWeakPtr> {
        self.shared_from_this()
    }
}

#[test]
fn shared_from_this_scenario() {
    init_logging();
    let loose = Session {
        this: EnableSharedFromThis::new(),
        id: 1,
    };
    assert_eq!(loose.handle().unwrap_err(), BadWeakPtr::Unbound);

    let alloc = Counting::default();
    let owned = SharedPtr::new_aware_in(loose, alloc.clone());
    let before = owned.use_count();
    let again = owned.handle().unwrap();
    assert_eq!(again.use_count(), before + 1);
    assert_eq!(SharedPtr::as_ptr(&again), SharedPtr::as_ptr(&owned));
    assert_eq!(again.id, 1);

    drop(owned);
    drop(again);
    assert_eq!(alloc.live.get(), 0);
}

#[test]
fn shared_from_this_on_external_block() {
    let session = SharedPtr::from_box_aware(Box::new(Session {
        this: EnableSharedFromThis::new(),
        id: 2,
    }));
    let weak = session.weak_from_this();
    let again = session.handle().unwrap();
    assert!(weak.is(&again));
    assert_eq!(session.use_count(), 2);
}

#[test]
fn try_new_aware_in_fails_cleanly() {
    let result = SharedPtr::try_new_aware_in(
        Session {
            this: EnableSharedFromThis::new(),
            id: 3,
        },
        Exhausted,
    );
    assert!(result.is_err());
}
