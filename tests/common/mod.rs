//! A miniature managed-object universe backing the end-to-end tests: a
//! binding with one reference-bearing class, a lifecycle registry that
//! records every BeginDestroy/FinishDestroy/destructor call, and a `World`
//! helper for building object graphs.
//!
//! The binding's hooks are process-global, so every test takes the world
//! lock for its whole duration; worlds never overlap.

#![allow(dead_code)]

use lazy_static::lazy_static;
use memoffset::offset_of;
use scythe::object::layout::RefArray;
use scythe::object::schema::ReferenceCollector;
use scythe::{
    Address, Binding, ClassInfo, Collector, KeepFlags, ObjectIndex, ObjectRef, Options, RootSet,
    SchemaBuilder,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What happened to one mock object so far.
#[derive(Default, Clone)]
pub struct Lifecycle {
    pub begun: u32,
    pub finished: u32,
    pub destroyed: u32,
    pub freed: bool,
    /// Polls of is_ready_for_finish_destroy left before the object reports
    /// ready. Models teardown waiting on another subsystem's release.
    pub ready_countdown: u32,
    pub thread_safe_destruction: bool,
}

lazy_static! {
    static ref WORLD_LOCK: Mutex<()> = Mutex::new(());
    static ref REGISTRY: Mutex<HashMap<usize, Lifecycle>> = Mutex::new(HashMap::new());
    static ref NATIVE_ROOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static ref NODE_CLASS: ClassInfo = ClassInfo::new(
        "MockNode",
        SchemaBuilder::new(std::mem::size_of::<MockNode>())
            .add_script_reference("target", offset_of!(MockNode, target))
            .add_reference("strong", offset_of!(MockNode, strong))
            .add_weak_reference("weak", offset_of!(MockNode, weak))
            .add_reference_array("children", offset_of!(MockNode, children))
            .build(),
    );
    static ref ARO_CLASS: ClassInfo = ClassInfo::new(
        "MockAroNode",
        SchemaBuilder::new(std::mem::size_of::<MockNode>())
            .add_reference("strong", offset_of!(MockNode, strong))
            .add_callback("extra_refs", extra_refs_aro)
            .build(),
    );
    static ref SLOW_ARO_CLASS: ClassInfo = ClassInfo::new(
        "MockSlowAroNode",
        SchemaBuilder::new(std::mem::size_of::<MockNode>())
            .add_reference("strong", offset_of!(MockNode, strong))
            .add_slow_callback("extra_refs", 0, extra_refs_aro)
            .build(),
    );
}

/// The one managed type the tests trace. `target` is script-declared
/// (killable), `strong` is native (immutable), `weak` never keeps its
/// pointee alive, `children` is a dynamic reference array.
#[repr(C)]
pub struct MockNode {
    pub index: u32,
    pub class_tag: u32,
    pub target: ObjectRef,
    pub strong: ObjectRef,
    pub weak: ObjectRef,
    pub children: RefArray,
    /// Enumerated by the ARO class's callback, invisible to the schema.
    pub extra: Vec<ObjectRef>,
}

const CLASS_TAG_NODE: u32 = 0;
const CLASS_TAG_ARO: u32 = 1;
const CLASS_TAG_SLOW_ARO: u32 = 2;

impl MockNode {
    fn new(class_tag: u32) -> MockNode {
        MockNode {
            index: u32::MAX,
            class_tag,
            target: ObjectRef::NULL,
            strong: ObjectRef::NULL,
            weak: ObjectRef::NULL,
            children: RefArray::new(),
            extra: Vec::new(),
        }
    }
}

fn node_mut(object: ObjectRef) -> &'static mut MockNode {
    unsafe { &mut *object.to_address().to_mut_ptr::<MockNode>() }
}

fn extra_refs_aro(object: ObjectRef, collector: &mut dyn ReferenceCollector) {
    for extra in node_mut(object).extra.iter_mut() {
        collector.add_killable_reference(extra);
    }
}

pub struct MockVm;

impl Binding for MockVm {
    fn class_of(object: ObjectRef) -> &'static ClassInfo {
        match node_mut(object).class_tag {
            CLASS_TAG_NODE => &NODE_CLASS,
            CLASS_TAG_ARO => &ARO_CLASS,
            _ => &SLOW_ARO_CLASS,
        }
    }

    fn object_index(object: ObjectRef) -> ObjectIndex {
        ObjectIndex::new(node_mut(object).index)
    }

    fn set_object_index(object: ObjectRef, index: ObjectIndex) {
        node_mut(object).index = index.as_u32();
    }

    fn enumerate_roots(roots: &mut RootSet) {
        for slot in NATIVE_ROOTS.lock().unwrap().iter() {
            roots.add_native_reference_address(unsafe { Address::from_usize(*slot) });
        }
    }

    fn begin_destroy(object: ObjectRef) {
        let mut registry = lock(&REGISTRY);
        let record = registry.get_mut(&object.as_usize()).expect("unknown object");
        assert_eq!(record.begun, 0, "BeginDestroy routed twice");
        record.begun += 1;
    }

    fn is_ready_for_finish_destroy(object: ObjectRef) -> bool {
        let mut registry = lock(&REGISTRY);
        let record = registry.get_mut(&object.as_usize()).expect("unknown object");
        if record.ready_countdown > 0 {
            record.ready_countdown -= 1;
            false
        } else {
            true
        }
    }

    fn finish_destroy(object: ObjectRef) {
        let mut registry = lock(&REGISTRY);
        let record = registry.get_mut(&object.as_usize()).expect("unknown object");
        assert_eq!(record.begun, 1, "FinishDestroy before BeginDestroy");
        assert_eq!(record.finished, 0, "FinishDestroy routed twice");
        record.finished += 1;
    }

    fn is_destruction_thread_safe(object: ObjectRef) -> bool {
        lock(&REGISTRY)
            .get(&object.as_usize())
            .map(|record| record.thread_safe_destruction)
            .unwrap_or(false)
    }

    fn destroy(object: ObjectRef) {
        let mut registry = lock(&REGISTRY);
        let record = registry.get_mut(&object.as_usize()).expect("unknown object");
        assert_eq!(record.finished, 1, "destructor before FinishDestroy");
        assert_eq!(record.destroyed, 0, "object destroyed twice");
        record.destroyed += 1;
    }

    fn free_object(object: ObjectRef) {
        {
            let mut registry = lock(&REGISTRY);
            let record = registry.get_mut(&object.as_usize()).expect("unknown object");
            assert!(!record.freed, "object freed twice");
            record.freed = true;
        }
        drop(unsafe { Box::from_raw(object.to_address().to_mut_ptr::<MockNode>()) });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One test's universe. Holds the world lock for its lifetime.
pub struct World {
    pub collector: Arc<Collector<MockVm>>,
    /// Backing storage for native root slots; their addresses are
    /// registered with the binding.
    root_slots: Vec<Box<ObjectRef>>,
    _guard: MutexGuard<'static, ()>,
}

impl World {
    pub fn new() -> World {
        Self::with_options(default_options())
    }

    pub fn with_options(options: Options) -> World {
        let _ = env_logger::builder().is_test(true).try_init();
        let guard = WORLD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        lock(&REGISTRY).clear();
        lock(&NATIVE_ROOTS).clear();
        World {
            collector: Collector::new(options),
            root_slots: Vec::new(),
            _guard: guard,
        }
    }

    /// Allocates and registers a plain node.
    pub fn spawn(&self) -> ObjectIndex {
        self.spawn_tagged(CLASS_TAG_NODE)
    }

    /// Allocates and registers a node whose extra references are enumerated
    /// by a callback instead of the schema.
    pub fn spawn_aro(&self) -> ObjectIndex {
        self.spawn_tagged(CLASS_TAG_ARO)
    }

    /// Like `spawn_aro`, but the callback is registered as slow and runs
    /// from the batched per-worker queues. Call `register_slow_extra_refs`
    /// first.
    pub fn spawn_slow_aro(&self) -> ObjectIndex {
        self.spawn_tagged(CLASS_TAG_SLOW_ARO)
    }

    /// Registers the shared extra-refs callback as a slow callback. The
    /// slow-ARO class schema assumes registration index 0.
    pub fn register_slow_extra_refs(&self, flags: scythe::AroFlags) {
        let index = self.collector.register_slow_aro(extra_refs_aro, flags);
        assert_eq!(index, 0);
    }

    fn spawn_tagged(&self, class_tag: u32) -> ObjectIndex {
        let node = Box::leak(Box::new(MockNode::new(class_tag)));
        let object = ObjectRef::from_ref(node);
        lock(&REGISTRY).insert(object.as_usize(), Lifecycle::default());
        self.collector.register_object(object)
    }

    pub fn object(&self, index: ObjectIndex) -> ObjectRef {
        self.collector.table().index_to_item(index).object()
    }

    pub fn node(&self, index: ObjectIndex) -> &'static mut MockNode {
        node_mut(self.object(index))
    }

    pub fn is_alive(&self, index: ObjectIndex) -> bool {
        !self.collector.table().index_to_item(index).object().is_null()
    }

    pub fn lifecycle_of(&self, object: ObjectRef) -> Lifecycle {
        lock(&REGISTRY)
            .get(&object.as_usize())
            .cloned()
            .expect("unknown object")
    }

    pub fn set_ready_countdown(&self, index: ObjectIndex, polls: u32) {
        let object = self.object(index);
        lock(&REGISTRY)
            .get_mut(&object.as_usize())
            .expect("unknown object")
            .ready_countdown = polls;
    }

    pub fn set_thread_safe_destruction(&self, index: ObjectIndex, thread_safe: bool) {
        let object = self.object(index);
        lock(&REGISTRY)
            .get_mut(&object.as_usize())
            .expect("unknown object")
            .thread_safe_destruction = thread_safe;
    }

    /// Total objects fully destroyed and freed so far.
    pub fn num_freed(&self) -> usize {
        lock(&REGISTRY).values().filter(|record| record.freed).count()
    }

    /// Asserts a destroyed object went through the whole pipeline once.
    pub fn assert_destroyed_once(&self, object: ObjectRef) {
        let record = self.lifecycle_of(object);
        assert_eq!(record.begun, 1);
        assert_eq!(record.finished, 1);
        assert_eq!(record.destroyed, 1);
        assert!(record.freed);
    }

    pub fn assert_never_destroyed(&self, index: ObjectIndex) {
        assert!(self.is_alive(index));
        let record = self.lifecycle_of(self.object(index));
        assert_eq!(record.begun, 0);
        assert_eq!(record.finished, 0);
        assert_eq!(record.destroyed, 0);
        assert!(!record.freed);
    }

    /// Links `from.target` (killable) at `to`.
    pub fn link(&self, from: ObjectIndex, to: ObjectIndex) {
        self.node(from).target = self.object(to);
    }

    /// Links `from.strong` (immutable) at `to`.
    pub fn link_strong(&self, from: ObjectIndex, to: ObjectIndex) {
        self.node(from).strong = self.object(to);
    }

    pub fn link_weak(&self, from: ObjectIndex, to: ObjectIndex) {
        self.node(from).weak = self.object(to);
    }

    pub fn link_child(&self, from: ObjectIndex, to: ObjectIndex) {
        let child = self.object(to);
        self.node(from).children.push(child);
    }

    /// Registers a native reference slot pointing at the object; the slot
    /// itself is a reachability root.
    pub fn add_native_root(&mut self, index: ObjectIndex) {
        let slot = Box::new(self.object(index));
        lock(&NATIVE_ROOTS).push(&*slot as *const ObjectRef as usize);
        self.root_slots.push(slot);
    }

    pub fn collect(&self, full_purge: bool) {
        self.collector.collect_garbage(KeepFlags::NONE, full_purge);
    }

    /// Drives the incremental purge to completion with the given per-tick
    /// budget, returning how many ticks it took.
    pub fn drain_incremental(&self, budget: std::time::Duration) -> usize {
        let mut ticks = 0;
        while self.collector.is_incremental_purge_pending()
            || self.collector.is_incremental_unhash_pending()
        {
            self.collector.incremental_purge_garbage(true, budget);
            ticks += 1;
            assert!(ticks < 1_000_000, "incremental purge failed to converge");
        }
        ticks
    }
}

impl Drop for World {
    fn drop(&mut self) {
        // A failed assertion already poisoned the universe; tearing it down
        // would only bury the original panic.
        if !std::thread::panicking() {
            self.collector.shutdown();
        }
        lock(&NATIVE_ROOTS).clear();
    }
}

pub fn default_options() -> Options {
    let mut options = Options::new_no_env_vars();
    // Keep worker usage modest so concurrently running unit tests in the
    // library crate cannot exhaust the shared worker-index space.
    options.threads = 2;
    options
}

pub fn serial_options() -> Options {
    let mut options = Options::new_no_env_vars();
    options.allow_parallel = false;
    options.multithreaded_destruction = false;
    options.threads = 1;
    options
}
