//! Per-worker tracing state. A context owns one worker's local work queue,
//! weak-reference scratch, statistics and a stable small-integer identity.
//! Contexts are pooled between cycles so their allocations amortize.

use crate::scheduler::queue::WorkBlockifier;
use crate::stats::WorkerStats;
use crate::util::constants::{MAX_WORKERS, OBJECT_LOOKAHEAD};
use crate::util::{Address, ObjectRef};
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Allocates the stable 0..MAX_WORKERS identities backing the per-worker
/// queues, page caches and slow callback queues.
struct WorkerIndexAllocator {
    used: AtomicU32,
}

impl WorkerIndexAllocator {
    const fn new() -> WorkerIndexAllocator {
        WorkerIndexAllocator {
            used: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> usize {
        loop {
            let used = self.used.load(Ordering::Relaxed);
            let free = (!used).trailing_zeros() as usize;
            assert!(
                free < MAX_WORKERS,
                "out of worker indices ({} concurrent contexts)",
                MAX_WORKERS
            );
            let claimed = used | (1 << free);
            if self
                .used
                .compare_exchange_weak(used, claimed, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return free;
            }
        }
    }

    fn free(&self, index: usize) {
        let bit = 1u32 << index;
        let old = self.used.fetch_and(!bit, Ordering::AcqRel);
        debug_assert!(old & bit != 0, "double free of worker index {}", index);
    }
}

static WORKER_INDICES: WorkerIndexAllocator = WorkerIndexAllocator::new();

/// A reference that kept a garbage-flagged object alive, with enough
/// attribution to report it.
#[derive(Clone, Copy, Debug)]
pub struct GarbageReference {
    pub object: ObjectRef,
    pub referencer: ObjectRef,
    pub member_name: &'static str,
}

/// A direct reference observed during tracing, retained for post-mortem
/// dumps when history is enabled.
#[cfg(feature = "history")]
#[derive(Clone, Copy, Debug)]
pub struct DirectReference {
    pub referencer: ObjectRef,
    pub object: ObjectRef,
    pub member_name: &'static str,
}

/// One tracing worker's state for a reachability pass.
pub struct WorkerContext {
    worker_index: usize,
    /// The worker's pending-to-trace queue, blockified into stealable pages.
    pub objects_to_serialize: WorkBlockifier,
    /// Seed objects, padded at the tail so prefetching ahead stays in
    /// bounds. `initial_len` is the live prefix.
    initial_objects: Vec<ObjectRef>,
    initial_len: usize,
    /// Seed native reference slots (addresses of `ObjectRef` slots outside
    /// managed objects).
    pub initial_native_references: Vec<Address>,
    /// Weak slots recorded during tracing, nulled after reachability if
    /// their pointee died.
    pub weak_references: Vec<Address>,
    /// References that kept garbage-flagged objects alive.
    pub garbage_references: Vec<GarbageReference>,
    #[cfg(feature = "history")]
    pub history: Vec<DirectReference>,
    pub stats: WorkerStats,
    /// The object whose members are being visited; attributed in callback
    /// paths where the member does not carry its own referencer.
    pub referencing_object: ObjectRef,
    pub(crate) coordinator: *const crate::scheduler::coordinator::WorkCoordinator,
}

// A context is owned by exactly one thread at a time; the coordinator hands
// it over through an atomic exchange.
unsafe impl Send for WorkerContext {}

impl WorkerContext {
    fn new() -> WorkerContext {
        WorkerContext {
            worker_index: WORKER_INDICES.allocate(),
            objects_to_serialize: WorkBlockifier::new(),
            initial_objects: Vec::new(),
            initial_len: 0,
            initial_native_references: Vec::new(),
            weak_references: Vec::new(),
            garbage_references: Vec::new(),
            #[cfg(feature = "history")]
            history: Vec::new(),
            stats: WorkerStats::default(),
            referencing_object: ObjectRef::NULL,
            coordinator: std::ptr::null(),
        }
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Seeds the context with unpadded objects, appending the lookahead pad.
    pub fn set_initial_objects_unpadded(&mut self, mut objects: Vec<ObjectRef>) {
        self.initial_len = objects.len();
        if let Some(&last) = objects.last() {
            objects.extend(std::iter::repeat(last).take(OBJECT_LOOKAHEAD));
        }
        self.initial_objects = objects;
    }

    /// Takes over another context's already-padded seed objects.
    pub fn set_initial_objects_prepadded(&mut self, objects: Vec<ObjectRef>, live_len: usize) {
        debug_assert!(objects.is_empty() || objects.len() >= live_len + OBJECT_LOOKAHEAD);
        self.initial_objects = objects;
        self.initial_len = live_len;
    }

    pub fn initial_objects(&self) -> &[ObjectRef] {
        &self.initial_objects[..self.initial_len]
    }

    /// The padded backing store, handed to thieves wholesale.
    pub fn take_initial_objects(&mut self) -> (Vec<ObjectRef>, usize) {
        let live = self.initial_len;
        self.initial_len = 0;
        (std::mem::take(&mut self.initial_objects), live)
    }

    pub fn reset_initial_objects(&mut self) {
        self.initial_objects.clear();
        self.initial_len = 0;
    }

    fn reclaim_worker_index(&mut self) {
        WORKER_INDICES.free(self.worker_index);
    }

    fn reallocate_worker_index(&mut self) {
        self.worker_index = WORKER_INDICES.allocate();
    }
}

struct ContextPoolInner {
    reusable: Vec<Box<WorkerContext>>,
    num_allocated: usize,
}

lazy_static! {
    static ref CONTEXT_POOL: Mutex<ContextPoolInner> = Mutex::new(ContextPoolInner {
        reusable: Vec::new(),
        num_allocated: 0,
    });
}

/// Scoped access to the process-wide context pool. Restricted to the thread
/// driving a collection; the scope object keeps the call sites honest about
/// where pool mutation happens.
pub struct ContextPoolScope;

impl ContextPoolScope {
    pub fn allocate_from_pool(&self) -> Box<WorkerContext> {
        let mut pool = CONTEXT_POOL.lock().unwrap();
        pool.num_allocated += 1;
        match pool.reusable.pop() {
            Some(mut context) => {
                context.reallocate_worker_index();
                context
            }
            None => Box::new(WorkerContext::new()),
        }
    }

    pub fn return_to_pool(&self, mut context: Box<WorkerContext>) {
        context.reclaim_worker_index();
        context.stats = WorkerStats::default();
        let mut pool = CONTEXT_POOL.lock().unwrap();
        debug_assert!(pool.num_allocated >= 1);
        pool.num_allocated -= 1;
        pool.reusable.push(context);
    }

    pub fn num_allocated(&self) -> usize {
        CONTEXT_POOL.lock().unwrap().num_allocated
    }

    /// Runs `f` over every pooled (free) context. The weak-reference and
    /// garbage-reference scratch of the last cycle lives in these.
    pub fn for_each_free<F: FnMut(&mut WorkerContext)>(&self, mut f: F) {
        let mut pool = CONTEXT_POOL.lock().unwrap();
        for context in pool.reusable.iter_mut() {
            f(context);
        }
    }

    /// Drops pooled contexts and their allocations after a full purge.
    pub fn cleanup(&self) {
        let mut pool = CONTEXT_POOL.lock().unwrap();
        for context in pool.reusable.iter() {
            assert!(
                context.weak_references.is_empty(),
                "cleaning up with active weak references"
            );
        }
        let freed = pool.reusable.len();
        pool.reusable.clear();
        log::debug!("freed {} pooled gc contexts", freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::serial_test;

    #[test]
    fn pool_reuses_contexts() {
        serial_test(|| {
            let pool = ContextPoolScope;
            let a = pool.allocate_from_pool();
            let a_ptr = &*a as *const WorkerContext as usize;
            pool.return_to_pool(a);
            let b = pool.allocate_from_pool();
            assert_eq!(&*b as *const WorkerContext as usize, a_ptr);
            pool.return_to_pool(b);
        })
    }

    #[test]
    fn worker_indices_are_unique_and_recycled() {
        serial_test(|| {
            let pool = ContextPoolScope;
            let a = pool.allocate_from_pool();
            let b = pool.allocate_from_pool();
            assert_ne!(a.worker_index(), b.worker_index());
            let a_index = a.worker_index();
            pool.return_to_pool(a);
            let c = pool.allocate_from_pool();
            assert_eq!(c.worker_index(), a_index);
            pool.return_to_pool(b);
            pool.return_to_pool(c);
        })
    }

    #[test]
    fn initial_objects_are_padded() {
        serial_test(|| {
            let pool = ContextPoolScope;
            let mut context = pool.allocate_from_pool();
            let v = 1u64;
            let obj = ObjectRef::from_ref(&v);
            context.set_initial_objects_unpadded(vec![obj, ObjectRef::NULL, obj]);
            assert_eq!(context.initial_objects().len(), 3);
            let (backing, live) = context.take_initial_objects();
            assert_eq!(live, 3);
            assert_eq!(backing.len(), 3 + OBJECT_LOOKAHEAD);
            assert_eq!(backing[backing.len() - 1], obj);
            pool.return_to_pool(context);
        })
    }
}
