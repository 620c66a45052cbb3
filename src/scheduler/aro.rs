//! Slow "additional reference" callbacks and the lock-free queues that
//! batch their calls.
//!
//! A class whose references cannot be described by a schema registers a
//! callback. Cheap callbacks run synchronously during tracing; callbacks
//! registered here as slow are queued per worker and drained in batches,
//! with batch sizes picked by cost tier. The queues are bounded SPMC LIFOs
//! over a shared store of page-sized blocks:
//!
//! * the producer steals in the same order as consumers, simpler but less
//!   efficient;
//! * popping is batched, partly to reduce producer/consumer tail contention;
//! * the producer drains its own queue before shutdown, so stealing may fail;
//! * queues and blocks outlive producers and consumers, and indices only
//!   ever increase, which sidesteps the ABA problem.

use crate::object::schema::AroFn;
use crate::util::constants::{MAX_WORKERS, PAGE_SIZE};
use crate::util::pages::PageAllocator;
use crate::util::{Address, ObjectRef};
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Object slots per block page.
const BLOCK_WORDS: usize = PAGE_SIZE / std::mem::size_of::<ObjectRef>();
/// Usable slots; the first word holds the link to the next block.
const BLOCK_CAPACITY: usize = BLOCK_WORDS - 1;
/// Pages the shared store may hold. One head block per queue must always be
/// allocatable during setup: MAX_WORKERS * MAX_SLOW_AROS <= MAX_BLOCKS.
const MAX_BLOCKS: usize = 256;

/// Registration cap. Memory consumption and work-stealing time increase
/// linearly with the count.
pub const MAX_SLOW_AROS: usize = 8;

/// Pop batch sizes by cost tier.
const POP_MANY: usize = 64;
const POP_FEW: usize = 4;

#[repr(C)]
struct AroBlock {
    first_index_in_next_block: UnsafeCell<u32>,
    objects: [UnsafeCell<ObjectRef>; BLOCK_CAPACITY],
}

// Slot accesses are synchronized through the queue head (release store /
// acquire fence); distinct slots never alias.
unsafe impl Sync for AroBlock {}

/// Scheduling tiers for a slow callback.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AroFlags(u32);

impl AroFlags {
    pub const NONE: AroFlags = AroFlags(0);
    /// Uneven cost across callers: drained from the calling worker's own
    /// queue in big batches between objects.
    pub const UNBALANCED: AroFlags = AroFlags(1 << 0);
    /// Expensive per call: drained in small batches to avoid latency spikes.
    pub const EXTRA_SLOW: AroFlags = AroFlags(1 << 1);

    pub const fn contains(self, other: AroFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: AroFlags) -> AroFlags {
        AroFlags(self.0 | other.0)
    }
}

/// Shared store of blocks, addressed by ever-increasing u32 indices.
/// `index / BLOCK_WORDS` selects the block, `index % BLOCK_WORDS` the slot.
struct AroBlockStore {
    num_blocks: AtomicU32,
    full: AtomicBool,
    blocks: Vec<AtomicPtr<AroBlock>>,
}

impl AroBlockStore {
    fn new() -> AroBlockStore {
        let mut blocks = Vec::with_capacity(MAX_BLOCKS);
        blocks.resize_with(MAX_BLOCKS, || AtomicPtr::new(std::ptr::null_mut()));
        AroBlockStore {
            num_blocks: AtomicU32::new(0),
            full: AtomicBool::new(false),
            blocks,
        }
    }

    /// Allocates a block from the scratch pages. None when the store is
    /// exhausted, which callers recover from by dispatching synchronously.
    fn allocate_block(
        &self,
        pages: &PageAllocator,
        worker_index: usize,
    ) -> Option<(*mut AroBlock, u32)> {
        const _: () = assert!(std::mem::size_of::<AroBlock>() == PAGE_SIZE);

        if self.full.load(Ordering::Relaxed) {
            return None;
        }

        let block_index = self.num_blocks.fetch_add(1, Ordering::AcqRel);
        if block_index as usize >= MAX_BLOCKS {
            self.full.store(true, Ordering::Relaxed);
            self.num_blocks.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        let page = pages.allocate_page(worker_index);
        let block = page.to_mut_ptr::<AroBlock>();
        unsafe { *(*block).first_index_in_next_block.get() = u32::MAX };
        let prev = self.blocks[block_index as usize].swap(block, Ordering::Release);
        debug_assert!(prev.is_null());
        Some((block, block_index * BLOCK_WORDS as u32))
    }

    fn block(&self, index: u32) -> &AroBlock {
        let block_index = index as usize / BLOCK_WORDS;
        debug_assert!(block_index < MAX_BLOCKS);
        let ptr = self.blocks[block_index].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    fn first_index_in_next_block(&self, index: u32) -> u32 {
        let next = unsafe { *self.block(index).first_index_in_next_block.get() };
        debug_assert_eq!(next as usize % BLOCK_WORDS, 0);
        debug_assert!((next as usize / BLOCK_WORDS) < MAX_BLOCKS);
        next
    }

    /// Copies `num` objects starting at `index` into `out`. The range never
    /// crosses a block boundary.
    fn copy_out(&self, index: u32, num: usize, out: &mut [ObjectRef]) {
        debug_assert!(index as usize % BLOCK_WORDS + num <= BLOCK_CAPACITY);
        let block = self.block(index);
        let first = index as usize % BLOCK_WORDS;
        for i in 0..num {
            out[i] = unsafe { *block.objects[first + i].get() };
        }
    }

    fn return_all_blocks(&self, pages: &PageAllocator) {
        let num = self.num_blocks.load(Ordering::Acquire) as usize;
        debug_assert!(num <= MAX_BLOCKS);
        for slot in &self.blocks[..num] {
            let block = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            debug_assert!(!block.is_null());
            pages.return_shared_page(Address::from_mut_ptr(block));
        }
        self.num_blocks.store(0, Ordering::Release);
        self.full.store(false, Ordering::Relaxed);
    }
}

/// One worker's pending calls for one slow callback.
struct AroQueue {
    head: CachePadded<AtomicU32>,
    /// Producer-only current block.
    head_block: UnsafeCell<*mut AroBlock>,
    worker_index: usize,
    tail: CachePadded<AtomicU32>,
}

unsafe impl Send for AroQueue {}
unsafe impl Sync for AroQueue {}

impl AroQueue {
    fn new(store: &AroBlockStore, pages: &PageAllocator, worker_index: usize) -> AroQueue {
        let (block, start) = store.allocate_block(pages, worker_index).unwrap_or_else(|| {
            panic!(
                "one head block per worker queue must exist during setup; \
                 the assumption MAX_WORKERS * slow callbacks <= {} failed",
                MAX_BLOCKS
            )
        });
        AroQueue {
            head: CachePadded::new(AtomicU32::new(start)),
            head_block: UnsafeCell::new(block),
            worker_index,
            tail: CachePadded::new(AtomicU32::new(start)),
        }
    }

    fn check_flushed(&self) {
        assert_eq!(
            self.head.load(Ordering::Relaxed),
            self.tail.load(Ordering::Relaxed),
            "failed to flush slow callback queue"
        );
    }

    /// Called by the single producer thread. Fails when the block store is
    /// exhausted; the caller then dispatches synchronously.
    fn try_push(&self, store: &AroBlockStore, pages: &PageAllocator, object: ObjectRef) -> bool {
        let mut head = self.head.load(Ordering::Relaxed);
        let slot = head as usize % BLOCK_WORDS;
        debug_assert!(slot < BLOCK_CAPACITY);
        unsafe {
            let block = *self.head_block.get();
            *(*block).objects[slot].get() = object;
        }
        head += 1;

        // The link in the old block must be written before the head store
        // publishes it.
        if head as usize % BLOCK_WORDS == BLOCK_CAPACITY {
            let Some((new_block, new_start)) = store.allocate_block(pages, self.worker_index)
            else {
                // Head does not move, so the slot written above is never read.
                return false;
            };
            unsafe {
                let old_block = *self.head_block.get();
                *(*old_block).first_index_in_next_block.get() = new_start;
                *self.head_block.get() = new_block;
            }
            head = new_start;
        }

        self.head.store(head, Ordering::Release);
        true
    }

    /// Called by the single producer thread; no fence needed.
    fn pop(&self, store: &AroBlockStore, out: &mut [ObjectRef], num_wanted: usize) -> usize {
        self.pop_impl::<false>(store, out, num_wanted)
    }

    /// Called by work-stealing threads; an acquire fence pairs with the
    /// producer's release head store to synchronize the slot writes.
    fn steal(&self, store: &AroBlockStore, out: &mut [ObjectRef], num_wanted: usize) -> usize {
        self.pop_impl::<true>(store, out, num_wanted)
    }

    fn pop_impl<const ACQUIRE_FENCE: bool>(
        &self,
        store: &AroBlockStore,
        out: &mut [ObjectRef],
        num_wanted: usize,
    ) -> usize {
        debug_assert!(num_wanted < BLOCK_CAPACITY);
        debug_assert!(out.len() >= num_wanted);

        loop {
            let head_now = self.head.load(Ordering::Relaxed);
            let tail_now = self.tail.load(Ordering::Relaxed);

            if tail_now >= head_now {
                return 0;
            }

            // Can only pop up to the end of the tail block.
            let page_index_mask = !(BLOCK_WORDS as u32 - 1);
            let last_in_tail_block = (tail_now & page_index_mask) + BLOCK_CAPACITY as u32 - 1;
            let wanted_tail = head_now.min(tail_now + num_wanted as u32);

            if ACQUIRE_FENCE {
                // Synchronizes the producer's non-atomic slot stores seen
                // through the relaxed head load above.
                fence(Ordering::Acquire);
            }

            if wanted_tail <= last_in_tail_block {
                if self
                    .tail
                    .compare_exchange_weak(tail_now, wanted_tail, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let num = (wanted_tail - tail_now) as usize;
                    store.copy_out(tail_now, num, out);
                    return num;
                }
            } else {
                let next = store.first_index_in_next_block(tail_now);
                if self
                    .tail
                    .compare_exchange_weak(tail_now, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let num = BLOCK_CAPACITY - tail_now as usize % BLOCK_WORDS;
                    store.copy_out(tail_now, num, out);
                    return num;
                }
            }
        }
    }
}

struct AroEntry {
    callback: AroFn,
    flags: AroFlags,
}

/// Registry of slow callbacks plus their per-worker queues for the current
/// cycle. Registration happens before the first cycle; queue setup and
/// teardown bracket each parallel reachability pass.
pub struct SlowAroManager {
    aros: spin::RwLock<Vec<AroEntry>>,
    queues: spin::RwLock<Vec<AroQueue>>,
    store: AroBlockStore,
}

impl SlowAroManager {
    pub fn new() -> SlowAroManager {
        SlowAroManager {
            aros: spin::RwLock::new(Vec::new()),
            queues: spin::RwLock::new(Vec::new()),
            store: AroBlockStore::new(),
        }
    }

    /// Registers a callback as slow and returns its index for
    /// `SchemaBuilder::add_slow_callback`.
    pub fn register(&self, callback: AroFn, flags: AroFlags) -> u32 {
        let mut aros = self.aros.write();
        assert!(
            !aros.iter().any(|entry| entry.callback as usize == callback as usize),
            "slow callback registered twice"
        );
        assert!(
            aros.len() < MAX_SLOW_AROS,
            "don't register this many slow callbacks; memory consumption and \
             work-stealing time increase linearly"
        );
        assert!(
            self.queues.read().is_empty(),
            "slow callbacks cannot be registered during a collection cycle"
        );
        aros.push(AroEntry { callback, flags });
        (aros.len() - 1) as u32
    }

    pub fn find(&self, callback: AroFn) -> Option<u32> {
        self.aros
            .read()
            .iter()
            .position(|entry| entry.callback as usize == callback as usize)
            .map(|index| index as u32)
    }

    pub fn num_aros(&self) -> usize {
        self.aros.read().len()
    }

    pub fn call_sync(
        &self,
        index: u32,
        object: ObjectRef,
        collector: &mut dyn crate::object::schema::ReferenceCollector,
    ) {
        let callback = self.aros.read()[index as usize].callback;
        callback(object, collector);
    }

    /// Creates one queue per (callback, worker) pair. Queues are sized for
    /// MAX_WORKERS so any live worker index can enqueue.
    pub fn setup_worker_queues(&self, pages: &PageAllocator) {
        let aros = self.aros.read();
        let mut queues = self.queues.write();
        assert!(queues.is_empty(), "worker queues already set up");
        queues.reserve(aros.len() * MAX_WORKERS);
        for _aro in 0..aros.len() {
            for worker in 0..MAX_WORKERS {
                queues.push(AroQueue::new(&self.store, pages, worker));
            }
        }
    }

    pub fn reset_worker_queues(&self, pages: &PageAllocator) {
        let mut queues = self.queues.write();
        for queue in queues.iter() {
            queue.check_flushed();
        }
        queues.clear();
        self.store.return_all_blocks(pages);
    }

    /// Queues a call on the calling worker's queue. Fails when the block
    /// store is exhausted; the caller falls back to a synchronous call.
    pub fn try_queue_call(&self, index: u32, worker_index: usize, pages: &PageAllocator, object: ObjectRef) -> bool {
        let queues = self.queues.read();
        if queues.is_empty() {
            return false;
        }
        queues[index as usize * MAX_WORKERS + worker_index].try_push(&self.store, pages, object)
    }

    /// Drains the calling worker's own queues for unbalanced callbacks in
    /// big batches. Run between objects so one expensive caller cannot
    /// monopolize the stealable queues.
    pub fn process_unbalanced_calls<F>(&self, worker_index: usize, mut call: F)
    where
        F: FnMut(AroFn, ObjectRef),
    {
        let aros = self.aros.read();
        let queues = self.queues.read();
        if queues.is_empty() {
            return;
        }
        let mut batch = [ObjectRef::NULL; POP_MANY];
        for (index, entry) in aros.iter().enumerate() {
            if !entry.flags.contains(AroFlags::UNBALANCED) {
                continue;
            }
            let queue = &queues[index * MAX_WORKERS + worker_index];
            loop {
                let num = queue.pop(&self.store, &mut batch, POP_MANY);
                if num == 0 {
                    break;
                }
                for &object in &batch[..num] {
                    call(entry.callback, object);
                }
            }
        }
    }

    /// Drains queues for one callback type at a time, own queue first and
    /// then stealing from other workers. Workers start at an offset keyed to
    /// their index so the slowest callback type is reached sooner and
    /// stealing contention spreads out. Returns whether any calls were made.
    pub fn process_all_queues<F>(&self, worker_index: usize, mut call: F) -> bool
    where
        F: FnMut(AroFn, ObjectRef),
    {
        let aros = self.aros.read();
        let queues = self.queues.read();
        let num_aros = aros.len();
        if num_aros == 0 || queues.is_empty() {
            return false;
        }

        let mut num_calls: usize = 0;
        let mut stop = false;
        let stop_time = Instant::now() + Duration::from_micros(100);

        let first = worker_index % num_aros;
        for offset in 0..num_aros {
            if stop {
                break;
            }
            let index = (first + offset) % num_aros;
            let entry = &aros[index];
            let batch_size = if entry.flags.contains(AroFlags::EXTRA_SLOW) {
                POP_FEW
            } else {
                POP_MANY
            };
            stop = self.process_queues_for(
                &queues[index * MAX_WORKERS..(index + 1) * MAX_WORKERS],
                worker_index,
                entry.callback,
                batch_size,
                &mut num_calls,
                &mut call,
            );

            // Don't move on to the next callback type after doing work that
            // already took a considerable amount of time.
            stop = stop || (num_calls > 0 && Instant::now() > stop_time);
        }

        num_calls > 0
    }

    /// Own queue first (plain pop), then the other workers' queues (steal).
    /// Stops once the batch's call budget is consumed.
    fn process_queues_for<F>(
        &self,
        queues: &[AroQueue],
        worker_index: usize,
        callback: AroFn,
        call_limit: usize,
        num_calls: &mut usize,
        call: &mut F,
    ) -> bool
    where
        F: FnMut(AroFn, ObjectRef),
    {
        let mut batch = [ObjectRef::NULL; POP_MANY];

        let mut run = |queue: &AroQueue, is_own: bool, num_calls: &mut usize, call: &mut F| {
            loop {
                let num = if is_own {
                    queue.pop(&self.store, &mut batch, call_limit.min(POP_MANY))
                } else {
                    queue.steal(&self.store, &mut batch, call_limit.min(POP_MANY))
                };
                if num == 0 {
                    return false;
                }
                for &object in &batch[..num] {
                    call(callback, object);
                }
                *num_calls += num;
                if *num_calls >= call_limit {
                    return true;
                }
            }
        };

        if run(&queues[worker_index], true, num_calls, call) {
            return true;
        }
        for queue in queues[worker_index + 1..].iter().chain(&queues[..worker_index]) {
            if run(queue, false, num_calls, call) {
                return true;
            }
        }
        false
    }
}

impl Default for SlowAroManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::schema::ReferenceCollector;

    fn aro_a(_object: ObjectRef, _collector: &mut dyn ReferenceCollector) {}
    fn aro_b(_object: ObjectRef, _collector: &mut dyn ReferenceCollector) {}

    fn obj(tag: usize) -> ObjectRef {
        ObjectRef::from_ptr((0x1000 + tag * 8) as *const u8)
    }

    #[test]
    fn registration_and_lookup() {
        let manager = SlowAroManager::new();
        let a = manager.register(aro_a, AroFlags::NONE);
        let b = manager.register(aro_b, AroFlags::EXTRA_SLOW);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(manager.find(aro_a), Some(0));
        assert_eq!(manager.find(aro_b), Some(1));
        assert_eq!(manager.num_aros(), 2);
    }

    #[test]
    fn queue_roundtrip_across_blocks() {
        let pages = PageAllocator::new();
        let manager = SlowAroManager::new();
        manager.register(aro_a, AroFlags::NONE);
        manager.setup_worker_queues(&pages);

        // More than one block's worth of calls forces block chaining.
        let total = BLOCK_CAPACITY + 100;
        for i in 0..total {
            assert!(manager.try_queue_call(0, 2, &pages, obj(i)));
        }

        let mut seen = Vec::new();
        while manager.process_all_queues(2, |_, object| seen.push(object)) {}
        assert_eq!(seen.len(), total);
        for (i, object) in seen.iter().enumerate() {
            assert_eq!(*object, obj(i));
        }

        manager.reset_worker_queues(&pages);
    }

    #[test]
    fn other_workers_steal_queued_calls() {
        let pages = PageAllocator::new();
        let manager = SlowAroManager::new();
        manager.register(aro_a, AroFlags::NONE);
        manager.setup_worker_queues(&pages);

        for i in 0..10 {
            assert!(manager.try_queue_call(0, 1, &pages, obj(i)));
        }

        let mut stolen = Vec::new();
        while manager.process_all_queues(4, |_, object| stolen.push(object)) {}
        assert_eq!(stolen.len(), 10);

        manager.reset_worker_queues(&pages);
    }

    #[test]
    fn unbalanced_drains_only_own_queue() {
        let pages = PageAllocator::new();
        let manager = SlowAroManager::new();
        manager.register(aro_a, AroFlags::UNBALANCED);
        manager.setup_worker_queues(&pages);

        assert!(manager.try_queue_call(0, 3, &pages, obj(1)));
        assert!(manager.try_queue_call(0, 5, &pages, obj(2)));

        let mut own = Vec::new();
        manager.process_unbalanced_calls(3, |_, object| own.push(object));
        assert_eq!(own, vec![obj(1)]);

        // Worker 5's call is still queued for someone to drain.
        let mut rest = Vec::new();
        while manager.process_all_queues(5, |_, object| rest.push(object)) {}
        assert_eq!(rest, vec![obj(2)]);

        manager.reset_worker_queues(&pages);
    }
}
