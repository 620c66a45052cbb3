//! Work blocks and the work-stealing queues that move them between tracing
//! workers. The owner pushes and pops LIFO for locality; thieves take the
//! oldest blocks FIFO from the other end. A block is a full page of pending
//! object references plus a lookahead pad so the batcher can prefetch a
//! fixed distance ahead without bounds checks.

use crate::util::constants::{MAX_WORKERS, OBJECT_LOOKAHEAD, PAGE_SIZE};
use crate::util::pages::PageAllocator;
use crate::util::{Address, ObjectRef};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Slots in one block, header excluded.
pub const BLOCK_SLOTS: usize = (PAGE_SIZE - std::mem::size_of::<usize>()) / std::mem::size_of::<ObjectRef>();
/// Objects a block carries; the rest is the prefetch pad.
pub const BLOCK_CAPACITY: usize = BLOCK_SLOTS - OBJECT_LOOKAHEAD;

/// A page-sized batch of pending-to-trace objects. `previous` threads full
/// blocks into the owner's private list; the pad after the last object is
/// filled with an already-visited element so prefetching past the end reads
/// valid memory.
#[repr(C)]
pub struct WorkBlock {
    previous: *mut WorkBlock,
    objects: [ObjectRef; BLOCK_SLOTS],
}

impl WorkBlock {
    pub fn objects(&self, num: usize) -> &[ObjectRef] {
        debug_assert!(num <= BLOCK_CAPACITY);
        &self.objects[..num]
    }

    /// Full slot array including the prefetch pad.
    pub fn padded(&self) -> &[ObjectRef; BLOCK_SLOTS] {
        &self.objects
    }
}

/// Fills the pad area after `num` live objects with the last live element.
fn pad_objects(objects: &mut [ObjectRef; BLOCK_SLOTS], num: usize) {
    debug_assert!(num > 0);
    let last = objects[num - 1];
    for slot in objects[num..].iter_mut() {
        *slot = last;
    }
}

const FREE_SLOT: u64 = 0;
const TAKEN_SLOT: u64 = 1;

/// Bounded single-producer multi-consumer queue of work blocks.
///
/// The single producer owns `head` outright (its loads and stores are
/// relaxed); thieves race on `tail`. A thief claims a slot by CAS-ing its
/// pointer to the TAKEN sentinel, confirms the tail version it started from
/// still holds, then publishes the slot FREE after advancing the tail. A
/// pop from the owner can contend with a thief on the same slot, which the
/// CAS on the slot value resolves.
pub struct BoundedQueue {
    head: AtomicU32,
    tail: CachePadded<AtomicU32>,
    slots: [CachePadded<AtomicU64>; BoundedQueue::CAPACITY],
}

impl BoundedQueue {
    pub const CAPACITY: usize = 16;

    pub fn new() -> BoundedQueue {
        BoundedQueue {
            head: AtomicU32::new(u32::MAX),
            tail: CachePadded::new(AtomicU32::new(0)),
            slots: [(); Self::CAPACITY].map(|_| CachePadded::new(AtomicU64::new(FREE_SLOT))),
        }
    }

    /// Called by the single producer. Fails when the ring is full.
    pub fn push(&self, block: *mut WorkBlock) -> bool {
        let item = block as u64;
        debug_assert!(item != FREE_SLOT && item != TAKEN_SLOT);

        let head = self.head.load(Ordering::Relaxed);
        let idx = (head.wrapping_add(1) as usize) % Self::CAPACITY;
        let slot = self.slots[idx].load(Ordering::Acquire);

        if slot == FREE_SLOT {
            self.slots[idx].store(item, Ordering::Release);
            self.head.store(head.wrapping_add(1), Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Called by the single producer; pops in LIFO order.
    pub fn pop(&self) -> Option<*mut WorkBlock> {
        let head = self.head.load(Ordering::Relaxed);
        let idx = (head as usize) % Self::CAPACITY;
        let slot = self.slots[idx].load(Ordering::Acquire);

        if slot > TAKEN_SLOT
            && self.slots[idx]
                .compare_exchange(slot, FREE_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.head.store(head.wrapping_sub(1), Ordering::Relaxed);
            return Some(slot as *mut WorkBlock);
        }

        None
    }

    /// Called by other consumers; pops in FIFO order. Never blocks.
    pub fn steal(&self) -> Option<*mut WorkBlock> {
        loop {
            let idx_ver = self.tail.load(Ordering::Acquire);
            let idx = (idx_ver as usize) % Self::CAPACITY;
            let slot = self.slots[idx].load(Ordering::Acquire);

            if slot == FREE_SLOT {
                return None;
            }
            if slot != TAKEN_SLOT
                && self.slots[idx]
                    .compare_exchange_weak(slot, TAKEN_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                if idx_ver == self.tail.load(Ordering::Acquire) {
                    let prev = self.tail.fetch_add(1, Ordering::Release);
                    debug_assert_eq!(prev as usize % Self::CAPACITY, idx);
                    self.slots[idx].store(FREE_SLOT, Ordering::Release);
                    return Some(slot as *mut WorkBlock);
                }
                // Tail moved under us: another thief completed this slot's
                // generation. Put the value back and retry.
                self.slots[idx].store(slot, Ordering::Release);
            }
        }
    }

    /// Called after all producers and consumers have stopped.
    pub fn check_empty(&self) {
        for slot in &self.slots {
            assert_eq!(slot.load(Ordering::Relaxed), FREE_SLOT, "work-stealing queue not drained");
        }
    }
}

impl Default for BoundedQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One bounded queue per worker. Stealing probes the other workers' queues
/// starting just after the workless worker's own index to spread contention.
pub struct QueueManager {
    queues: [CachePadded<BoundedQueue>; MAX_WORKERS],
}

impl QueueManager {
    pub fn new() -> QueueManager {
        QueueManager {
            queues: [(); MAX_WORKERS].map(|_| CachePadded::new(BoundedQueue::new())),
        }
    }

    pub fn queue(&self, worker_index: usize) -> &BoundedQueue {
        &self.queues[worker_index]
    }

    pub fn steal_for(&self, workless_index: usize) -> Option<*mut WorkBlock> {
        for idx in (workless_index + 1..MAX_WORKERS).chain(0..workless_index) {
            if let Some(stolen) = self.queues[idx].steal() {
                return Some(stolen);
            }
        }
        None
    }

    pub fn check_empty(&self, worker_index: usize) {
        self.queues[worker_index].check_empty();
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates objects into work blocks for one worker. Full blocks go to
/// the worker's stealable queue in parallel mode, or onto a private linked
/// list in serial mode; when the stealable queue's ring is full the block
/// overflows to a local list that refills the ring on pop.
pub struct WorkBlockifier {
    wip: *mut WorkBlock,
    wip_num: usize,
    sync_list: *mut WorkBlock,
    local_overflow: Vec<*mut WorkBlock>,
    async_queue: *const BoundedQueue,
    worker_index: usize,
    pages: *const PageAllocator,
}

// Blocks are plain pages of object references owned by exactly one worker
// at a time; transferring the blockifier with its context is safe.
unsafe impl Send for WorkBlockifier {}

impl WorkBlockifier {
    /// The blockifier allocates its wip block lazily so pooled contexts do
    /// not pin pages between cycles.
    pub fn new() -> WorkBlockifier {
        WorkBlockifier {
            wip: std::ptr::null_mut(),
            wip_num: 0,
            sync_list: std::ptr::null_mut(),
            local_overflow: Vec::new(),
            async_queue: std::ptr::null(),
            worker_index: 0,
            pages: std::ptr::null(),
        }
    }

    pub fn attach(&mut self, worker_index: usize, pages: &PageAllocator) {
        self.worker_index = worker_index;
        self.pages = pages;
        if self.wip.is_null() {
            self.allocate_wip_block();
        }
    }

    pub fn set_async_queue(&mut self, queue: &BoundedQueue) {
        self.async_queue = queue;
    }

    pub fn reset_async_queue(&mut self) {
        assert_eq!(self.partial_num(), 0, "queue not empty");
        self.async_queue = std::ptr::null();
    }

    pub fn partial_num(&self) -> usize {
        self.wip_num
    }

    pub fn is_unused(&self) -> bool {
        self.wip_num == 0 && self.sync_list.is_null() && self.local_overflow.is_empty()
    }

    /// Queues an object for tracing. `PARALLEL` selects whether full blocks
    /// become stealable or stay on the private list.
    pub fn add<const PARALLEL: bool>(&mut self, object: ObjectRef) {
        debug_assert!(!self.wip.is_null(), "blockifier not attached");
        let wip = unsafe { &mut *self.wip };
        wip.objects[self.wip_num] = object;
        self.wip_num += 1;
        if self.wip_num == BLOCK_CAPACITY {
            if PARALLEL {
                self.push_full_block_async();
            } else {
                self.push_full_block_sync();
            }
        }
    }

    fn push_full_block_sync(&mut self) {
        let block = self.seal_wip();
        unsafe { (*block).previous = self.sync_list };
        self.sync_list = block;
        self.allocate_wip_block();
    }

    fn push_full_block_async(&mut self) {
        let block = self.seal_wip();
        if !self.async_queue().push(block) {
            self.local_overflow.push(block);
        }
        self.allocate_wip_block();
    }

    pub fn pop_full_block_sync(&mut self) -> Option<*mut WorkBlock> {
        let out = self.sync_list;
        if out.is_null() {
            return None;
        }
        self.sync_list = unsafe { (*out).previous };
        Some(out)
    }

    pub fn pop_full_block_async(&mut self) -> Option<*mut WorkBlock> {
        if let Some(local) = self.local_overflow.pop() {
            // Expose the remaining overflow to thieves while we work.
            while let Some(&block) = self.local_overflow.last() {
                if self.async_queue().push(block) {
                    self.local_overflow.pop();
                } else {
                    break;
                }
            }
            return Some(local);
        }
        self.async_queue().pop()
    }

    /// Takes the partial wip block, padding its tail for prefetching.
    /// Returns the block and its live object count.
    pub fn pop_wip_block(&mut self) -> Option<(*mut WorkBlock, usize)> {
        if self.wip_num == 0 {
            return None;
        }
        let num = self.wip_num;
        let block = self.wip;
        unsafe { pad_objects(&mut (*block).objects, num) };
        self.allocate_wip_block_raw();
        Some((block, num))
    }

    pub fn steal_full_block(&self, manager: &QueueManager) -> Option<*mut WorkBlock> {
        manager.steal_for(self.worker_index)
    }

    /// Returns a drained block's page to the worker cache.
    pub fn free_owning_block(&self, block: *mut WorkBlock) {
        debug_assert!(!block.is_null());
        debug_assert!(Address::from_mut_ptr(block).is_aligned_to(PAGE_SIZE));
        unsafe { (*self.pages).return_worker_page(self.worker_index, Address::from_mut_ptr(block)) };
    }

    /// Releases the wip block at end of cycle. The blockifier must be empty.
    pub fn detach(&mut self) {
        assert!(self.is_unused(), "detaching a blockifier with pending work");
        if !self.wip.is_null() {
            let page = Address::from_mut_ptr(self.wip);
            unsafe { (*self.pages).return_worker_page(self.worker_index, page) };
            self.wip = std::ptr::null_mut();
        }
        self.pages = std::ptr::null();
    }

    fn seal_wip(&mut self) -> *mut WorkBlock {
        debug_assert_eq!(self.wip_num, BLOCK_CAPACITY);
        let block = self.wip;
        unsafe { pad_objects(&mut (*block).objects, BLOCK_CAPACITY) };
        block
    }

    fn allocate_wip_block(&mut self) {
        const _: () = assert!(std::mem::size_of::<WorkBlock>() == PAGE_SIZE);
        self.allocate_wip_block_raw();
    }

    fn allocate_wip_block_raw(&mut self) {
        let page = unsafe { (*self.pages).allocate_page(self.worker_index) };
        let block = page.to_mut_ptr::<WorkBlock>();
        unsafe { (*block).previous = std::ptr::null_mut() };
        self.wip = block;
        self.wip_num = 0;
    }

    fn async_queue(&self) -> &BoundedQueue {
        debug_assert!(!self.async_queue.is_null(), "async queue not set");
        unsafe { &*self.async_queue }
    }
}

impl Default for WorkBlockifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn fake_block(id: usize) -> *mut WorkBlock {
        // Queue tests only exercise pointer plumbing; an aligned non-null
        // address stands in for a real block.
        (0x10000 + id * PAGE_SIZE) as *mut WorkBlock
    }

    #[test]
    fn owner_pops_lifo() {
        let queue = BoundedQueue::new();
        assert!(queue.push(fake_block(1)));
        assert!(queue.push(fake_block(2)));
        assert_eq!(queue.pop(), Some(fake_block(2)));
        assert_eq!(queue.pop(), Some(fake_block(1)));
        assert_eq!(queue.pop(), None);
        queue.check_empty();
    }

    #[test]
    fn thieves_steal_fifo() {
        let queue = BoundedQueue::new();
        assert!(queue.push(fake_block(1)));
        assert!(queue.push(fake_block(2)));
        assert_eq!(queue.steal(), Some(fake_block(1)));
        assert_eq!(queue.steal(), Some(fake_block(2)));
        assert_eq!(queue.steal(), None);
        queue.check_empty();
    }

    #[test]
    fn push_fails_when_full() {
        let queue = BoundedQueue::new();
        for i in 0..BoundedQueue::CAPACITY {
            assert!(queue.push(fake_block(i + 1)));
        }
        assert!(!queue.push(fake_block(99)));
        assert_eq!(queue.steal(), Some(fake_block(1)));
        assert!(queue.push(fake_block(99)));
    }

    #[test]
    fn concurrent_stealing_loses_no_blocks() {
        let queue = std::sync::Arc::new(BoundedQueue::new());
        const BLOCKS: usize = 4000;
        let stolen_count = AtomicUsize::new(0);
        let mut stolen: Vec<Vec<usize>> = Vec::new();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..3 {
                let queue = queue.clone();
                let stolen_count = &stolen_count;
                handles.push(scope.spawn(move || {
                    let mut mine = Vec::new();
                    while stolen_count.load(Ordering::Relaxed) < BLOCKS {
                        if let Some(block) = queue.steal() {
                            mine.push(block as usize);
                            stolen_count.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                    mine
                }));
            }

            let mut pushed = 0;
            while pushed < BLOCKS {
                if queue.push(fake_block(pushed + 1)) {
                    pushed += 1;
                }
            }

            for handle in handles {
                stolen.push(handle.join().unwrap());
            }
        });

        let unique: HashSet<usize> = stolen.iter().flatten().copied().collect();
        assert_eq!(unique.len(), BLOCKS);
        queue.check_empty();
    }

    #[test]
    fn blockifier_roundtrip() {
        let pages = PageAllocator::new();
        let manager = QueueManager::new();
        let mut blockifier = WorkBlockifier::new();
        blockifier.attach(0, &pages);
        blockifier.set_async_queue(manager.queue(0));

        let value = 3u64;
        let obj = ObjectRef::from_ref(&value);
        for _ in 0..BLOCK_CAPACITY + 5 {
            blockifier.add::<true>(obj);
        }
        assert_eq!(blockifier.partial_num(), 5);

        let full = blockifier.pop_full_block_async().expect("one full block");
        assert_eq!(unsafe { (*full).objects(BLOCK_CAPACITY).len() }, BLOCK_CAPACITY);
        blockifier.free_owning_block(full);

        let (wip, num) = blockifier.pop_wip_block().expect("partial block");
        assert_eq!(num, 5);
        // The pad repeats the last live element for safe prefetching.
        assert_eq!(unsafe { (*wip).objects[num] }, obj);
        blockifier.free_owning_block(wip);

        assert!(blockifier.is_unused());
        manager.check_empty(0);
        blockifier.detach();
    }

    #[test]
    fn blockifier_overflows_past_bounded_capacity() {
        let pages = PageAllocator::new();
        let manager = QueueManager::new();
        let mut blockifier = WorkBlockifier::new();
        blockifier.attach(1, &pages);
        blockifier.set_async_queue(manager.queue(1));

        let value = 4u64;
        let obj = ObjectRef::from_ref(&value);
        let full_blocks = BoundedQueue::CAPACITY + 3;
        for _ in 0..BLOCK_CAPACITY * full_blocks {
            blockifier.add::<true>(obj);
        }

        let mut drained = 0;
        while let Some(block) = blockifier.pop_full_block_async() {
            blockifier.free_owning_block(block);
            drained += 1;
        }
        assert_eq!(drained, full_blocks);
        assert!(blockifier.is_unused());
        blockifier.detach();
    }
}
