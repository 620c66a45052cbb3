//! Staged reference batching: queues up memory indirections so the data the
//! processor needs is prefetched just in time instead of causing synchronous
//! cache misses.
//!
//! Bounded queues keep the drain loops branch-poor and vectorizable. Array
//! views feed the "unvalidated" reference queue, which feeds the "validated"
//! queue, which is dispatched to the processor when full. Unvalidated means
//! the slot might hold null, a permanent-pool object or an unresolved
//! handle, none of which need processing.

use crate::object::schema::Schema;
use crate::object::table::{ObjectIndex, ObjectItem, ObjectTable};
use crate::util::constants::PAGE_SIZE;
use crate::util::pages::PageAllocator;
use crate::util::{Address, ObjectRef};
use crate::vm::Binding;

pub(crate) const ARRAY_BATCH: usize = 32;
pub(crate) const UNVALIDATED_BATCH: usize = 32;
pub(crate) const VALIDATED_BATCH: usize = 1024;
pub(crate) const VALIDATED_PREFETCH_AHEAD: usize = 64;

/// Fixed-capacity staging queue. `TOTAL` is `CAP` plus the prefetch pad;
/// entries are zero-initialized so prefetching ahead of the live range
/// touches the same (near) null addresses instead of garbage.
pub(crate) struct BatchQueue<T: Copy + Default, const CAP: usize, const TOTAL: usize> {
    num: usize,
    entries: [T; TOTAL],
}

impl<T: Copy + Default, const CAP: usize, const TOTAL: usize> BatchQueue<T, CAP, TOTAL> {
    pub fn new() -> Self {
        debug_assert!(TOTAL >= CAP);
        BatchQueue {
            num: 0,
            entries: [T::default(); TOTAL],
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_full(&self) -> bool {
        self.num == CAP
    }

    pub fn slack(&self) -> usize {
        CAP - self.num
    }

    pub fn push(&mut self, entry: T) {
        debug_assert!(self.num < CAP);
        self.entries[self.num] = entry;
        self.num += 1;
    }

    pub fn entries(&self) -> &[T] {
        &self.entries[..self.num]
    }

    /// The full backing store including the pad, for prefetch-ahead loops.
    pub fn padded(&self) -> &[T; TOTAL] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.num = 0;
    }
}

/// Bitmask of per-entry validation verdicts for one unvalidated batch.
#[derive(Default, Clone, Copy)]
pub(crate) struct ValidBits {
    word: u64,
}

impl ValidBits {
    pub fn set(&mut self, idx: usize, value: bool) {
        debug_assert!(idx < 64);
        self.word |= (value as u64) << idx;
    }

    pub fn get(&self, idx: usize) -> bool {
        (self.word >> idx) & 1 != 0
    }

    pub fn count(&self) -> usize {
        self.word.count_ones() as usize
    }

    pub fn and(a: ValidBits, b: ValidBits) -> ValidBits {
        ValidBits { word: a.word & b.word }
    }
}

/// A reference in flight through the stages: the slot address (zero when
/// the reference was reported by value) and, once resolved, the object.
#[derive(Copy, Clone, Default)]
pub(crate) struct ResolvedMutableRef {
    pub object: ObjectRef,
    pub slot: Address,
}

/// A contiguous run of reference slots.
#[derive(Copy, Clone, Default)]
pub(crate) struct RefView {
    pub data: Address,
    pub num: usize,
}

/// Object table metadata snapshot for one validated reference.
#[derive(Copy, Clone)]
pub(crate) struct RefMetadata<'t> {
    pub item: &'t ObjectItem,
    pub flags: crate::object::flags::ObjectFlags,
}

/// Validates and dispatches batches for one slot flavor. `KILLABLE` selects
/// whether slot addresses ride along to the processor.
pub(crate) struct ReferenceBatcher<const KILLABLE: bool> {
    arrays: BatchQueue<RefView, ARRAY_BATCH, ARRAY_BATCH>,
    unvalidated: BatchQueue<ResolvedMutableRef, UNVALIDATED_BATCH, UNVALIDATED_BATCH>,
    validated: BatchQueue<ResolvedMutableRef, VALIDATED_BATCH, { VALIDATED_BATCH + VALIDATED_PREFETCH_AHEAD }>,
}

impl<const KILLABLE: bool> ReferenceBatcher<KILLABLE> {
    pub fn new() -> Self {
        ReferenceBatcher {
            arrays: BatchQueue::new(),
            unvalidated: BatchQueue::new(),
            validated: BatchQueue::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.len() == 0 && self.unvalidated.len() == 0 && self.validated.len() == 0
    }

    /// Queues a whole view of reference slots.
    pub fn push_view<VM: Binding>(
        &mut self,
        table: &ObjectTable,
        sink: &mut impl BatchSink,
        view: RefView,
    ) {
        if view.num == 0 {
            return;
        }
        view.data.prefetch_read();
        if self.arrays.is_full() {
            self.drain_arrays::<VM>(table, sink);
        }
        self.arrays.push(view);
    }

    /// Queues a single reference slot; the value is read at drain time.
    pub fn push_slot<VM: Binding>(
        &mut self,
        table: &ObjectTable,
        sink: &mut impl BatchSink,
        slot: Address,
    ) {
        if self.unvalidated.is_full() {
            self.drain_unvalidated::<VM>(table, sink);
        }
        self.unvalidated.push(ResolvedMutableRef {
            object: ObjectRef::NULL,
            slot,
        });
    }

    /// Queues a reference reported by value (no slot to null). Only the
    /// immutable flavor accepts these.
    pub fn push_value<VM: Binding>(
        &mut self,
        table: &ObjectTable,
        sink: &mut impl BatchSink,
        object: ObjectRef,
    ) {
        debug_assert!(!KILLABLE, "killable references need a slot address");
        if self.unvalidated.is_full() {
            self.drain_unvalidated::<VM>(table, sink);
        }
        self.unvalidated.push(ResolvedMutableRef {
            object,
            slot: Address::ZERO,
        });
    }

    /// Drains every stage. Slower dynamic-length paths than the full-batch
    /// drains the hot loops hit.
    pub fn flush<VM: Binding>(&mut self, table: &ObjectTable, sink: &mut impl BatchSink) {
        self.drain_arrays::<VM>(table, sink);
        self.drain_unvalidated::<VM>(table, sink);
        self.drain_validated::<VM>(table, sink);
    }

    /// Feeds queued array contents to the unvalidated queue.
    fn drain_arrays<VM: Binding>(&mut self, table: &ObjectTable, sink: &mut impl BatchSink) {
        let num_views = self.arrays.len();
        if num_views == 0 {
            return;
        }
        for view in self.arrays.entries() {
            view.data.prefetch_read();
        }
        for view_idx in 0..num_views {
            let view = self.arrays.padded()[view_idx];
            for idx in 0..view.num {
                let slot = view.data.shift::<ObjectRef>(idx as isize);
                if self.unvalidated.is_full() {
                    self.drain_unvalidated::<VM>(table, sink);
                }
                self.unvalidated.push(ResolvedMutableRef {
                    object: ObjectRef::NULL,
                    slot,
                });
            }
        }
        self.arrays.clear();
    }

    /// Validates a batch: non-null, not permanent, resolved. Survivors are
    /// compacted into the validated queue with a cursor, no branches per
    /// element.
    fn drain_unvalidated<VM: Binding>(&mut self, table: &ObjectTable, sink: &mut impl BatchSink) {
        let num = self.unvalidated.len();
        if num == 0 {
            return;
        }
        sink.count_references(num);

        let mut objects = [ObjectRef::NULL; UNVALIDATED_BATCH];
        for (idx, entry) in self.unvalidated.entries().iter().enumerate() {
            objects[idx] = if entry.slot.is_zero() {
                entry.object
            } else {
                unsafe { entry.slot.load::<ObjectRef>() }
            };
        }

        let mut valids_a = ValidBits::default();
        let mut valids_b = ValidBits::default();
        for (idx, object) in objects[..num].iter().enumerate() {
            valids_a.set(idx, !VM::is_permanent(*object));
        }
        for (idx, object) in objects[..num].iter().enumerate() {
            valids_b.set(idx, !object.is_null() && VM::is_resolved(*object));
        }

        let valid = ValidBits::and(valids_a, valids_b);
        for idx in 0..num {
            if valid.get(idx) {
                if self.validated.is_full() {
                    self.drain_validated::<VM>(table, sink);
                }
                let slot = self.unvalidated.padded()[idx].slot;
                self.validated.push(ResolvedMutableRef {
                    object: objects[idx],
                    slot,
                });
            }
        }

        self.unvalidated.clear();
    }

    /// Dispatches a validated batch: prefetches object headers a fixed
    /// distance ahead while translating objects to table indices, then
    /// prefetches table items while snapshotting flags, then hands each
    /// entry to the processor.
    fn drain_validated<VM: Binding>(&mut self, table: &ObjectTable, sink: &mut impl BatchSink) {
        let num = self.validated.len();
        if num == 0 {
            return;
        }

        const AHEAD: usize = VALIDATED_PREFETCH_AHEAD;
        let entries = self.validated.padded();

        let mut indices = [ObjectIndex::new(0); VALIDATED_BATCH];
        if num > AHEAD {
            for entry in &entries[..AHEAD] {
                entry.object.to_address().prefetch_read();
            }
            for idx in 0..num {
                indices[idx] = VM::object_index(entries[idx].object);
                // The pad repeats zeroed entries, so this stays within the
                // queue's storage without a bounds check.
                entries[idx + AHEAD].object.to_address().prefetch_read();
            }
        } else {
            for entry in &entries[..num] {
                entry.object.to_address().prefetch_read();
            }
            for idx in 0..num {
                indices[idx] = VM::object_index(entries[idx].object);
            }
        }

        for idx in 0..num {
            let item = table.index_to_item(indices[idx]);
            Address::from_ref(item).prefetch_read();

            #[cfg(any(debug_assertions, feature = "sanity"))]
            assert!(
                item.object() == entries[idx].object,
                "invalid object in GC: {} does not match table slot {}",
                entries[idx].object,
                indices[idx].as_u32(),
            );
        }

        for idx in 0..num {
            let item = table.index_to_item(indices[idx]);
            let metadata = RefMetadata {
                item,
                flags: item.flags(),
            };
            let entry = entries[idx];
            if KILLABLE {
                sink.handle_mutable(entry, metadata);
            } else {
                sink.handle_immutable(entry.object, metadata);
            }
        }

        self.validated.clear();
    }
}

/// What a drained batch lands on: the dispatcher's processor handlers.
/// Split out as a trait so the batcher does not borrow the whole dispatcher
/// while draining.
pub(crate) trait BatchSink {
    fn count_references(&mut self, num: usize);
    fn handle_mutable(&mut self, reference: ResolvedMutableRef, metadata: RefMetadata<'_>);
    fn handle_immutable(&mut self, object: ObjectRef, metadata: RefMetadata<'_>);
}

/// One pending array-of-structs traversal.
pub(crate) struct StructArrayJob {
    pub schema: Schema,
    pub data: Address,
    pub num: u32,
    pub stride: u32,
}

const STRUCT_JOB_SIZE: usize = std::mem::size_of::<StructArrayJob>();
const STRUCT_BLOCK_LOOKAHEAD: usize = 2;
const STRUCT_BLOCK_SLOTS: usize =
    (PAGE_SIZE - std::mem::size_of::<usize>()) / STRUCT_JOB_SIZE - STRUCT_BLOCK_LOOKAHEAD;

#[repr(C)]
pub(crate) struct StructBlock {
    next_full: *mut StructBlock,
    jobs: [std::mem::MaybeUninit<StructArrayJob>; STRUCT_BLOCK_SLOTS + STRUCT_BLOCK_LOOKAHEAD],
}

/// Unbounded page-blockified queue of validated, non-empty struct-array
/// jobs. Drained after the reference queues so element traversal does not
/// interleave with slot validation.
pub(crate) struct StructBlockifier {
    wip: *mut StructBlock,
    wip_num: usize,
    full_list: *mut StructBlock,
    worker_index: usize,
    pages: *const PageAllocator,
}

unsafe impl Send for StructBlockifier {}

impl StructBlockifier {
    pub fn new(worker_index: usize, pages: &PageAllocator) -> StructBlockifier {
        let mut blockifier = StructBlockifier {
            wip: std::ptr::null_mut(),
            wip_num: 0,
            full_list: std::ptr::null_mut(),
            worker_index,
            pages,
        };
        blockifier.allocate_wip();
        blockifier
    }

    pub fn can_pop(&self) -> bool {
        self.wip_num > 0 || !self.full_list.is_null()
    }

    pub fn push(&mut self, job: StructArrayJob) {
        debug_assert!(job.num > 0);
        unsafe {
            (*self.wip).jobs[self.wip_num].write(job);
        }
        self.wip_num += 1;
        if self.wip_num == STRUCT_BLOCK_SLOTS {
            let block = self.wip;
            unsafe { (*block).next_full = self.full_list };
            self.full_list = block;
            self.allocate_wip();
        }
    }

    /// Pops a block of jobs, full blocks first. The caller consumes every
    /// job (ownership moves out) and then frees the block.
    pub fn pop_block(&mut self) -> Option<(*mut StructBlock, usize)> {
        if !self.full_list.is_null() {
            let block = self.full_list;
            self.full_list = unsafe { (*block).next_full };
            return Some((block, STRUCT_BLOCK_SLOTS));
        }
        if self.wip_num > 0 {
            let num = self.wip_num;
            let block = self.wip;
            self.allocate_wip();
            return Some((block, num));
        }
        None
    }

    /// Reads the jobs out of a popped block, passing ownership to `f`.
    pub fn consume_block(&self, block: *mut StructBlock, num: usize, mut f: impl FnMut(StructArrayJob)) {
        for idx in 0..num {
            if idx + STRUCT_BLOCK_LOOKAHEAD < num {
                unsafe {
                    (*block).jobs[idx + STRUCT_BLOCK_LOOKAHEAD]
                        .assume_init_ref()
                        .data
                        .prefetch_read();
                }
            }
            let job = unsafe { (*block).jobs[idx].assume_init_read() };
            f(job);
        }
    }

    pub fn free_block(&self, block: *mut StructBlock) {
        unsafe { (*self.pages).return_worker_page(self.worker_index, Address::from_mut_ptr(block)) };
    }

    /// Releases the wip block. The queue must be fully drained.
    pub fn detach(&mut self) {
        assert!(!self.can_pop(), "detaching a struct queue with pending jobs");
        if !self.wip.is_null() {
            let page = Address::from_mut_ptr(self.wip);
            unsafe { (*self.pages).return_worker_page(self.worker_index, page) };
            self.wip = std::ptr::null_mut();
        }
    }

    fn allocate_wip(&mut self) {
        const _: () = assert!(std::mem::size_of::<StructBlock>() <= PAGE_SIZE);
        let page = unsafe { (*self.pages).allocate_page(self.worker_index) };
        let block = page.to_mut_ptr::<StructBlock>();
        unsafe { (*block).next_full = std::ptr::null_mut() };
        self.wip = block;
        self.wip_num = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::schema::SchemaBuilder;

    #[test]
    fn valid_bits_compact() {
        let mut a = ValidBits::default();
        a.set(0, true);
        a.set(1, false);
        a.set(2, true);
        let mut b = ValidBits::default();
        b.set(0, true);
        b.set(2, false);
        let and = ValidBits::and(a, b);
        assert!(and.get(0));
        assert!(!and.get(1));
        assert!(!and.get(2));
        assert_eq!(and.count(), 1);
    }

    #[test]
    fn batch_queue_tracks_fullness() {
        let mut queue: BatchQueue<ObjectRef, 4, 4> = BatchQueue::new();
        assert_eq!(queue.slack(), 4);
        for _ in 0..4 {
            queue.push(ObjectRef::NULL);
        }
        assert!(queue.is_full());
        queue.clear();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn struct_blockifier_roundtrip() {
        let pages = PageAllocator::new();
        let mut queue = StructBlockifier::new(0, &pages);
        let schema = SchemaBuilder::new(16).build();

        for i in 0..STRUCT_BLOCK_SLOTS + 3 {
            queue.push(StructArrayJob {
                schema: schema.clone(),
                data: unsafe { Address::from_usize(0x1000 + i * 16) },
                num: 1,
                stride: 16,
            });
        }

        let mut seen = 0;
        while let Some((block, num)) = queue.pop_block() {
            queue.consume_block(block, num, |job| {
                assert_eq!(job.stride, 16);
                seen += 1;
            });
            queue.free_block(block);
        }
        assert_eq!(seen, STRUCT_BLOCK_SLOTS + 3);
        queue.detach();
    }
}
