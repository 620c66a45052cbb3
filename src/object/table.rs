//! The global object index table: a chunked, index-addressable array of
//! `ObjectItem` slots. Item lookup is lock-free; only growing the chunk map
//! and the destructor batches of the purge phase take the internal lock.

use crate::object::flags::ObjectFlags;
use crate::util::constants::{MAX_CHUNKS, OBJECTS_PER_CHUNK};
use crate::util::ObjectRef;
use atomic::Atomic;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Index of an object's slot in the table. Stable for the object's lifetime.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectIndex(u32);

impl ObjectIndex {
    pub const fn new(index: u32) -> ObjectIndex {
        ObjectIndex(index)
    }

    pub const fn from_usize(index: usize) -> ObjectIndex {
        ObjectIndex(index as u32)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One slot of the object table. The flags word is the only field mutated
/// concurrently; cluster membership is encoded in the owner word:
/// `0` for standalone objects, the root's object index (> 0 as encoded,
/// index + 1) for cluster members, and `-(cluster index + 1)` for roots.
pub struct ObjectItem {
    object: Atomic<ObjectRef>,
    flags: AtomicU32,
    owner: AtomicI32,
}

impl ObjectItem {
    const fn empty() -> ObjectItem {
        ObjectItem {
            object: Atomic::new(ObjectRef::NULL),
            flags: AtomicU32::new(0),
            owner: AtomicI32::new(0),
        }
    }

    pub fn object(&self) -> ObjectRef {
        self.object.load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits(self.flags.load(Ordering::Relaxed))
    }

    pub fn has_any_flags(&self, flags: ObjectFlags) -> bool {
        self.flags().contains_any(flags)
    }

    pub fn has_all_flags(&self, flags: ObjectFlags) -> bool {
        self.flags().contains_all(flags)
    }

    pub fn is_unreachable(&self) -> bool {
        self.has_any_flags(ObjectFlags::UNREACHABLE)
    }

    pub fn is_root_set(&self) -> bool {
        self.has_any_flags(ObjectFlags::ROOT_SET)
    }

    pub fn is_garbage(&self) -> bool {
        self.has_any_flags(ObjectFlags::GARBAGE)
    }

    pub fn is_cluster_root(&self) -> bool {
        self.has_any_flags(ObjectFlags::CLUSTER_ROOT)
    }

    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    /// Atomically clears a flag and reports whether this thread performed
    /// the transition. Only the winner may enqueue follow-up work, which is
    /// what keeps concurrent reachability free of duplicate enqueues.
    ///
    /// Only safe for concurrent clearing; concurrent set+clear of the same
    /// bit would race. Not for use during the mark phase.
    pub fn this_thread_cleared_flag(&self, flag: ObjectFlags) -> bool {
        if self.flags.load(Ordering::Relaxed) & flag.bits() != 0 {
            let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
            return old & flag.bits() != 0;
        }
        false
    }

    /// Atomic counterpart of `set_flags`; true if this thread set the bit.
    pub fn this_thread_set_flag(&self, flag: ObjectFlags) -> bool {
        if self.flags.load(Ordering::Relaxed) & flag.bits() == 0 {
            let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
            return old & flag.bits() == 0;
        }
        false
    }

    /// Raw owner word. 0: standalone. Positive: cluster member, value is the
    /// root's object index + 1. Negative: cluster root, value encodes the
    /// cluster index.
    pub fn owner_word(&self) -> i32 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn is_cluster_member(&self) -> bool {
        self.owner_word() > 0
    }

    pub fn cluster_root_index(&self) -> ObjectIndex {
        let owner = self.owner_word();
        debug_assert!(owner > 0, "object is not a cluster member");
        ObjectIndex((owner - 1) as u32)
    }

    pub fn cluster_index(&self) -> usize {
        let owner = self.owner_word();
        debug_assert!(owner < 0, "object is not a cluster root");
        (-owner - 1) as usize
    }

    pub fn set_owner_member(&self, root: ObjectIndex) {
        self.owner.store(root.as_u32() as i32 + 1, Ordering::Relaxed);
    }

    pub fn set_owner_root(&self, cluster_index: usize) {
        self.owner.store(-(cluster_index as i32) - 1, Ordering::Relaxed);
    }

    pub fn clear_owner(&self) {
        self.owner.store(0, Ordering::Relaxed);
    }
}

type Chunk = [ObjectItem; OBJECTS_PER_CHUNK];

/// Chunked object table. The chunk pointer array is preallocated so readers
/// index it without synchronization; chunks are allocated on demand while
/// registering objects.
pub struct ObjectTable {
    chunks: Vec<AtomicPtr<ObjectItem>>,
    num_objects: AtomicUsize,
    first_gc_index: AtomicUsize,
    free_indices: Mutex<Vec<ObjectIndex>>,
    /// Held while slots are created/destroyed and while the purge phase runs
    /// destructors, so no table iteration observes half-dead slots.
    internal_lock: Mutex<()>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        chunks.resize_with(MAX_CHUNKS, || AtomicPtr::new(std::ptr::null_mut()));
        ObjectTable {
            chunks,
            num_objects: AtomicUsize::new(0),
            first_gc_index: AtomicUsize::new(0),
            free_indices: Mutex::new(Vec::new()),
            internal_lock: Mutex::new(()),
        }
    }

    /// Number of slots ever handed out; the exclusive upper bound for table
    /// sweeps. Slots below this may be free (null object).
    pub fn num_objects(&self) -> usize {
        self.num_objects.load(Ordering::Acquire)
    }

    /// First index the collector considers. Objects below it form the
    /// permanent front section and are never swept.
    pub fn first_gc_index(&self) -> usize {
        self.first_gc_index.load(Ordering::Relaxed)
    }

    pub fn set_first_gc_index(&self, index: usize) {
        self.first_gc_index.store(index, Ordering::Relaxed);
    }

    /// Lock-free slot lookup.
    pub fn index_to_item(&self, index: ObjectIndex) -> &ObjectItem {
        let idx = index.as_usize();
        debug_assert!(idx < self.num_objects(), "object index {} out of bounds", index);
        let chunk = self.chunks[idx / OBJECTS_PER_CHUNK].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null());
        unsafe { &*chunk.add(idx % OBJECTS_PER_CHUNK) }
    }

    /// Registers an object and returns its slot index. The caller publishes
    /// the index into the object header afterwards.
    pub fn register(&self, object: ObjectRef, flags: ObjectFlags) -> ObjectIndex {
        assert!(!object.is_null(), "cannot register a null object");
        let _guard = self.internal_lock.lock().unwrap();

        let index = if let Some(index) = self.free_indices.lock().unwrap().pop() {
            index
        } else {
            let index = self.num_objects.load(Ordering::Relaxed);
            assert!(
                index < MAX_CHUNKS * OBJECTS_PER_CHUNK,
                "object table exhausted ({} slots)",
                index
            );
            if index % OBJECTS_PER_CHUNK == 0 {
                self.allocate_chunk(index / OBJECTS_PER_CHUNK);
            }
            self.num_objects.store(index + 1, Ordering::Release);
            ObjectIndex::from_usize(index)
        };

        let item = self.index_to_item(index);
        item.flags.store(flags.bits(), Ordering::Relaxed);
        item.clear_owner();
        item.object.store(object, Ordering::Release);
        index
    }

    /// Clears a slot after its object was destroyed and recycles the index.
    pub fn deregister(&self, index: ObjectIndex) {
        let item = self.index_to_item(index);
        debug_assert!(!item.object().is_null(), "double deregister of {}", index);
        item.object.store(ObjectRef::NULL, Ordering::Release);
        item.flags.store(0, Ordering::Relaxed);
        item.clear_owner();
        self.free_indices.lock().unwrap().push(index);
    }

    /// The object-table lock: the purge thread holds it around destructor
    /// batches; registration takes it internally.
    pub fn lock_internal(&self) -> MutexGuard<'_, ()> {
        self.internal_lock.lock().unwrap()
    }

    fn allocate_chunk(&self, chunk_index: usize) {
        let mut chunk: Vec<ObjectItem> = Vec::with_capacity(OBJECTS_PER_CHUNK);
        chunk.resize_with(OBJECTS_PER_CHUNK, ObjectItem::empty);
        let boxed: Box<[ObjectItem]> = chunk.into_boxed_slice();
        let ptr = Box::leak(boxed).as_mut_ptr();
        let prev = self.chunks[chunk_index].swap(ptr, Ordering::Release);
        debug_assert!(prev.is_null(), "chunk {} allocated twice", chunk_index);
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectTable {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            let ptr = chunk.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(
                        ptr,
                        OBJECTS_PER_CHUNK,
                    )));
                }
            }
        }
    }
}

// Chunks are owned leaked boxes; the raw pointers do not affect thread safety.
unsafe impl Send for ObjectTable {}
unsafe impl Sync for ObjectTable {}
