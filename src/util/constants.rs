/// Work-stealing is O(N^2), every workless worker probes every queue.
/// Revisit the stealing strategy before raising this.
pub const MAX_WORKERS: usize = 16;

/// Size of the scratch pages backing every transient collector structure.
pub const PAGE_SIZE: usize = 4096;
pub const LOG_PAGE_SIZE: usize = 12;

/// Padding granularity used to keep hot atomics on separate cache lines.
pub const CACHE_LINE_SIZE: usize = 64;

/// Trailing slots appended after the live range of object batches so
/// prefetching a fixed distance ahead never reads unmapped memory.
pub const OBJECT_LOOKAHEAD: usize = 16;

/// Objects per chunk of the object index table.
pub const OBJECTS_PER_CHUNK: usize = 64 * 1024;

/// Upper bound on table chunks; the chunk pointer array is preallocated so
/// item lookup never takes a lock.
pub const MAX_CHUNKS: usize = 2048;
