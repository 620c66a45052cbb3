//! Allocates and caches the 4 KiB pages used for temporary allocations
//! during a collection cycle: work blocks, struct-array blocks and slow
//! callback queues all live in these.
//!
//! Pages are cached per worker first so the tracer's hot paths never touch a
//! lock, with a mutex-protected shared pool behind them. Nothing is freed
//! until the allocator is dropped at shutdown.

use crate::util::constants::{MAX_WORKERS, PAGE_SIZE};
use crate::util::Address;
use crossbeam::utils::CachePadded;

const WORKER_CACHE_CAPACITY: usize = 512 / MAX_WORKERS;

struct WorkerCache {
    num: usize,
    pages: [Address; WORKER_CACHE_CAPACITY],
}

impl WorkerCache {
    const fn new() -> Self {
        WorkerCache {
            num: 0,
            pages: [Address::ZERO; WORKER_CACHE_CAPACITY],
        }
    }

    fn push(&mut self, page: Address) -> bool {
        debug_assert!(!page.is_zero());
        if self.num < WORKER_CACHE_CAPACITY {
            self.pages[self.num] = page;
            self.num += 1;
            return true;
        }
        false
    }

    fn pop(&mut self) -> Option<Address> {
        if self.num > 0 {
            self.num -= 1;
            Some(self.pages[self.num])
        } else {
            None
        }
    }
}

struct SharedCache {
    pages: spin::Mutex<Vec<Address>>,
}

impl SharedCache {
    fn push(&self, page: Address) {
        self.pages.lock().push(page);
    }

    fn pop(&self) -> Option<Address> {
        self.pages.lock().pop()
    }

    /// Moves everything beyond a worker's guaranteed minimum to the shared
    /// pool. Each worker keeps enough pages that restarting a cycle cannot
    /// stall on page allocation: one for its work blocks, one for its struct
    /// blocks, and one per slow callback queue.
    fn push_surplus(&self, worker: &mut WorkerCache, keep: usize) {
        if worker.num > keep {
            let mut pages = self.pages.lock();
            pages.extend_from_slice(&worker.pages[keep..worker.num]);
            worker.num = keep;
        }
    }
}

/// Per-worker and shared caches of page-aligned scratch pages.
pub struct PageAllocator {
    shared: SharedCache,
    workers: [CachePadded<spin::Mutex<WorkerCache>>; MAX_WORKERS],
}

impl PageAllocator {
    pub fn new() -> Self {
        PageAllocator {
            shared: SharedCache {
                pages: spin::Mutex::new(Vec::new()),
            },
            workers: [(); MAX_WORKERS].map(|_| CachePadded::new(spin::Mutex::new(WorkerCache::new()))),
        }
    }

    /// Returns a page-aligned scratch page, preferring the caller's worker
    /// cache, then the shared pool, then fresh memory.
    pub fn allocate_page(&self, worker_index: usize) -> Address {
        debug_assert!(worker_index < MAX_WORKERS);
        if let Some(page) = self.workers[worker_index].lock().pop() {
            debug_assert!(Self::is_valid_page(page));
            return page;
        }
        if let Some(page) = self.shared.pop() {
            debug_assert!(Self::is_valid_page(page));
            return page;
        }

        alloc_aligned_page()
    }

    /// Returns a page to the caller's worker cache, spilling to the shared
    /// pool when the cache is full.
    pub fn return_worker_page(&self, worker_index: usize, page: Address) {
        debug_assert!(Self::is_valid_page(page));
        if !self.workers[worker_index].lock().push(page) {
            self.shared.push(page);
        }
    }

    pub fn return_shared_page(&self, page: Address) {
        debug_assert!(Self::is_valid_page(page));
        self.shared.push(page);
    }

    /// Trims every worker cache back to its guaranteed minimum at the end of
    /// a cycle, moving the surplus to the shared pool.
    pub fn trim_worker_caches(&self, min_worker_pages: usize) {
        for worker in &self.workers {
            self.shared.push_surplus(&mut worker.lock(), min_worker_pages);
        }
    }

    /// Live page bytes held by the caches plus pages currently lent out.
    pub fn count_bytes(&self) -> usize {
        let mut num_pages = self.shared.pages.lock().len();
        for worker in &self.workers {
            num_pages += worker.lock().num;
        }
        num_pages * PAGE_SIZE
    }

    pub fn is_valid_page(page: Address) -> bool {
        !page.is_zero() && page.is_aligned_to(PAGE_SIZE)
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        for page in self.shared.pages.lock().drain(..) {
            free_page(page);
        }
        for worker in &self.workers {
            let mut cache = worker.lock();
            while let Some(page) = cache.pop() {
                free_page(page);
            }
        }
    }
}

fn alloc_aligned_page() -> Address {
    let mut ptr: *mut libc::c_void = std::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, PAGE_SIZE) };
    assert!(
        rc == 0 && !ptr.is_null(),
        "failed to allocate a {} byte scratch page (errno {})",
        PAGE_SIZE,
        rc
    );
    Address::from_mut_ptr(ptr)
}

fn free_page(page: Address) {
    debug_assert!(PageAllocator::is_valid_page(page));
    unsafe { libc::free(page.to_mut_ptr()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_aligned() {
        let allocator = PageAllocator::new();
        let page = allocator.allocate_page(0);
        assert!(PageAllocator::is_valid_page(page));
        allocator.return_worker_page(0, page);
    }

    #[test]
    fn worker_cache_reuses_pages() {
        let allocator = PageAllocator::new();
        let page = allocator.allocate_page(3);
        allocator.return_worker_page(3, page);
        assert_eq!(allocator.allocate_page(3), page);
        allocator.return_worker_page(3, page);
    }

    #[test]
    fn trim_moves_surplus_to_shared() {
        let allocator = PageAllocator::new();
        let pages: Vec<_> = (0..6).map(|_| allocator.allocate_page(1)).collect();
        for page in &pages {
            allocator.return_worker_page(1, *page);
        }
        allocator.trim_worker_caches(2);
        assert_eq!(allocator.workers[1].lock().num, 2);
        assert_eq!(allocator.shared.pages.lock().len(), 4);
        assert_eq!(allocator.count_bytes(), 6 * PAGE_SIZE);
    }

    #[test]
    fn shared_pool_backfills_other_workers() {
        let allocator = PageAllocator::new();
        let page = allocator.allocate_page(0);
        allocator.return_shared_page(page);
        assert_eq!(allocator.allocate_page(7), page);
        allocator.return_worker_page(7, page);
    }
}
