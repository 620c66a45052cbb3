//! Coordinates tracing workers: starting, tail spinning and stopping.
//!
//! Every worker context is published in a stealable slot so a single thread
//! can finish the whole phase alone if the machine's task workers are busy
//! with long-running work. Accounting invariant: each context eventually
//! contributes exactly one workless report and one stopped report, either
//! from the thread that claimed it or from the thief that stole it.

use crate::scheduler::context::{ContextPoolScope, WorkerContext};
use crate::scheduler::queue::QueueManager;
use crate::util::constants::MAX_WORKERS;
use crate::util::pages::PageAllocator;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

pub struct WorkCoordinator {
    contexts: Vec<CachePadded<AtomicPtr<WorkerContext>>>,
    num_used: AtomicI32,
    /// Workless workers currently spinning to steal work.
    num_workless: CachePadded<AtomicI32>,
    /// Budget of workless workers allowed to exit immediately instead of
    /// spinning, to reduce context switching with other subsystem threads.
    num_stop_directly: CachePadded<AtomicI32>,
    /// Workers that exited; the driving thread spins on this reaching the
    /// context count.
    num_stopped: CachePadded<AtomicI32>,
}

impl WorkCoordinator {
    pub fn new(contexts: &[*mut WorkerContext], machine_workers: usize) -> WorkCoordinator {
        let slots = contexts
            .iter()
            .map(|&context| CachePadded::new(AtomicPtr::new(context)))
            .collect::<Vec<_>>();
        let stop_directly = if machine_workers > MAX_WORKERS {
            0
        } else {
            1 + (slots.len() > 5) as i32
        };
        WorkCoordinator {
            contexts: slots,
            num_used: AtomicI32::new(0),
            num_workless: CachePadded::new(AtomicI32::new(0)),
            num_stop_directly: CachePadded::new(AtomicI32::new(stop_directly)),
            num_stopped: CachePadded::new(AtomicI32::new(0)),
        }
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Claims the context assigned to this worker slot. Returns None when a
    /// thief already made off with the initial objects and references.
    pub fn try_start_working(&self, worker: usize) -> Option<*mut WorkerContext> {
        let context = self.contexts[worker].swap(std::ptr::null_mut(), Ordering::AcqRel);
        if context.is_null() {
            None
        } else {
            self.num_used.fetch_add(1, Ordering::Relaxed);
            Some(context)
        }
    }

    /// Steals an unstarted context so one thread can finish the phase alone
    /// when other task workers never got scheduled. The thief also takes
    /// over the stolen context's workless/stopped accounting.
    pub fn steal_context(&self) -> Option<*mut WorkerContext> {
        if (self.num_used.load(Ordering::Relaxed) as usize) < self.contexts.len() {
            for slot in &self.contexts {
                let context = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !context.is_null() {
                    self.num_used.fetch_add(1, Ordering::Relaxed);
                    self.num_workless.fetch_add(1, Ordering::Relaxed);
                    self.num_stopped.fetch_add(1, Ordering::Relaxed);
                    self.num_stop_directly.fetch_sub(1, Ordering::Relaxed);
                    return Some(context);
                }
            }
        }
        None
    }

    /// Reports that the caller found no work anywhere. Returns whether the
    /// caller should spin for more; a few workers stop immediately instead
    /// to free their threads, and the driving thread always spins so it is
    /// not swapped out right before the phase ends.
    pub fn report_out_of_work(&self, is_driving_thread: bool) -> bool {
        self.num_workless.fetch_add(1, Ordering::AcqRel);

        if is_driving_thread || self.num_stop_directly.fetch_sub(1, Ordering::Relaxed) - 1 < 0 {
            return true;
        }

        self.num_stopped.fetch_add(1, Ordering::Release);
        false
    }

    /// The spinning worker stole something and is productive again.
    pub fn report_back_to_work(&self) {
        self.num_workless.fetch_sub(1, Ordering::AcqRel);
    }

    /// There is an accepted race where a thief empties the last working
    /// worker's queue and that worker reports out-of-work before the thief
    /// reports back-to-work, stopping other spinners prematurely. The worst
    /// case is a single unstolen block, cleaned up by its owner, very late
    /// in the phase when the spinners were unlikely to get more work anyway.
    pub fn keep_spinning(&self) -> bool {
        if (self.num_workless.load(Ordering::Acquire) as usize) < self.contexts.len() {
            return true;
        }

        self.num_stopped.fetch_add(1, Ordering::Release);
        false
    }

    pub fn spin_until_all_stopped(&self) {
        while (self.num_stopped.load(Ordering::Acquire) as usize) < self.contexts.len() {
            std::thread::yield_now();
        }
        debug_assert_eq!(
            self.num_used.load(Ordering::Relaxed) as usize,
            self.contexts.len()
        );
    }
}

/// Fans a reachability pass out over `num_workers` contexts.
///
/// The caller's seeded context becomes one of the workers; the others are
/// drawn from the pool and receive an even share of the initial objects and
/// native references. Worker threads are scoped: when this returns, every
/// context has been drained, its queue verified empty, and its scratch and
/// statistics merged back into the caller's context.
pub fn process_async<F>(
    queues: &QueueManager,
    pages: &PageAllocator,
    num_workers: usize,
    context: &mut WorkerContext,
    process: F,
) where
    F: Fn(&mut WorkerContext, bool) + Sync,
{
    debug_assert!(num_workers >= 1 && num_workers <= MAX_WORKERS);
    debug_assert!(
        context.objects_to_serialize.is_unused(),
        "objects_to_serialize may only be filled during reference processing; seed initial objects instead"
    );

    let (initial_objects, initial_len) = context.take_initial_objects();
    let initial_refs = std::mem::take(&mut context.initial_native_references);

    let pool = ContextPoolScope;
    let mut extras: Vec<Box<WorkerContext>> = (1..num_workers)
        .map(|_| pool.allocate_from_pool())
        .collect();

    // Split the initial workload evenly. Each share is re-padded when it is
    // installed into its context.
    let live_objects = &initial_objects[..initial_len];
    let obj_per_worker = live_objects.len().div_ceil(num_workers).max(1);
    let ref_per_worker = initial_refs.len().div_ceil(num_workers).max(1);
    {
        let mut give = |target: &mut WorkerContext, index: usize| {
            let objects = live_objects
                .chunks(obj_per_worker)
                .nth(index)
                .unwrap_or(&[])
                .to_vec();
            target.set_initial_objects_unpadded(objects);
            target.initial_native_references = initial_refs
                .chunks(ref_per_worker)
                .nth(index)
                .unwrap_or(&[])
                .to_vec();
        };
        give(context, 0);
        for (index, extra) in extras.iter_mut().enumerate() {
            give(extra, index + 1);
        }
    }

    let mut all: Vec<*mut WorkerContext> = Vec::with_capacity(num_workers);
    all.push(context as *mut WorkerContext);
    for extra in extras.iter_mut() {
        all.push(&mut **extra as *mut WorkerContext);
    }

    for &ctx in &all {
        let ctx = unsafe { &mut *ctx };
        let worker = ctx.worker_index();
        ctx.objects_to_serialize.attach(worker, pages);
        ctx.objects_to_serialize.set_async_queue(queues.queue(worker));
    }

    let coordinator = WorkCoordinator::new(&all, num_cpus::get());
    let coordinator_ref = &coordinator;
    let process_ref = &process;

    std::thread::scope(|scope| {
        for worker in 1..num_workers {
            scope.spawn(move || {
                if let Some(ctx) = coordinator_ref.try_start_working(worker) {
                    let ctx = unsafe { &mut *ctx };
                    ctx.coordinator = coordinator_ref;
                    process_ref(ctx, false);
                }
            });
        }

        if let Some(ctx) = coordinator_ref.try_start_working(0) {
            let ctx = unsafe { &mut *ctx };
            ctx.coordinator = coordinator_ref;
            process_ref(ctx, true);
        }

        // The driving thread can steal contexts and finish everything alone
        // if the spawned threads are starved.
        coordinator_ref.spin_until_all_stopped();
    });

    // Tear down queues and merge results.
    let mut teardown = |ctx: &mut WorkerContext| {
        ctx.coordinator = std::ptr::null();
        ctx.reset_initial_objects();
        ctx.initial_native_references.clear();
        queues.check_empty(ctx.worker_index());
        ctx.objects_to_serialize.reset_async_queue();
        ctx.objects_to_serialize.detach();
    };

    teardown(context);
    for mut extra in extras {
        teardown(&mut extra);

        context.stats.add_stats(&extra.stats);
        context.weak_references.append(&mut extra.weak_references);
        context.garbage_references.append(&mut extra.garbage_references);
        #[cfg(feature = "history")]
        context.history.append(&mut extra.history);

        pool.return_to_pool(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{panic_after, serial_test};

    fn with_contexts<F: FnOnce(&mut Vec<Box<WorkerContext>>)>(n: usize, f: F) {
        let pool = ContextPoolScope;
        let mut contexts: Vec<_> = (0..n).map(|_| pool.allocate_from_pool()).collect();
        f(&mut contexts);
        for context in contexts {
            pool.return_to_pool(context);
        }
    }

    fn as_ptrs(contexts: &mut [Box<WorkerContext>]) -> Vec<*mut WorkerContext> {
        contexts
            .iter_mut()
            .map(|c| &mut **c as *mut WorkerContext)
            .collect()
    }

    #[test]
    fn contexts_are_claimed_once() {
        serial_test(|| {
            with_contexts(2, |contexts| {
                let ptrs = as_ptrs(contexts);
                let coordinator = WorkCoordinator::new(&ptrs, num_cpus::get());

                assert!(coordinator.try_start_working(0).is_some());
                assert!(coordinator.try_start_working(0).is_none());
                assert!(coordinator.steal_context().is_some());
                assert!(coordinator.steal_context().is_none());
            });
        })
    }

    #[test]
    fn stolen_context_accounts_for_its_worker() {
        serial_test(|| {
            with_contexts(2, |contexts| {
                let ptrs = as_ptrs(contexts);
                let coordinator = WorkCoordinator::new(&ptrs, num_cpus::get());

                coordinator.try_start_working(0).unwrap();
                // Worker 1 never starts; the driving thread steals it.
                coordinator.steal_context().unwrap();

                // Only the driving thread's own report remains outstanding.
                assert!(coordinator.report_out_of_work(true));
                assert!(!coordinator.keep_spinning());
                coordinator.spin_until_all_stopped();
            });
        })
    }

    #[test]
    fn all_workless_releases_spinners() {
        serial_test(|| {
            panic_after(5000, || {
                with_contexts(2, |contexts| {
                    let ptrs = as_ptrs(contexts);
                    let coordinator = WorkCoordinator::new(&ptrs, num_cpus::get());

                    coordinator.try_start_working(0).unwrap();
                    coordinator.try_start_working(1).unwrap();

                    std::thread::scope(|scope| {
                        let coordinator = &coordinator;
                        for is_driving in [false, true] {
                            scope.spawn(move || {
                                if coordinator.report_out_of_work(is_driving) {
                                    while coordinator.keep_spinning() {
                                        std::thread::yield_now();
                                    }
                                }
                            });
                        }
                    });

                    coordinator.spin_until_all_stopped();
                });
            })
        })
    }
}
