//! The collector instance: owns the object table, clusters, options, the
//! scratch allocators, the purge pipeline and the GC lock, and drives one
//! collection cycle end to end. The instance is the single gate for any
//! mutator/collector interleaving; nothing in the crate keeps collection
//! state outside of it apart from the shared worker-context pool.

use crate::events::Events;
use crate::global_state::GlobalState;
use crate::object::cluster::ClusterTable;
use crate::object::flags::{KeepFlags, ObjectFlags};
use crate::object::table::{ObjectIndex, ObjectTable};
use crate::phase::gather::{clear_weak_references, dump_garbage_referencers, gather_unreachable_objects};
use crate::phase::mark::mark_objects_as_unreachable;
use crate::phase::purge::{incremental_destroy_garbage, AsyncPurge, PurgePipeline};
use crate::phase::unhash::unhash_unreachable_objects;
use crate::scheduler::aro::{AroFlags, SlowAroManager};
use crate::scheduler::context::ContextPoolScope;
use crate::scheduler::coordinator::process_async;
use crate::scheduler::queue::QueueManager;
use crate::stats::{GcPhase, PhaseTimes, WorkerStats};
use crate::tracer::{collect_references, collect_references_direct, TraceEnv};
use crate::util::options::Options;
use crate::util::pages::PageAllocator;
use crate::util::ObjectRef;
use crate::vm::{Binding, RootSet};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Guard mutators hold while creating, destroying or re-rooting managed
/// objects. Collection blocks until every guard is dropped.
pub struct MutatorGuard<'c>(#[allow(dead_code)] RwLockReadGuard<'c, ()>);

pub struct Collector<VM: Binding> {
    pub(crate) table: ObjectTable,
    pub(crate) clusters: ClusterTable,
    pub(crate) options: Options,
    pub(crate) state: GlobalState,
    pub(crate) pages: PageAllocator,
    pub(crate) queues: QueueManager,
    pub(crate) slow_aro: SlowAroManager,
    pub(crate) purge: PurgePipeline,
    pub(crate) async_purge: Mutex<Option<AsyncPurge>>,
    pub(crate) events: Events,
    /// The GC lock. Mutators share it; a collection cycle takes it
    /// exclusively for mark + reachability.
    gc_lock: RwLock<()>,
    phase_times: Mutex<PhaseTimes>,
    last_reachability_stats: Mutex<WorkerStats>,
    _vm: PhantomData<fn() -> VM>,
}

impl<VM: Binding> Collector<VM> {
    pub fn new(options: Options) -> Arc<Collector<VM>> {
        Arc::new(Collector {
            table: ObjectTable::new(),
            clusters: ClusterTable::new(),
            options,
            state: GlobalState::new(),
            pages: PageAllocator::new(),
            queues: QueueManager::new(),
            slow_aro: SlowAroManager::new(),
            purge: PurgePipeline::new(),
            async_purge: Mutex::new(None),
            events: Events::new(),
            gc_lock: RwLock::new(()),
            phase_times: Mutex::new(PhaseTimes::default()),
            last_reachability_stats: Mutex::new(WorkerStats::default()),
            _vm: PhantomData,
        })
    }

    // ---------------------------------------------------------------- state

    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn is_collecting(&self) -> bool {
        self.state.is_collecting()
    }

    pub fn is_locked_for_hash_tables(&self) -> bool {
        self.state.is_locked_for_hash_tables()
    }

    pub fn is_incremental_purge_pending(&self) -> bool {
        self.state.incremental_purge_in_progress.load(Ordering::Relaxed)
            || self.state.purge_is_required.load(Ordering::Relaxed)
    }

    pub fn is_incremental_unhash_pending(&self) -> bool {
        self.purge.unhash_cursor.load(Ordering::Relaxed) < self.purge.num_unreachable()
    }

    pub fn last_gc_duration(&self) -> Option<Duration> {
        self.state.last_gc_duration()
    }

    /// Object and reference counts of the last reachability pass.
    pub fn last_cycle_stats(&self) -> WorkerStats {
        *self.last_reachability_stats.lock().unwrap()
    }

    /// Live scratch page bytes held by the collector's caches.
    pub fn count_scratch_bytes(&self) -> usize {
        self.pages.count_bytes()
    }

    pub fn dump_memory_stats(&self) {
        log::info!(
            "gc memory: {} scratch page bytes, {} objects, {} clusters",
            self.pages.count_bytes(),
            self.table.num_objects(),
            self.clusters.num_allocated_clusters(),
        );
    }

    // -------------------------------------------------------- mutator API

    /// Blocks object creation/destruction against a running collection.
    pub fn mutator_guard(&self) -> MutatorGuard<'_> {
        MutatorGuard(self.gc_lock.read().unwrap())
    }

    /// Registers a freshly allocated object and publishes its index into
    /// the object header. Callers hold a [`MutatorGuard`].
    pub fn register_object(&self, object: ObjectRef) -> ObjectIndex {
        self.register_object_with_flags(object, ObjectFlags::NONE)
    }

    pub fn register_object_with_flags(&self, object: ObjectRef, flags: ObjectFlags) -> ObjectIndex {
        let index = self.table.register(object, flags);
        VM::set_object_index(object, index);
        index
    }

    pub fn add_to_root_set(&self, index: ObjectIndex) {
        self.table.index_to_item(index).set_flags(ObjectFlags::ROOT_SET);
    }

    pub fn remove_from_root_set(&self, index: ObjectIndex) {
        self.table.index_to_item(index).clear_flags(ObjectFlags::ROOT_SET);
    }

    pub fn set_keep_alive(&self, index: ObjectIndex, keep: bool) {
        let item = self.table.index_to_item(index);
        if keep {
            item.set_flags(ObjectFlags::KEEP_ALIVE);
        } else {
            item.clear_flags(ObjectFlags::KEEP_ALIVE);
        }
    }

    /// Flags an object as explicitly discarded: killable references to it
    /// are nulled during the next cycle and nothing but the root set keeps
    /// it alive.
    pub fn mark_as_garbage(&self, index: ObjectIndex) {
        let item = self.table.index_to_item(index);
        assert!(!item.is_root_set(), "cannot mark a root set object as garbage");
        item.set_flags(ObjectFlags::GARBAGE);
    }

    pub fn clear_garbage(&self, index: ObjectIndex) {
        self.table.index_to_item(index).clear_flags(ObjectFlags::GARBAGE);
    }

    pub fn create_cluster(&self, root: ObjectIndex) -> usize {
        self.clusters.create_cluster(&self.table, root)
    }

    pub fn add_to_cluster(&self, cluster: usize, member: ObjectIndex) {
        self.clusters.add_member(&self.table, cluster, member);
    }

    pub fn add_cluster_reference(&self, cluster: usize, referenced_root: ObjectIndex) {
        debug_assert!(self.table.index_to_item(referenced_root).is_cluster_root());
        self.clusters.add_referenced_cluster(cluster, referenced_root);
    }

    pub fn add_cluster_mutable_reference(&self, cluster: usize, object: ObjectIndex) {
        self.clusters.add_mutable_reference(cluster, object);
    }

    pub fn clusters_allocated(&self) -> usize {
        self.clusters.num_allocated_clusters()
    }

    /// Registers a slow reference-enumeration callback; the returned index
    /// goes into `SchemaBuilder::add_slow_callback`.
    pub fn register_slow_aro(&self, callback: crate::object::schema::AroFn, flags: AroFlags) -> u32 {
        self.slow_aro.register(callback, flags)
    }

    pub fn find_slow_aro(&self, callback: crate::object::schema::AroFn) -> Option<u32> {
        self.slow_aro.find(callback)
    }

    // ---------------------------------------------------------- collection

    /// Deletes all unreferenced objects, keeping objects with any of the
    /// passed keep flags. Blocks until the GC lock is available; with
    /// `full_purge` the entire destruction pipeline runs before returning,
    /// otherwise destruction is left to incremental ticks.
    pub fn collect_garbage(self: &Arc<Self>, keep_flags: KeepFlags, full_purge: bool) {
        let guard = self.gc_lock.write().unwrap();
        self.collect_garbage_with_lock(guard, keep_flags, full_purge);
    }

    /// Like [`Collector::collect_garbage`] but refuses instead of blocking
    /// when a mutator holds the GC lock. After
    /// `num_retries_before_forcing_gc` refusals the next attempt blocks.
    pub fn try_collect_garbage(self: &Arc<Self>, keep_flags: KeepFlags, full_purge: bool) -> bool {
        match self.gc_lock.try_write() {
            Ok(guard) => {
                self.collect_garbage_with_lock(guard, keep_flags, full_purge);
                true
            }
            Err(_) => {
                let attempts = self
                    .state
                    .num_attempts_since_last_gc
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                let retries = self.options.num_retries_before_forcing_gc;
                if retries > 0 && attempts > retries {
                    log::warn!("try_collect_garbage: forcing GC after {} skipped attempts", attempts);
                    let guard = self.gc_lock.write().unwrap();
                    self.collect_garbage_with_lock(guard, keep_flags, full_purge);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Incrementally purges garbage by routing BeginDestroy/FinishDestroy
    /// and deleting unreferenced objects, stopping when the budget runs
    /// out. Unreachability must not change on any object until the pending
    /// purge has completed, which is why a new cycle first drives this to
    /// the end.
    pub fn incremental_purge_garbage(self: &Arc<Self>, use_time_limit: bool, time_limit: Duration) {
        if !self.state.purge_is_required.load(Ordering::Relaxed)
            && !self.state.incremental_purge_in_progress.load(Ordering::Relaxed)
        {
            return;
        }
        self.state
            .incremental_purge_in_progress
            .store(true, Ordering::SeqCst);

        let mut completed = false;
        if !self.state.purge_is_required.load(Ordering::Relaxed) {
            // The purge finished last tick; this tick just closes it out.
            completed = true;
        } else {
            let was_collecting = self.state.is_collecting.swap(true, Ordering::Relaxed);
            let start_time = Instant::now();

            let mut time_limit_reached = false;
            if self.is_incremental_unhash_pending() {
                let t0 = Instant::now();
                time_limit_reached =
                    unhash_unreachable_objects(self, use_time_limit, time_limit, start_time);
                self.phase_times
                    .lock()
                    .unwrap()
                    .record(GcPhase::Unhash, t0.elapsed());
            }

            if !time_limit_reached {
                let t0 = Instant::now();
                completed = incremental_destroy_garbage(self, use_time_limit, time_limit, start_time);
                self.phase_times
                    .lock()
                    .unwrap()
                    .record(GcPhase::Purge, t0.elapsed());
            }

            if completed {
                self.events.post_purge.broadcast();
            }

            // With a time limit, one more tick closes the purge out.
            completed = completed && !use_time_limit;
            self.state.is_collecting.store(was_collecting, Ordering::Relaxed);
        }

        if completed {
            self.state
                .incremental_purge_in_progress
                .store(false, Ordering::SeqCst);
        }
    }

    /// Final collection at process exit: every object, root set included,
    /// is torn down and freed, and the purge thread is stopped.
    pub fn shutdown(self: &Arc<Self>) {
        log::debug!("gc shutdown: exit purge over {} objects", self.table.num_objects());
        self.state.exit_purge.store(true, Ordering::Relaxed);

        // Finish whatever the last cycle left behind first.
        self.incremental_purge_garbage(false, Duration::ZERO);

        self.clusters.dissolve_flagged_clusters(&self.table, true);

        let num = self.table.num_objects();
        for raw in 0..num {
            let item = self.table.index_to_item(ObjectIndex::from_usize(raw));
            if !item.object().is_null() {
                item.clear_flags(ObjectFlags::ROOT_SET | ObjectFlags::KEEP_ALIVE);
                item.set_flags(ObjectFlags::UNREACHABLE);
            }
        }

        let unreachable = gather_unreachable_objects(self, false);
        self.purge.install_unreachable(unreachable);
        unhash_unreachable_objects(self, false, Duration::ZERO, Instant::now());
        self.state.purge_is_required.store(true, Ordering::Relaxed);
        self.incremental_purge_garbage(false, Duration::ZERO);

        if let Some(mut purge) = self.async_purge.lock().unwrap().take() {
            purge.stop();
        }
        ContextPoolScope.cleanup();
    }

    // ------------------------------------------------------------ internals

    pub(crate) fn should_force_single_threaded(&self) -> bool {
        !self.options.allow_parallel || num_cpus::get() < 2 || self.options.threads < 2
    }

    fn collect_garbage_with_lock(
        self: &Arc<Self>,
        guard: RwLockWriteGuard<'_, ()>,
        keep_flags: KeepFlags,
        full_purge: bool,
    ) {
        let cycle_start = Instant::now();
        self.state.num_attempts_since_last_gc.store(0, Ordering::Relaxed);

        {
            let was_collecting = self.state.is_collecting.swap(true, Ordering::Relaxed);
            debug_assert!(!was_collecting, "re-entrant collection");

            log::info!("collecting garbage");
            self.events.pre_collect.broadcast();
            self.phase_times.lock().unwrap().reset();

            // Make sure a previous incremental purge has finished; the mark
            // phase must not see half-destroyed objects.
            if self.is_incremental_purge_pending() {
                self.incremental_purge_garbage(false, Duration::ZERO);
            }

            {
                self.state
                    .is_collecting_and_locking
                    .store(true, Ordering::Relaxed);
                debug_assert!(!self.state.incremental_purge_in_progress.load(Ordering::Relaxed));
                debug_assert!(!self.state.purge_is_required.load(Ordering::Relaxed));

                self.maybe_verify_assumptions(full_purge);

                let found_garbage_ref = self.perform_reachability_analysis(keep_flags, false);

                if found_garbage_ref && self.options.garbage_reference_tracking > 0 {
                    let t0 = Instant::now();
                    self.perform_reachability_analysis(keep_flags, true);
                    log::info!(
                        "{:.2} ms for GC rerun to track garbage references (garbage_reference_tracking={})",
                        t0.elapsed().as_secs_f64() * 1000.0,
                        self.options.garbage_reference_tracking,
                    );
                }

                // Tracing may have nulled cluster entries in place; those
                // clusters can no longer vouch for their references.
                if self.clusters.clusters_need_dissolving() {
                    let t0 = Instant::now();
                    let dissolved = self.clusters.dissolve_flagged_clusters(&self.table, false);
                    log::debug!(
                        "{:.3} ms for dissolving {} clusters",
                        t0.elapsed().as_secs_f64() * 1000.0,
                        dissolved,
                    );
                }

                dump_garbage_referencers(self);

                let t0 = Instant::now();
                let parallel = !self.should_force_single_threaded();
                let unreachable = gather_unreachable_objects(self, parallel);
                self.purge.install_unreachable(unreachable);
                self.phase_times.lock().unwrap().record(GcPhase::Gather, t0.elapsed());

                // Gathering can only add unreachable objects (dead cluster
                // members), so weak clearing observes the final verdicts.
                let t0 = Instant::now();
                clear_weak_references(self);
                self.phase_times.lock().unwrap().record(GcPhase::ClearWeak, t0.elapsed());

                if full_purge {
                    ContextPoolScope.cleanup();
                }

                self.state
                    .is_collecting_and_locking
                    .store(false, Ordering::Relaxed);
            }

            // BeginDestroy, FinishDestroy and destructors may register and
            // look up objects; let mutators back in.
            drop(guard);

            self.events.post_reachability.broadcast();

            if full_purge || !self.options.incremental_begin_destroy {
                unhash_unreachable_objects(self, false, Duration::ZERO, Instant::now());
            }

            self.state.purge_is_required.store(true, Ordering::Relaxed);

            if full_purge {
                self.incremental_purge_garbage(false, Duration::ZERO);
            }

            self.state.is_collecting.store(false, Ordering::Relaxed);
        }

        self.events.post_collect.broadcast();
        self.phase_times.lock().unwrap().log_summary();

        *self.state.last_gc_time.borrow_mut() = Some(Instant::now());
        *self.state.last_gc_duration.borrow_mut() = Some(cycle_start.elapsed());
    }

    /// Mark + parallel trace. Returns whether any reference kept a
    /// garbage-flagged object alive (which triggers the attribution rerun).
    fn perform_reachability_analysis(self: &Arc<Self>, keep_flags: KeepFlags, is_rerun: bool) -> bool {
        let parallel = !self.should_force_single_threaded() && !is_rerun;
        let with_kill = self.options.reference_elimination;

        let t0 = Instant::now();
        let initial_objects = mark_objects_as_unreachable(self, keep_flags, parallel, is_rerun);
        self.phase_times.lock().unwrap().record(GcPhase::Mark, t0.elapsed());

        let t0 = Instant::now();
        let pool = ContextPoolScope;
        let mut context = pool.allocate_from_pool();
        context.set_initial_objects_unpadded(initial_objects);

        let mut roots = RootSet::default();
        VM::enumerate_roots(&mut roots);
        context.initial_native_references = roots.native_references;

        let env = TraceEnv::<VM> {
            table: &self.table,
            clusters: &self.clusters,
            pages: &self.pages,
            queues: &self.queues,
            slow_aro: &self.slow_aro,
            track_garbage: is_rerun && self.options.garbage_reference_tracking > 0,
            _vm: PhantomData,
        };

        if is_rerun {
            // The attribution pass runs serial and unbatched so every
            // reference knows its referencer.
            let worker = context.worker_index();
            context.objects_to_serialize.attach(worker, &self.pages);
            if with_kill {
                collect_references_direct::<VM, true>(env, &mut context);
            } else {
                collect_references_direct::<VM, false>(env, &mut context);
            }
            context.objects_to_serialize.detach();
        } else if parallel {
            self.slow_aro.setup_worker_queues(&self.pages);
            let num_workers = self.options.threads;
            if with_kill {
                process_async(&self.queues, &self.pages, num_workers, &mut context, |c, driving| {
                    collect_references::<VM, true, true>(env, c, driving)
                });
            } else {
                process_async(&self.queues, &self.pages, num_workers, &mut context, |c, driving| {
                    collect_references::<VM, true, false>(env, c, driving)
                });
            }
            self.slow_aro.reset_worker_queues(&self.pages);
        } else {
            let worker = context.worker_index();
            context.objects_to_serialize.attach(worker, &self.pages);
            if with_kill {
                collect_references::<VM, false, true>(env, &mut context, true);
            } else {
                collect_references::<VM, false, false>(env, &mut context, true);
            }
            context.objects_to_serialize.detach();
        }

        let elapsed = t0.elapsed();
        self.phase_times
            .lock()
            .unwrap()
            .record(GcPhase::Reachability, elapsed);

        let stats = context.stats;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        log::info!(
            "{:.2} ms for GC - {} refs/ms while processing {} references from {} objects with {} clusters",
            elapsed_ms,
            (stats.num_references as f64 / elapsed_ms.max(0.001)) as u64,
            stats.num_references,
            stats.num_objects,
            self.clusters.num_allocated_clusters(),
        );

        *self.last_reachability_stats.lock().unwrap() = stats;
        pool.return_to_pool(context);

        // Trim scratch pages down to each worker's guaranteed minimum now
        // that the cycle's tracing is done.
        self.pages
            .trim_worker_caches(2 + self.slow_aro.num_aros());

        stats.found_garbage_ref
    }

    fn maybe_verify_assumptions(&self, full_purge: bool) {
        let chance = self.options.verify_assumptions_chance;
        let sampled = chance > 0.0 && rand::random::<f64>() < chance;
        let forced = cfg!(feature = "sanity");
        if !(sampled || forced || (full_purge && chance >= 1.0)) {
            return;
        }
        let t0 = Instant::now();
        if self.clusters.num_allocated_clusters() > 0 {
            self.clusters.verify_assumptions(&self.table);
        }
        log::debug!(
            "{:.3} ms for verifying gc assumptions",
            t0.elapsed().as_secs_f64() * 1000.0
        );
    }
}
