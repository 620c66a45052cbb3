//! The destruction pipeline: a time-sliced FinishDestroy sweep with a
//! deferred retry list, then destructor + free on a dedicated purge thread
//! (thread-safe classes) and the driving thread (the rest).

use crate::collector::Collector;
use crate::object::flags::ObjectFlags;
use crate::object::table::{ObjectIndex, ObjectItem};
use crate::util::ObjectRef;
use crate::vm::Binding;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Wall-clock poll granularities. Destroy and FinishDestroy calls are
/// cheap, so polling the clock every iteration would dominate.
const TIME_POLL_GRANULARITY_FOR_DESTROY: usize = 10;
const TIME_POLL_GRANULARITY_FOR_DELETION: usize = 100;

/// Base stall budget for objects not ready for FinishDestroy, extended once
/// by the configured additional time before escalating.
const MAX_TIME_FOR_FINISH_DESTROY: Duration = Duration::from_secs(10);

/// The value a destroyed entry leaves behind in the unreachable list.
const DESTROYED: i32 = -1;

/// Per-cycle destruction state saved across incremental ticks.
pub(crate) struct PurgePipeline {
    /// The unreachable set assembled by gather, shared with the purge
    /// thread. Entries are object indices, overwritten with DESTROYED as
    /// they go.
    unreachable: Mutex<Arc<Vec<AtomicI32>>>,
    /// Cursor of the incremental unhash (BeginDestroy) pass.
    pub(crate) unhash_cursor: AtomicUsize,
    /// Driving-thread cursors and the deferred-destruction list.
    pub(crate) progress: Mutex<PurgeProgress>,
}

#[derive(Default)]
pub(crate) struct PurgeProgress {
    /// Cursor of the first FinishDestroy sweep.
    pub finish_cursor: usize,
    /// Objects that were not ready for FinishDestroy, revisited on
    /// subsequent passes.
    pub pending_destruction: Vec<ObjectIndex>,
    /// The stall budget was extended once already.
    pub finish_destroy_time_extended: bool,
    pub first_object_not_ready: Option<ObjectRef>,
    pub start_pending_count: usize,
    /// The warn-and-continue path logged its once-per-cycle warning.
    pub warning_displayed: bool,
    /// Driving-thread destruction cursor (objects the purge thread could
    /// not destroy).
    pub main_cursor: usize,
    pub num_destroyed_on_main: i32,
    /// Unreachable count snapshot for single-threaded completion checks.
    pub last_unreachable_count: usize,
}

impl PurgePipeline {
    pub(crate) fn new() -> PurgePipeline {
        PurgePipeline {
            unreachable: Mutex::new(Arc::new(Vec::new())),
            unhash_cursor: AtomicUsize::new(0),
            progress: Mutex::new(PurgeProgress::default()),
        }
    }

    pub(crate) fn unreachable_list(&self) -> Arc<Vec<AtomicI32>> {
        self.unreachable.lock().unwrap().clone()
    }

    /// Installs a freshly gathered unreachable set and rewinds every cursor.
    /// Only legal when the previous purge has fully completed.
    pub(crate) fn install_unreachable(&self, indices: Vec<ObjectIndex>) {
        let list: Vec<AtomicI32> = indices
            .into_iter()
            .map(|index| AtomicI32::new(index.as_u32() as i32))
            .collect();
        *self.unreachable.lock().unwrap() = Arc::new(list);
        self.unhash_cursor.store(0, Ordering::Relaxed);
        let mut progress = self.progress.lock().unwrap();
        debug_assert!(progress.pending_destruction.is_empty());
        *progress = PurgeProgress::default();
    }

    pub(crate) fn num_unreachable(&self) -> usize {
        self.unreachable.lock().unwrap().len()
    }
}

/// Cross-thread state of the destructor stage.
pub(crate) struct PurgeSync {
    begin: Mutex<bool>,
    begin_cv: Condvar,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    stop: AtomicBool,
    /// Purge-thread cursor; the driving thread owns it in single-threaded
    /// mode.
    worker_cursor: AtomicUsize,
    /// Objects deferred to the driving thread, published with release so
    /// the driving thread sees the list writes that preceded them.
    num_to_destroy_on_main: AtomicI32,
    destroyed_since_mark: AtomicI32,
}

impl PurgeSync {
    fn new() -> PurgeSync {
        PurgeSync {
            begin: Mutex::new(false),
            begin_cv: Condvar::new(),
            finished: Mutex::new(true),
            finished_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            worker_cursor: AtomicUsize::new(0),
            num_to_destroy_on_main: AtomicI32::new(0),
            destroyed_since_mark: AtomicI32::new(0),
        }
    }

    fn set_finished(&self) {
        let mut finished = self.finished.lock().unwrap();
        *finished = true;
        self.finished_cv.notify_all();
    }

    fn is_finished_flag(&self) -> bool {
        *self.finished.lock().unwrap()
    }
}

/// Destroys unreachable objects, on a dedicated below-normal-priority
/// thread when multithreaded destruction is on.
pub(crate) struct AsyncPurge {
    thread: Option<JoinHandle<()>>,
    sync: Arc<PurgeSync>,
    multithreaded: bool,
}

impl AsyncPurge {
    pub(crate) fn new<VM: Binding>(collector: &Arc<Collector<VM>>, multithreaded: bool) -> AsyncPurge {
        let sync = Arc::new(PurgeSync::new());
        let thread = if multithreaded {
            let sync = sync.clone();
            let collector = collector.clone();
            Some(
                std::thread::Builder::new()
                    .name("gc-async-purge".into())
                    .spawn(move || purge_thread_main::<VM>(collector, sync))
                    .expect("failed to spawn the async purge thread"),
            )
        } else {
            None
        };
        AsyncPurge {
            thread,
            sync,
            multithreaded,
        }
    }

    pub(crate) fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }

    /// True when every object of the current purge has been destroyed, on
    /// both the purge thread and the driving thread.
    pub(crate) fn is_finished<VM: Binding>(&self, collector: &Collector<VM>) -> bool {
        let progress = collector.purge.progress.lock().unwrap();
        let deferred_done = self.sync.num_to_destroy_on_main.load(Ordering::Acquire)
            == progress.num_destroyed_on_main;
        if self.multithreaded {
            self.sync.is_finished_flag() && deferred_done
        } else {
            self.sync.worker_cursor.load(Ordering::Relaxed) >= progress.last_unreachable_count
                && deferred_done
        }
    }

    /// [driving thread] Starts destroying the current unreachable list.
    pub(crate) fn begin_purge<VM: Binding>(&self, collector: &Collector<VM>) {
        assert!(self.is_finished(collector), "purge restarted while running");

        self.sync.worker_cursor.store(0, Ordering::Relaxed);
        self.sync.destroyed_since_mark.store(0, Ordering::Relaxed);
        self.sync.num_to_destroy_on_main.store(0, Ordering::Relaxed);
        {
            let mut progress = collector.purge.progress.lock().unwrap();
            progress.main_cursor = 0;
            progress.num_destroyed_on_main = 0;
        }
        *self.sync.finished.lock().unwrap() = false;

        let mut begin = self.sync.begin.lock().unwrap();
        *begin = true;
        self.sync.begin_cv.notify_one();
    }

    /// [driving thread] Advances destruction inside the time slice. In
    /// single-threaded mode this also runs the purge thread's share.
    pub(crate) fn tick_purge<VM: Binding>(
        &self,
        collector: &Collector<VM>,
        use_time_limit: bool,
        time_limit: Duration,
        start_time: Instant,
    ) {
        let mut can_start_main_objects = true;
        if !self.multithreaded {
            collector.purge.progress.lock().unwrap().last_unreachable_count =
                collector.purge.num_unreachable();
            can_start_main_objects = tick_destroy_objects::<VM, false>(
                collector,
                &self.sync,
                use_time_limit,
                time_limit,
                start_time,
            );
        }
        if can_start_main_objects {
            loop {
                let finished_main = tick_destroy_main_thread_objects::<VM>(
                    collector,
                    &self.sync,
                    use_time_limit,
                    time_limit,
                    start_time,
                );
                if !self.multithreaded && finished_main {
                    self.sync.set_finished();
                }
                if use_time_limit || self.is_finished(collector) {
                    break;
                }
            }
        }
    }

    pub(crate) fn objects_destroyed_since_mark<VM: Binding>(
        &self,
        collector: &Collector<VM>,
    ) -> i32 {
        let progress = collector.purge.progress.lock().unwrap();
        self.sync.destroyed_since_mark.load(Ordering::Relaxed)
            - self.sync.num_to_destroy_on_main.load(Ordering::Relaxed)
            + progress.num_destroyed_on_main
    }

    pub(crate) fn reset_objects_destroyed_since_mark(&self) {
        self.sync.destroyed_since_mark.store(0, Ordering::Relaxed);
    }

    pub(crate) fn verify_all_objects_destroyed<VM: Binding>(&self, collector: &Collector<VM>) {
        for entry in collector.purge.unreachable_list().iter() {
            let raw = entry.load(Ordering::Relaxed);
            assert!(
                raw == DESTROYED,
                "object {} has not been destroyed during async purge",
                raw
            );
        }
    }

    pub(crate) fn stop(&mut self) {
        self.sync.stop.store(true, Ordering::Relaxed);
        self.sync.begin_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AsyncPurge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// [purge thread] Waits for purges and destroys the thread-safe share.
fn purge_thread_main<VM: Binding>(collector: Arc<Collector<VM>>, sync: Arc<PurgeSync>) {
    loop {
        let begun = {
            let begin = sync.begin.lock().unwrap();
            let (mut begin, _timeout) = sync
                .begin_cv
                .wait_timeout_while(begin, Duration::from_millis(15), |b| {
                    !*b && !sync.stop.load(Ordering::Relaxed)
                })
                .unwrap();
            let begun = *begin;
            *begin = false;
            begun
        };

        if sync.stop.load(Ordering::Relaxed) {
            break;
        }
        if begun {
            tick_destroy_objects::<VM, true>(
                &collector,
                &sync,
                false,
                Duration::ZERO,
                Instant::now(),
            );
            sync.set_finished();
        }
    }
    sync.set_finished();
}

/// [purge/driving thread] Destroys unreachable objects, deferring those
/// whose class is not thread-safe to the driving thread in multithreaded
/// mode. Returns whether the sweep finished.
fn tick_destroy_objects<VM: Binding, const MULTITHREADED: bool>(
    collector: &Collector<VM>,
    sync: &PurgeSync,
    use_time_limit: bool,
    time_limit: Duration,
    start_time: Instant,
) -> bool {
    let list = collector.purge.unreachable_list();
    let mut processed = 0usize;
    let mut finished = true;

    // Avoid an atomic add per deferred object: only this thread writes the
    // counter, so a plain store publishes it.
    let mut local_num_to_main = sync.num_to_destroy_on_main.load(Ordering::Acquire);

    while sync.worker_cursor.load(Ordering::Relaxed) < list.len() {
        let cursor = sync.worker_cursor.load(Ordering::Relaxed);
        let raw = list[cursor].load(Ordering::Relaxed);
        debug_assert!(raw >= 0, "entry destroyed twice");
        let index = ObjectIndex::new(raw as u32);
        let item = collector.table.index_to_item(index);
        debug_assert!(item.is_unreachable());
        let object = item.object();
        debug_assert!(
            item.has_all_flags(ObjectFlags::BEGUN_DESTROY | ObjectFlags::FINISHED_DESTROY),
            "object {} reached destruction without FinishDestroy",
            object
        );

        if !MULTITHREADED || VM::is_destruction_thread_safe(object) {
            destroy_and_free::<VM>(collector, index, object);
            list[cursor].store(DESTROYED, Ordering::Release);
        } else {
            local_num_to_main += 1;
            sync.num_to_destroy_on_main
                .store(local_num_to_main, Ordering::Release);
        }
        processed += 1;
        sync.destroyed_since_mark.fetch_add(1, Ordering::Relaxed);
        sync.worker_cursor.store(cursor + 1, Ordering::Relaxed);

        // Time slicing only applies when running on the driving thread.
        if !MULTITHREADED
            && use_time_limit
            && processed == TIME_POLL_GRANULARITY_FOR_DELETION
            && sync.worker_cursor.load(Ordering::Relaxed) < list.len()
        {
            processed = 0;
            if start_time.elapsed() > time_limit {
                finished = false;
                break;
            }
        }
    }

    finished
}

/// [driving thread] Destroys the objects the purge thread deferred,
/// batching one table-lock acquisition across the whole slice.
fn tick_destroy_main_thread_objects<VM: Binding>(
    collector: &Collector<VM>,
    sync: &PurgeSync,
    use_time_limit: bool,
    time_limit: Duration,
    start_time: Instant,
) -> bool {
    let list = collector.purge.unreachable_list();
    let mut progress = collector.purge.progress.lock().unwrap();
    let mut processed = 0usize;
    let mut finished = true;

    let _table_guard = collector.table.lock_internal();

    // The number may keep growing; the next tick catches up.
    let local_num_to_destroy = sync.num_to_destroy_on_main.load(Ordering::Acquire);

    while progress.num_destroyed_on_main < local_num_to_destroy
        && progress.main_cursor < list.len()
    {
        let cursor = progress.main_cursor;
        let raw = list[cursor].load(Ordering::Relaxed);
        if raw >= 0 {
            let index = ObjectIndex::new(raw as u32);
            let item = collector.table.index_to_item(index);
            let object = item.object();
            list[cursor].store(DESTROYED, Ordering::Relaxed);
            VM::destroy(object);
            VM::free_object(object);
            collector.table.deregister(index);
            processed += 1;
            progress.num_destroyed_on_main += 1;

            if use_time_limit
                && processed == TIME_POLL_GRANULARITY_FOR_DELETION
                && progress.num_destroyed_on_main < local_num_to_destroy
            {
                processed = 0;
                if start_time.elapsed() > time_limit {
                    finished = false;
                    break;
                }
            }
        }
        progress.main_cursor += 1;
    }

    debug_assert!(!finished || progress.num_destroyed_on_main == local_num_to_destroy);
    finished
}

fn destroy_and_free<VM: Binding>(collector: &Collector<VM>, index: ObjectIndex, object: ObjectRef) {
    // Can't hold the lock for a whole batch here: destructors may take a
    // while and mutators block on registration meanwhile.
    {
        let _guard = collector.table.lock_internal();
        VM::destroy(object);
    }
    VM::free_object(object);
    collector.table.deregister(index);
}

fn conditional_finish_destroy<VM: Binding>(item: &ObjectItem, object: ObjectRef) {
    if !item.has_any_flags(ObjectFlags::FINISHED_DESTROY) {
        item.set_flags(ObjectFlags::FINISHED_DESTROY);
        VM::finish_destroy(object);
    }
}

/// Routes FinishDestroy to every unreachable object (deferring the
/// not-ready ones), then drives the destructor stage. Returns whether the
/// whole purge completed.
pub(crate) fn incremental_destroy_garbage<VM: Binding>(
    collector: &Arc<Collector<VM>>,
    use_time_limit: bool,
    time_limit: Duration,
    start_time: Instant,
) -> bool {
    let multithreaded =
        collector.options.multithreaded_destruction && !collector.should_force_single_threaded();

    {
        let mut purge = collector.async_purge.lock().unwrap();
        match purge.as_ref() {
            None => *purge = Some(AsyncPurge::new(collector, multithreaded)),
            Some(existing) if existing.is_multithreaded() != multithreaded => {
                assert!(existing.is_finished(collector));
                *purge = Some(AsyncPurge::new(collector, multithreaded));
            }
            Some(_) => {}
        }
    }

    let mut completed = false;
    let mut time_limit_reached = false;
    let destroy_start = Instant::now();
    let state = &collector.state;

    if !state.finish_destroy_routed.load(Ordering::Relaxed) {
        let list = collector.purge.unreachable_list();
        debug_assert!(collector.purge.unhash_cursor.load(Ordering::Relaxed) >= list.len());

        let mut time_poll_counter = 0usize;

        if state.purge_cursor_needs_reset.load(Ordering::Relaxed) {
            collector.purge.progress.lock().unwrap().finish_cursor = 0;
            state.purge_cursor_needs_reset.store(false, Ordering::Relaxed);
        }

        // First round: try FinishDestroy on everything, deferring objects
        // whose asynchronous cleanup has not completed. Just polling
        // readiness may advance the release, so iteration must not block.
        {
            let mut progress = collector.purge.progress.lock().unwrap();
            while progress.finish_cursor < list.len() {
                let raw = list[progress.finish_cursor].load(Ordering::Relaxed);
                let index = ObjectIndex::new(raw as u32);
                let item = collector.table.index_to_item(index);
                debug_assert!(item.is_unreachable());
                debug_assert!(
                    item.has_any_flags(ObjectFlags::BEGUN_DESTROY)
                        && !item.has_any_flags(ObjectFlags::FINISHED_DESTROY)
                );
                let object = item.object();

                if VM::is_ready_for_finish_destroy(object) {
                    conditional_finish_destroy::<VM>(item, object);
                } else {
                    progress.pending_destruction.push(index);
                }

                // Advance before testing the budget so the same object is
                // not processed again next tick.
                progress.finish_cursor += 1;

                let poll = time_poll_counter % TIME_POLL_GRANULARITY_FOR_DESTROY == 0;
                time_poll_counter += 1;
                if use_time_limit && poll && start_time.elapsed() > time_limit {
                    time_limit_reached = true;
                    break;
                }
            }
        }

        let finish_cursor_done =
            collector.purge.progress.lock().unwrap().finish_cursor >= list.len();
        if finish_cursor_done {
            time_limit_reached |= retry_pending_destruction::<VM>(
                collector,
                use_time_limit,
                time_limit,
                start_time,
                &mut time_poll_counter,
            );

            let mut progress = collector.purge.progress.lock().unwrap();
            if progress.pending_destruction.is_empty() {
                if progress.finish_destroy_time_extended {
                    let message = format!(
                        "additional time was required to finish routing FinishDestroy, spent {:.2}s on routing FinishDestroy to {} objects. 1st object not ready: {:?}",
                        start_time.elapsed().as_secs_f64(),
                        progress.start_pending_count,
                        progress.first_object_not_ready,
                    );
                    log::warn!("{}", message);
                    drop(progress);
                    collector.events.finish_destroy_time_extended.broadcast(&message);
                } else {
                    drop(progress);
                }

                let mut progress = collector.purge.progress.lock().unwrap();
                progress.pending_destruction = Vec::with_capacity(256);
                progress.warning_displayed = false;
                progress.finish_destroy_time_extended = false;
                state.finish_destroy_routed.store(true, Ordering::Relaxed);
                state.purge_cursor_needs_reset.store(true, Ordering::Relaxed);
            }
        }
    }

    if state.finish_destroy_routed.load(Ordering::Relaxed) && !time_limit_reached {
        let purge = collector.async_purge.lock().unwrap();
        let purge = purge.as_ref().unwrap();

        if state.purge_cursor_needs_reset.load(Ordering::Relaxed) {
            purge.begin_purge(collector);
            // Keep the stat cursors intact; only the reset flag flips.
            state.purge_cursor_needs_reset.store(false, Ordering::Relaxed);
        }

        purge.tick_purge(collector, use_time_limit, time_limit, start_time);

        if purge.is_finished(collector) {
            #[cfg(any(debug_assertions, feature = "sanity"))]
            purge.verify_all_objects_destroyed(collector);

            completed = true;
            state.finish_destroy_routed.store(false, Ordering::Relaxed);
            state.purge_is_required.store(false, Ordering::Relaxed);
            state.purge_cursor_needs_reset.store(true, Ordering::Relaxed);

            let purged = purge.objects_destroyed_since_mark(collector);
            let during_mark = state.object_count_during_last_mark.load(Ordering::Relaxed) as i32;
            log::info!(
                "GC purged {} objects ({} -> {}) in {:.3} ms",
                purged,
                during_mark,
                during_mark - purged,
                destroy_start.elapsed().as_secs_f64() * 1000.0,
            );
            purge.reset_objects_destroyed_since_mark();
        }
    }

    if use_time_limit && !completed {
        let progress = collector.purge.progress.lock().unwrap();
        log::debug!(
            "{:.3} ms for incrementally purging unreachable objects (FinishDestroyed: {}, Destroyed: {} / {})",
            destroy_start.elapsed().as_secs_f64() * 1000.0,
            progress.finish_cursor,
            collector
                .async_purge
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.sync.destroyed_since_mark.load(Ordering::Relaxed))
                .unwrap_or(0),
            collector.purge.num_unreachable(),
        );
    }

    completed
}

/// Loops over the deferred list removing objects as they become ready.
/// With a time limit one full pass is enough per tick; without one, the
/// loop waits for asynchronous releases, escalating when no progress is
/// made past the (extensible) stall budget. Returns whether the time limit
/// was reached.
fn retry_pending_destruction<VM: Binding>(
    collector: &Arc<Collector<VM>>,
    use_time_limit: bool,
    time_limit: Duration,
    start_time: Instant,
    time_poll_counter: &mut usize,
) -> bool {
    let mut max_time_for_finish_destroy = MAX_TIME_FOR_FINISH_DESTROY;
    let mut finish_destroy_poll_counter = 0usize;
    let mut time_limit_reached = false;

    let mut progress_guard = collector.purge.progress.lock().unwrap();
    let progress = &mut *progress_guard;
    if progress.start_pending_count == 0 {
        progress.start_pending_count = progress.pending_destruction.len();
    }
    let mut last_loop_count = progress.pending_destruction.len();

    while !progress.pending_destruction.is_empty() {
        let mut current = 0usize;
        while current < progress.pending_destruction.len() {
            let index = progress.pending_destruction[current];
            let item = collector.table.index_to_item(index);
            let object = item.object();
            debug_assert!(!object.is_null() && item.is_unreachable());
            debug_assert!(
                item.has_any_flags(ObjectFlags::BEGUN_DESTROY)
                    && !item.has_any_flags(ObjectFlags::FINISHED_DESTROY)
            );

            if VM::is_ready_for_finish_destroy(object) {
                conditional_finish_destroy::<VM>(item, object);
                // Swap with the last entry; cheaper than a shifting remove
                // and the order was never meaningful.
                progress.pending_destruction.swap_remove(current);
            } else {
                current += 1;
            }

            let poll = *time_poll_counter % TIME_POLL_GRANULARITY_FOR_DESTROY == 0;
            *time_poll_counter += 1;
            if use_time_limit && poll && start_time.elapsed() > time_limit {
                time_limit_reached = true;
                break;
            }
        }

        if use_time_limit {
            // A full pass over the leftovers is enough for this tick; the
            // stragglers are likely waiting on another subsystem anyway.
            break;
        }

        if !progress.pending_destruction.is_empty() {
            let poll = finish_destroy_poll_counter % TIME_POLL_GRANULARITY_FOR_DESTROY == 0;
            finish_destroy_poll_counter += 1;

            if poll
                && !progress.finish_destroy_time_extended
                && start_time.elapsed() > max_time_for_finish_destroy
                && collector.options.additional_finish_destroy_time > 0.0
            {
                max_time_for_finish_destroy =
                    Duration::from_secs_f64(collector.options.additional_finish_destroy_time);
                progress.finish_destroy_time_extended = true;
                progress.first_object_not_ready = progress
                    .pending_destruction
                    .first()
                    .map(|index| collector.table.index_to_item(*index).object());
            } else if poll
                && last_loop_count == progress.pending_destruction.len()
                && start_time.elapsed() > max_time_for_finish_destroy
            {
                if collector.options.time_limit_on_pending_destroy {
                    report_stalled_finish_destroy::<VM>(collector, &progress.pending_destruction);
                    panic!(
                        "spent too much time waiting for FinishDestroy for {} object(s), check log for details",
                        progress.pending_destruction.len(),
                    );
                } else if !progress.warning_displayed {
                    log::warn!(
                        "spent more than {:.2}s on routing FinishDestroy to objects (objects in queue: {}) - skipping fatal, timeout is disabled",
                        max_time_for_finish_destroy.as_secs_f64(),
                        progress.pending_destruction.len(),
                    );
                    progress.warning_displayed = true;
                }
            }

            // Give the subsystems holding the releases some time.
            std::thread::yield_now();
        }

        last_loop_count = progress.pending_destruction.len();
    }

    time_limit_reached
}

fn report_stalled_finish_destroy<VM: Binding>(
    collector: &Arc<Collector<VM>>,
    pending: &[ObjectIndex],
) {
    log::warn!(
        "spent too long routing FinishDestroy to objects (objects in queue: {})",
        pending.len()
    );
    for (position, index) in pending.iter().enumerate() {
        let object = collector.table.index_to_item(*index).object();
        let ready = VM::is_ready_for_finish_destroy(object);
        log::warn!(
            "  [{}]: {} ({}), is_ready_for_finish_destroy: {}",
            position,
            object,
            VM::class_of(object).name,
            ready
        );
    }
}
