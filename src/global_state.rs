//! Process-visible collection state: the flags other subsystems poll and
//! the bookkeeping the incremental purge pipeline resumes from.

use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct GlobalState {
    /// A collection cycle (mark through purge) is running.
    pub(crate) is_collecting: AtomicBool,
    /// The reachability window in which object hash tables are locked.
    pub(crate) is_collecting_and_locking: AtomicBool,
    /// A mark phase completed and its garbage has not been fully purged.
    pub(crate) purge_is_required: AtomicBool,
    /// An incremental purge has started and not yet completed.
    pub(crate) incremental_purge_in_progress: AtomicBool,
    /// Unhash (BeginDestroy) is currently running.
    pub(crate) unhash_in_progress: AtomicBool,
    /// FinishDestroy has been routed to every unreachable object; actual
    /// destruction may proceed.
    pub(crate) finish_destroy_routed: AtomicBool,
    /// The purge cursors must be reset before the next purge tick.
    pub(crate) purge_cursor_needs_reset: AtomicBool,
    /// Shutdown purge: the sweep widens to the whole table and ignores
    /// the root set.
    pub(crate) exit_purge: AtomicBool,
    /// try_collect_garbage skips since the last successful collection.
    pub(crate) num_attempts_since_last_gc: AtomicUsize,
    /// Live objects counted by the last mark phase.
    pub(crate) object_count_during_last_mark: AtomicUsize,
    /// Start of the in-flight cycle; accessed only between phases.
    pub(crate) gc_start_time: AtomicRefCell<Option<Instant>>,
    pub(crate) last_gc_time: AtomicRefCell<Option<Instant>>,
    pub(crate) last_gc_duration: AtomicRefCell<Option<Duration>>,
}

impl GlobalState {
    pub(crate) fn new() -> GlobalState {
        GlobalState {
            is_collecting: AtomicBool::new(false),
            is_collecting_and_locking: AtomicBool::new(false),
            purge_is_required: AtomicBool::new(false),
            incremental_purge_in_progress: AtomicBool::new(false),
            unhash_in_progress: AtomicBool::new(false),
            finish_destroy_routed: AtomicBool::new(false),
            purge_cursor_needs_reset: AtomicBool::new(true),
            exit_purge: AtomicBool::new(false),
            num_attempts_since_last_gc: AtomicUsize::new(0),
            object_count_during_last_mark: AtomicUsize::new(0),
            gc_start_time: AtomicRefCell::new(None),
            last_gc_time: AtomicRefCell::new(None),
            last_gc_duration: AtomicRefCell::new(None),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.is_collecting.load(Ordering::Relaxed)
    }

    pub fn is_locked_for_hash_tables(&self) -> bool {
        self.is_collecting_and_locking.load(Ordering::Relaxed)
    }

    pub fn last_gc_time(&self) -> Option<Instant> {
        *self.last_gc_time.borrow()
    }

    pub fn last_gc_duration(&self) -> Option<Duration> {
        *self.last_gc_duration.borrow()
    }
}
