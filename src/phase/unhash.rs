//! Incremental unhash: routes BeginDestroy to every object in the
//! unreachable list, time-sliced against a caller budget. BeginDestroy runs
//! at most once per object; the flags word tracks it.

use crate::collector::Collector;
use crate::object::flags::ObjectFlags;
use crate::object::table::ObjectIndex;
use crate::vm::Binding;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

const TIME_POLL_GRANULARITY: usize = 10;

/// Routes BeginDestroy from the saved cursor until done or out of budget.
/// Returns whether the time limit was reached.
pub(crate) fn unhash_unreachable_objects<VM: Binding>(
    collector: &Collector<VM>,
    use_time_limit: bool,
    time_limit: Duration,
    start_time: Instant,
) -> bool {
    collector.state.unhash_in_progress.store(true, Ordering::Relaxed);

    let unreachable = collector.purge.unreachable_list();
    let first_iteration = collector.purge.unhash_cursor.load(Ordering::Relaxed) == 0;
    let mut items = 0usize;
    let mut time_poll_counter = 0usize;

    while collector.purge.unhash_cursor.load(Ordering::Relaxed) < unreachable.len() {
        let cursor = collector.purge.unhash_cursor.fetch_add(1, Ordering::Relaxed);
        let index = ObjectIndex::new(unreachable[cursor].load(Ordering::Relaxed) as u32);
        let item = collector.table.index_to_item(index);
        debug_assert!(item.is_unreachable());

        // Begin the object's asynchronous teardown, once.
        if !item.has_any_flags(ObjectFlags::BEGUN_DESTROY) {
            item.set_flags(ObjectFlags::BEGUN_DESTROY);
            VM::begin_destroy(item.object());
        }
        items += 1;

        let poll_time_limit = time_poll_counter % TIME_POLL_GRANULARITY == 0;
        time_poll_counter += 1;
        if use_time_limit && poll_time_limit && start_time.elapsed() > time_limit {
            break;
        }
    }

    let time_limit_reached =
        collector.purge.unhash_cursor.load(Ordering::Relaxed) < unreachable.len();

    if !use_time_limit {
        log::debug!(
            "{:.3} ms for unhashing unreachable objects ({} objects unhashed)",
            start_time.elapsed().as_secs_f64() * 1000.0,
            items,
        );
    } else if !time_limit_reached {
        log::debug!(
            "finished unhashing unreachable objects ({} objects unhashed)",
            unreachable.len()
        );
    } else if first_iteration {
        log::debug!(
            "starting unhashing unreachable objects ({} objects to unhash)",
            unreachable.len()
        );
    }

    collector.state.unhash_in_progress.store(false, Ordering::Relaxed);
    time_limit_reached
}
