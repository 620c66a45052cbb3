//! Post-reachability bookkeeping: assembling the unreachable set, taking
//! apart dead clusters, nulling weak references whose target died, and
//! reporting references that kept garbage alive.

use crate::collector::Collector;
use crate::object::flags::ObjectFlags;
use crate::object::table::ObjectIndex;
use crate::scheduler::context::ContextPoolScope;
use crate::util::options::GarbageTracking;
use crate::util::ObjectRef;
use crate::vm::Binding;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

/// Walks the table in stripes collecting everything still unreachable.
/// Unreachable cluster roots drag their whole cluster in: the cluster is
/// freed and its members (minus any reached-in-cluster survivors, which
/// cannot exist for a dead root) join the unreachable set individually.
pub(crate) fn gather_unreachable_objects<VM: Binding>(
    collector: &Collector<VM>,
    parallel: bool,
) -> Vec<ObjectIndex> {
    let start_time = Instant::now();
    let table = &collector.table;
    let first_index = if collector.state.exit_purge.load(std::sync::atomic::Ordering::Relaxed) {
        0
    } else {
        table.first_gc_index()
    };
    let max_index = table.num_objects();
    let span = max_index.saturating_sub(first_index);
    let num_threads = if parallel {
        collector.options.threads.clamp(1, span.max(1))
    } else {
        1
    };
    let per_thread = span / num_threads + 1;

    let unreachable: Mutex<Vec<ObjectIndex>> = Mutex::new(Vec::new());
    let cluster_items_to_destroy: Mutex<Vec<ObjectIndex>> = Mutex::new(Vec::new());

    let stripe = |thread_index: usize| {
        let stripe_first = first_index + thread_index * per_thread;
        let stripe_end = max_index.min(stripe_first + per_thread);
        let mut local_unreachable = Vec::new();
        let mut local_clusters = Vec::new();

        for index in stripe_first..stripe_end {
            let index = ObjectIndex::from_usize(index);
            let item = table.index_to_item(index);
            if !item.object().is_null() && item.is_unreachable() {
                local_unreachable.push(index);
                if item.is_cluster_root() {
                    // Members can't be flagged here: another stripe might
                    // still be reading them. Handled after the barrier.
                    local_clusters.push(index);
                }
            }
        }

        if !local_unreachable.is_empty() {
            unreachable.lock().unwrap().append(&mut local_unreachable);
            cluster_items_to_destroy
                .lock()
                .unwrap()
                .append(&mut local_clusters);
        }
    };

    if num_threads == 1 {
        stripe(0);
    } else {
        let stripe = &stripe;
        std::thread::scope(|scope| {
            for thread_index in 0..num_threads {
                scope.spawn(move || stripe(thread_index));
            }
        });
    }

    let mut unreachable = unreachable.into_inner().unwrap();
    let cluster_items_to_destroy = cluster_items_to_destroy.into_inner().unwrap();

    let mut cluster_objects = 0usize;
    for root_index in &cluster_items_to_destroy {
        let root_item = table.index_to_item(*root_index);
        let cluster_index = root_item.cluster_index();
        log::trace!(
            "destroying cluster {} rooted at {}",
            cluster_index,
            root_index
        );
        root_item.clear_flags(ObjectFlags::CLUSTER_ROOT);
        root_item.clear_owner();

        let cluster = collector.clusters.take_cluster(cluster_index);
        for member in &cluster.objects {
            let member_item = table.index_to_item(*member);
            member_item.clear_owner();
            if !member_item.has_any_flags(ObjectFlags::REACHABLE_IN_CLUSTER) {
                member_item.set_flags(ObjectFlags::UNREACHABLE);
                cluster_objects += 1;
                unreachable.push(*member);
            }
        }
    }

    log::debug!(
        "{:.3} ms for gathering unreachable objects ({} objects including {} cluster objects from {} clusters)",
        start_time.elapsed().as_secs_f64() * 1000.0,
        unreachable.len(),
        cluster_objects,
        cluster_items_to_destroy.len(),
    );

    unreachable
}

/// Nulls every recorded weak slot whose pointee is unreachable. Runs after
/// gathering, which can only grow the unreachable set, and before any
/// external subscriber observes the cycle.
pub(crate) fn clear_weak_references<VM: Binding>(collector: &Collector<VM>) {
    let table = &collector.table;
    let pool = ContextPoolScope;
    pool.for_each_free(|context| {
        for slot in context.weak_references.drain(..) {
            let object = unsafe { slot.load::<ObjectRef>() };
            if object.is_null() || VM::is_permanent(object) {
                continue;
            }
            let item = table.index_to_item(VM::object_index(object));
            if item.is_unreachable() {
                unsafe { slot.store(ObjectRef::NULL) };
            }
        }
    });
}

/// Reports the references that kept garbage-flagged objects alive, in the
/// level of detail the tracking mode asks for, then clears the scratch.
pub(crate) fn dump_garbage_referencers<VM: Binding>(collector: &Collector<VM>) {
    let mode = GarbageTracking::from_option(collector.options.garbage_reference_tracking);
    let pool = ContextPoolScope;

    match mode {
        GarbageTracking::Off => {
            pool.for_each_free(|context| context.garbage_references.clear());
        }
        GarbageTracking::Verbose => {
            let mut num_references = 0usize;
            pool.for_each_free(|context| {
                for garbage in context.garbage_references.drain(..) {
                    log::warn!("reachable garbage object: {}", garbage.object);
                    log::warn!(
                        "referenced by:            {}->{}",
                        VM::class_of(garbage.referencer).name,
                        garbage.member_name
                    );
                    num_references += 1;
                }
            });
            log::info!("reported {} garbage references", num_references);
        }
        GarbageTracking::Sampled => {
            // One report per (referencing class, member) pair.
            let mut seen: HashSet<(usize, &'static str)> = HashSet::new();
            let mut total = 0usize;
            let mut reported = 0usize;
            pool.for_each_free(|context| {
                for garbage in context.garbage_references.drain(..) {
                    total += 1;
                    let class = VM::class_of(garbage.referencer);
                    let key = (class as *const _ as usize, garbage.member_name);
                    if seen.insert(key) {
                        log::warn!("reachable garbage object: {}", garbage.object);
                        log::warn!(
                            "referenced by:            {}->{}",
                            class.name,
                            garbage.member_name
                        );
                        reported += 1;
                    }
                }
            });
            log::info!("reported {}/{} garbage references", reported, total);
        }
    }
}
