//! The mark phase: a parallel sweep over the object table that classifies
//! every object into reachable roots, maybe-unreachable candidates, cluster
//! keep-refs and cluster dissolve candidates.
//!
//! No decision depends on stripe order, so two marks of the same state
//! produce the same classification regardless of how the table is split.

use crate::collector::Collector;
use crate::object::flags::{KeepFlags, ObjectFlags};
use crate::object::table::ObjectIndex;
use crate::tracer::processor::{mark_referenced_clusters, ProcEnv};
use crate::util::ObjectRef;
use crate::vm::Binding;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub(crate) fn mark_objects_as_unreachable<VM: Binding>(
    collector: &Collector<VM>,
    keep_flags: KeepFlags,
    parallel: bool,
    is_rerun: bool,
) -> Vec<ObjectRef> {
    let start_time = Instant::now();
    let table = &collector.table;
    let first_index = if collector.state.exit_purge.load(Ordering::Relaxed) {
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

    let clusters_to_dissolve: Mutex<Vec<ObjectIndex>> = Mutex::new(Vec::new());
    let keep_cluster_refs: Mutex<Vec<ObjectIndex>> = Mutex::new(Vec::new());
    let object_count = AtomicUsize::new(0);

    let stripe = |thread_index: usize| -> Vec<ObjectRef> {
        let mut local: Vec<ObjectRef> = Vec::new();
        let stripe_first = first_index + thread_index * per_thread;
        let stripe_end = max_index.min(stripe_first + per_thread);
        let mut counted = 0usize;

        for index in stripe_first..stripe_end {
            let index = ObjectIndex::from_usize(index);
            let item = table.index_to_item(index);
            let object = item.object();
            if object.is_null() {
                continue;
            }
            counted += 1;

            // By now any prior cycle's garbage must have been purged; an
            // object still flagged from last time means someone resurrected
            // it behind the collector's back.
            debug_assert!(
                is_rerun
                    || !item.has_any_flags(
                        ObjectFlags::UNREACHABLE | ObjectFlags::PENDING_CONSTRUCTION
                    ),
                "object {} enters mark with stale flags {:?}",
                object,
                item.flags(),
            );

            item.clear_flags(ObjectFlags::REACHABLE_IN_CLUSTER);

            if item.is_root_set() {
                assert!(
                    !item.is_garbage(),
                    "object {} is part of the root set though it has been marked as garbage",
                    object
                );
                if item.is_cluster_root() || item.is_cluster_member() {
                    keep_cluster_refs.lock().unwrap().push(index);
                }
                local.push(object);
            } else if item.is_cluster_member() {
                // Cluster members with fast keep flags are treated as if
                // they were in the root set; otherwise the root decides.
                if item.has_any_flags(ObjectFlags::GC_KEEP_FLAGS) {
                    keep_cluster_refs.lock().unwrap().push(index);
                    local.push(object);
                }
            } else {
                // Regular objects and cluster roots.
                let mut mark_as_unreachable = true;
                if item.has_any_flags(ObjectFlags::GC_KEEP_FLAGS) {
                    mark_as_unreachable = false;
                } else if !item.is_garbage()
                    && !keep_flags.is_empty()
                    && VM::has_any_keep_flags(object, keep_flags)
                {
                    mark_as_unreachable = false;
                } else if item.is_garbage() && item.is_cluster_root() {
                    clusters_to_dissolve.lock().unwrap().push(index);
                }

                if !mark_as_unreachable {
                    local.push(object);
                    if item.is_cluster_root() {
                        keep_cluster_refs.lock().unwrap().push(index);
                    }
                } else {
                    item.set_flags(ObjectFlags::UNREACHABLE);
                }
            }
        }

        object_count.fetch_add(counted, Ordering::Relaxed);
        local
    };

    let mut initial_objects: Vec<ObjectRef> = Vec::new();
    if num_threads == 1 {
        initial_objects = stripe(0);
    } else {
        let stripe = &stripe;
        let locals: Vec<Vec<ObjectRef>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_index| scope.spawn(move || stripe(thread_index)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let total: usize = locals.iter().map(Vec::len).sum();
        initial_objects.reserve(total);
        for mut local in locals {
            initial_objects.append(&mut local);
        }
    }

    collector
        .state
        .object_count_during_last_mark
        .store(object_count.load(Ordering::Relaxed), Ordering::Relaxed);

    // Dissolve clusters whose root went garbage: their members become
    // individually tracked unreachable candidates for this very sweep.
    for index in clusters_to_dissolve.into_inner().unwrap() {
        let item = table.index_to_item(index);
        // A previous dissolve may already have taken this cluster apart.
        if item.is_cluster_root() {
            collector
                .clusters
                .dissolve_cluster_and_mark_objects_as_unreachable(table, index);
        }
    }

    // Propagate reachability from kept clusters. The set is small, so the
    // serial recursion is fine here.
    let env = ProcEnv {
        table,
        clusters: &collector.clusters,
    };
    for index in keep_cluster_refs.into_inner().unwrap() {
        let item = table.index_to_item(index);
        if item.is_cluster_member() {
            debug_assert!(!item.is_cluster_root());
            if !item.has_any_flags(ObjectFlags::REACHABLE_IN_CLUSTER) {
                item.set_flags(ObjectFlags::REACHABLE_IN_CLUSTER);
                let root_item = table.index_to_item(item.cluster_root_index());
                debug_assert!(root_item.is_cluster_root());
                // Reachable via keep flags handles the root further below
                // (or already has).
                if root_item.is_unreachable() {
                    root_item.clear_flags(ObjectFlags::UNREACHABLE);
                    mark_referenced_clusters::<false>(env, root_item.cluster_index(), &mut |o| {
                        initial_objects.push(o)
                    });
                }
            }
        } else {
            debug_assert!(item.is_cluster_root());
            // Definitely not unreachable (it was kept), so just carry the
            // reachability through its referenced clusters.
            mark_referenced_clusters::<false>(env, item.cluster_index(), &mut |o| {
                initial_objects.push(o)
            });
        }
    }

    log::debug!(
        "{:.3} ms for mark phase ({} objects to serialize, {} considered)",
        start_time.elapsed().as_secs_f64() * 1000.0,
        initial_objects.len(),
        object_count.load(Ordering::Relaxed),
    );

    initial_objects
}
