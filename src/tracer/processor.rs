//! Per-reference reachability transitions. The batched handlers receive
//! prefetched metadata from the batcher; the direct handlers are the
//! unbatched path used by the attribution (garbage tracking / history)
//! passes and by utility walkers.
//!
//! Everything here relies on the this-thread-flipped-the-flag idiom: a flag
//! transition is attempted atomically and only the winning thread enqueues
//! the follow-up work, which keeps parallel tracing race-free without any
//! per-object lock, and terminates on cyclic graphs because an
//! already-reached object can never win a second flip.

use crate::object::cluster::{live_entries, remove_entry, ClusterTable};
use crate::object::flags::ObjectFlags;
use crate::object::table::ObjectTable;
use crate::scheduler::context::{GarbageReference, WorkerContext};
use crate::tracer::batcher::{RefMetadata, ResolvedMutableRef};
use crate::util::{Address, ObjectRef};
use crate::vm::Binding;

/// Shared tables the transitions consult.
#[derive(Copy, Clone)]
pub(crate) struct ProcEnv<'e> {
    pub table: &'e ObjectTable,
    pub clusters: &'e ClusterTable,
}

/// Helps identify the code locations that null references out.
#[inline]
pub(crate) fn kill_reference(slot: Address) {
    unsafe { slot.store(ObjectRef::NULL) };
}

/// Batched mutable (killable) reference: nulled in place when the target is
/// garbage, otherwise treated as a valid strong reference.
pub(crate) fn handle_batched_mutable<const PARALLEL: bool>(
    env: ProcEnv<'_>,
    ctx: &mut WorkerContext,
    reference: ResolvedMutableRef,
    metadata: RefMetadata<'_>,
) {
    if metadata.flags.contains_any(ObjectFlags::GARBAGE) {
        debug_assert!(
            metadata.item.owner_word() <= 0,
            "cluster members cannot be garbage while clustered"
        );
        kill_reference(reference.slot);
    } else {
        handle_valid_reference::<PARALLEL>(env, ctx, reference.object, &metadata);
    }
}

/// Batched immutable reference: garbage targets survive but are counted so
/// the cycle can be rerun with attribution enabled.
pub(crate) fn handle_batched_immutable<const PARALLEL: bool, const WITH_KILL: bool>(
    env: ProcEnv<'_>,
    ctx: &mut WorkerContext,
    object: ObjectRef,
    metadata: RefMetadata<'_>,
) {
    detect_garbage_reference::<WITH_KILL>(ctx, &metadata);
    handle_valid_reference::<PARALLEL>(env, ctx, object, &metadata);
}

#[inline]
fn detect_garbage_reference<const WITH_KILL: bool>(ctx: &mut WorkerContext, metadata: &RefMetadata<'_>) {
    ctx.stats
        .track_potential_garbage_reference(!WITH_KILL && metadata.flags.contains_any(ObjectFlags::GARBAGE));
}

/// Core transition for a validated strong reference to a live target.
/// Returns whether this call reached the object first.
pub(crate) fn handle_valid_reference<const PARALLEL: bool>(
    env: ProcEnv<'_>,
    ctx: &mut WorkerContext,
    object: ObjectRef,
    metadata: &RefMetadata<'_>,
) -> bool {
    let item = metadata.item;

    let cleared = if PARALLEL {
        item.this_thread_cleared_flag(ObjectFlags::UNREACHABLE)
    } else if item.is_unreachable() {
        item.clear_flags(ObjectFlags::UNREACHABLE);
        true
    } else {
        false
    };

    if cleared {
        // Objects inside a cluster never carry the unreachable flag while
        // the cluster is alive.
        debug_assert!(item.owner_word() <= 0);

        if !item.is_cluster_root() {
            ctx.objects_to_serialize.add::<PARALLEL>(object);
        } else {
            // A cluster root's outgoing references are captured in the
            // cluster's recorded reference lists; mark those instead of
            // tracing the root's members.
            let cluster_index = item.cluster_index();
            let blockifier = &mut ctx.objects_to_serialize;
            mark_referenced_clusters::<PARALLEL>(env, cluster_index, &mut |o| {
                blockifier.add::<PARALLEL>(o)
            });
        }
        return true;
    }

    if item.owner_word() > 0 && !metadata.flags.contains_any(ObjectFlags::REACHABLE_IN_CLUSTER) {
        // Cluster member reached for the first time this cycle: make sure
        // the root (and everything the cluster references) survives.
        let root_item = env.table.index_to_item(item.cluster_root_index());
        debug_assert!(root_item.is_cluster_root());

        let needs_doing = if PARALLEL {
            item.this_thread_set_flag(ObjectFlags::REACHABLE_IN_CLUSTER)
        } else {
            item.set_flags(ObjectFlags::REACHABLE_IN_CLUSTER);
            true
        };
        if needs_doing {
            let root_cleared = if PARALLEL {
                root_item.this_thread_cleared_flag(ObjectFlags::UNREACHABLE)
            } else if root_item.is_unreachable() {
                root_item.clear_flags(ObjectFlags::UNREACHABLE);
                true
            } else {
                false
            };
            if root_cleared {
                let cluster_index = root_item.cluster_index();
                let blockifier = &mut ctx.objects_to_serialize;
                mark_referenced_clusters::<PARALLEL>(env, cluster_index, &mut |o| {
                    blockifier.add::<PARALLEL>(o)
                });
            }
        }
    }

    false
}

/// Marks all clusters referenced by a cluster as reachable, nulling any
/// entry whose target went garbage. A nulled entry means the cluster can no
/// longer vouch for its cross-cluster references: every member is queued for
/// individual tracing and the cluster is dissolved at end of cycle.
pub(crate) fn mark_referenced_clusters<const PARALLEL: bool>(
    env: ProcEnv<'_>,
    cluster_index: usize,
    sink: &mut dyn FnMut(ObjectRef),
) {
    let cluster = unsafe { env.clusters.cluster_unsafe_for_gc(cluster_index) };

    let mut queue_all_members = false;
    for (slot, referenced_root) in live_entries(&cluster.referenced_clusters) {
        let root_item = env.table.index_to_item(referenced_root);
        if !root_item.has_any_flags(ObjectFlags::GARBAGE) {
            if root_item.is_unreachable() {
                let cleared = if PARALLEL {
                    root_item.this_thread_cleared_flag(ObjectFlags::UNREACHABLE)
                } else {
                    root_item.clear_flags(ObjectFlags::UNREACHABLE);
                    true
                };
                // First clear wins and carries the reachability on through
                // the referenced cluster's own reference lists. Cycles
                // terminate because a cleared root never wins again.
                if cleared {
                    mark_referenced_clusters::<PARALLEL>(env, root_item.cluster_index(), sink);
                }
            }
        } else {
            remove_entry(slot);
            queue_all_members = true;
        }
    }

    if mark_cluster_mutable_objects::<PARALLEL>(env, cluster, sink) {
        queue_all_members = true;
    }

    if queue_all_members {
        // Garbage entries were nulled above; queue every member so the
        // nulled references inside them get processed too.
        for member in &cluster.objects {
            sink(env.table.index_to_item(*member).object());
        }
        cluster.mark_for_dissolve();
        env.clusters.set_clusters_need_dissolving();
    }
}

/// Marks the mutable (non-member) objects a cluster references as
/// reachable. Returns whether a garbage entry was nulled.
fn mark_cluster_mutable_objects<const PARALLEL: bool>(
    env: ProcEnv<'_>,
    cluster: &crate::object::cluster::Cluster,
    sink: &mut dyn FnMut(ObjectRef),
) -> bool {
    let mut found_garbage = false;
    for (slot, index) in live_entries(&cluster.mutable_objects) {
        let item = env.table.index_to_item(index);
        if item.has_any_flags(ObjectFlags::GARBAGE) {
            remove_entry(slot);
            found_garbage = true;
            continue;
        }

        if item.is_unreachable() {
            let cleared = if PARALLEL {
                item.this_thread_cleared_flag(ObjectFlags::UNREACHABLE)
            } else {
                item.clear_flags(ObjectFlags::UNREACHABLE);
                true
            };
            if cleared {
                // Either an unclustered object or another cluster's root;
                // members of live clusters are never unreachable.
                sink(item.object());
                if item.owner_word() < 0 {
                    mark_referenced_clusters::<PARALLEL>(env, item.cluster_index(), sink);
                }
            }
        } else if item.owner_word() > 0 && !item.has_any_flags(ObjectFlags::REACHABLE_IN_CLUSTER) {
            // A clustered object that has not been processed yet.
            let needs_doing = if PARALLEL {
                item.this_thread_set_flag(ObjectFlags::REACHABLE_IN_CLUSTER)
            } else {
                item.set_flags(ObjectFlags::REACHABLE_IN_CLUSTER);
                true
            };
            if needs_doing {
                let root_item = env.table.index_to_item(item.cluster_root_index());
                if root_item.is_unreachable() {
                    let root_cleared = if PARALLEL {
                        root_item.this_thread_cleared_flag(ObjectFlags::UNREACHABLE)
                    } else {
                        root_item.clear_flags(ObjectFlags::UNREACHABLE);
                        true
                    };
                    if root_cleared {
                        mark_referenced_clusters::<PARALLEL>(env, root_item.cluster_index(), sink);
                    }
                }
            }
        }
    }
    found_garbage
}

/// Unbatched slot processing with referencer attribution: the path the
/// garbage-tracking rerun uses. Mirrors the batched pipeline's validation
/// and transitions, trading throughput for knowing who referenced what.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_slot_direct<VM: Binding, const PARALLEL: bool, const WITH_KILL: bool>(
    env: ProcEnv<'_>,
    ctx: &mut WorkerContext,
    referencing_object: ObjectRef,
    slot: Address,
    member_name: &'static str,
    killable: bool,
    track_garbage: bool,
) {
    let object = unsafe { slot.load::<ObjectRef>() };
    if object.is_null() || VM::is_permanent(object) || !VM::is_resolved(object) {
        return;
    }
    ctx.stats.add_references(1);

    let index = VM::object_index(object);
    let item = env.table.index_to_item(index);

    #[cfg(any(debug_assertions, feature = "sanity"))]
    assert!(
        item.object() == object,
        "invalid object in GC: {}, referencing object: {}, member {}",
        object,
        referencing_object,
        member_name,
    );

    let metadata = RefMetadata {
        item,
        flags: item.flags(),
    };

    if metadata.flags.contains_any(ObjectFlags::GARBAGE) {
        if killable {
            debug_assert!(metadata.item.owner_word() <= 0);
            kill_reference(slot);
            return;
        }
        if !WITH_KILL && track_garbage {
            ctx.stats.track_potential_garbage_reference(true);
            let referencer = if referencing_object.is_null() {
                ctx.referencing_object
            } else {
                referencing_object
            };
            if !referencer.is_null() {
                ctx.garbage_references.push(GarbageReference {
                    object,
                    referencer,
                    member_name,
                });
            }
        } else {
            detect_garbage_reference::<WITH_KILL>(ctx, &metadata);
        }
    }

    let _reached_first = handle_valid_reference::<PARALLEL>(env, ctx, object, &metadata);

    #[cfg(feature = "history")]
    if _reached_first {
        let referencer = if referencing_object.is_null() {
            ctx.referencing_object
        } else {
            referencing_object
        };
        ctx.history.push(crate::scheduler::context::DirectReference {
            referencer,
            object,
            member_name,
        });
    }
}

/// Unbatched processing of a reference value (no slot to kill).
pub(crate) fn process_object_direct<VM: Binding, const PARALLEL: bool, const WITH_KILL: bool>(
    env: ProcEnv<'_>,
    ctx: &mut WorkerContext,
    referencing_object: ObjectRef,
    object: ObjectRef,
    member_name: &'static str,
    track_garbage: bool,
) {
    if object.is_null() || VM::is_permanent(object) || !VM::is_resolved(object) {
        return;
    }
    let mut slot_value = object;
    let slot = Address::from_ref(&slot_value);
    process_slot_direct::<VM, PARALLEL, WITH_KILL>(
        env,
        ctx,
        referencing_object,
        slot,
        member_name,
        false,
        track_garbage,
    );
    let _ = slot_value;
}
