//! Weak-reference clearing and out-of-band reference enumeration through
//! registered callbacks, fast and slow.

mod common;

use common::World;
use scythe::AroFlags;

#[test]
fn weak_reference_does_not_keep_target_alive() {
    let world = World::new();
    let watcher = world.spawn();
    let ghost = world.spawn();
    world.link_weak(watcher, ghost);
    world.collector.add_to_root_set(watcher);
    let ghost_object = world.object(ghost);

    world.collect(true);

    world.assert_destroyed_once(ghost_object);
    world.assert_never_destroyed(watcher);
    // The slot was observed null before any post-cycle subscriber ran.
    assert!(world.node(watcher).weak.is_null());
}

#[test]
fn weak_reference_to_survivor_is_untouched() {
    let world = World::new();
    let watcher = world.spawn();
    let target = world.spawn();
    world.link_weak(watcher, target);
    world.link_strong(watcher, target);
    world.collector.add_to_root_set(watcher);

    world.collect(true);

    world.assert_never_destroyed(target);
    assert_eq!(world.node(watcher).weak, world.object(target));
}

#[test]
fn weak_slot_cleared_observed_by_subscriber() {
    let world = World::new();
    let watcher = world.spawn();
    let ghost = world.spawn();
    world.link_weak(watcher, ghost);
    world.collector.add_to_root_set(watcher);

    let watcher_node = world.node(watcher) as *const common::MockNode as usize;
    let seen_null = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let seen = seen_null.clone();
    world
        .collector
        .events()
        .post_reachability
        .subscribe(Box::new(move || {
            let node = unsafe { &*(watcher_node as *const common::MockNode) };
            seen.store(node.weak.is_null(), std::sync::atomic::Ordering::Relaxed);
        }));

    world.collect(true);
    assert!(seen_null.load(std::sync::atomic::Ordering::Relaxed));
}

#[test]
fn callback_references_keep_objects_alive() {
    let world = World::new();
    let enumerator = world.spawn_aro();
    let hidden = world.spawn();
    let unreferenced = world.spawn();
    world.node(enumerator).extra.push(world.object(hidden));
    world.collector.add_to_root_set(enumerator);
    let unreferenced_object = world.object(unreferenced);

    world.collect(true);

    world.assert_never_destroyed(hidden);
    world.assert_destroyed_once(unreferenced_object);
}

#[test]
fn callback_killable_references_are_nulled() {
    let world = World::new();
    let enumerator = world.spawn_aro();
    let doomed = world.spawn();
    world.node(enumerator).extra.push(world.object(doomed));
    world.collector.add_to_root_set(enumerator);
    world.collector.mark_as_garbage(doomed);
    let doomed_object = world.object(doomed);

    world.collect(true);

    world.assert_destroyed_once(doomed_object);
    assert!(world.node(enumerator).extra[0].is_null());
}

#[test]
fn slow_callbacks_trace_from_worker_queues() {
    let world = World::new();
    world.register_slow_extra_refs(AroFlags::NONE);

    let enumerators: Vec<_> = (0..50).map(|_| world.spawn_slow_aro()).collect();
    let hidden: Vec<_> = (0..50).map(|_| world.spawn()).collect();
    for (enumerator, target) in enumerators.iter().zip(&hidden) {
        world.node(*enumerator).extra.push(world.object(*target));
        world.collector.add_to_root_set(*enumerator);
    }
    let stray = world.spawn();
    let stray_object = world.object(stray);

    world.collect(true);

    for target in hidden {
        world.assert_never_destroyed(target);
    }
    world.assert_destroyed_once(stray_object);
}

#[test]
fn unbalanced_and_extra_slow_tiers_are_drained() {
    let world = World::new();
    world.register_slow_extra_refs(AroFlags::UNBALANCED.union(AroFlags::EXTRA_SLOW));

    let enumerator = world.spawn_slow_aro();
    let kept: Vec<_> = (0..200).map(|_| world.spawn()).collect();
    for target in &kept {
        world.node(enumerator).extra.push(world.object(*target));
    }
    world.collector.add_to_root_set(enumerator);

    world.collect(true);

    for target in kept {
        world.assert_never_destroyed(target);
    }
}

#[test]
fn garbage_reference_tracking_survives_rerun() {
    let mut options = common::default_options();
    options.garbage_reference_tracking = 1;
    let world = World::with_options(options);

    let holder = world.spawn();
    let zombie = world.spawn();
    world.link_strong(holder, zombie);
    world.collector.add_to_root_set(holder);
    world.collector.mark_as_garbage(zombie);

    // The strong reference keeps the garbage alive; the cycle reruns with
    // attribution and must reach the same partition.
    world.collect(true);

    world.assert_never_destroyed(holder);
    world.assert_never_destroyed(zombie);
    assert_eq!(world.num_freed(), 0);
}
