//! Incremental unhash and purge: small time budgets converge to the same
//! end state as a single full purge, deferred FinishDestroy objects are
//! revisited until ready, and thread-safe objects ride the purge thread.

mod common;

use common::World;
use std::time::Duration;

#[test]
fn incremental_purge_converges_with_tiny_budgets() {
    let world = World::new();
    let root = world.spawn();
    world.collector.add_to_root_set(root);
    const DEAD: usize = 10_000;
    for _ in 0..DEAD {
        world.spawn();
    }

    // Mark + reachability only; destruction is left to the ticks.
    world.collect(false);
    assert!(world.collector.is_incremental_purge_pending());
    assert_eq!(world.num_freed(), 0);

    let ticks = world.drain_incremental(Duration::from_millis(2));

    assert!(ticks >= 1);
    assert!(!world.collector.is_incremental_purge_pending());
    assert!(!world.collector.is_incremental_unhash_pending());
    assert_eq!(world.num_freed(), DEAD);
    world.assert_never_destroyed(root);
}

#[test]
fn time_sliced_and_single_shot_purges_match() {
    let build = |world: &World| {
        let root = world.spawn();
        world.collector.add_to_root_set(root);
        for _ in 0..500 {
            world.spawn();
        }
    };

    let single_freed = {
        let world = World::new();
        build(&world);
        world.collect(true);
        world.num_freed()
    };

    let sliced_freed = {
        let world = World::new();
        build(&world);
        world.collect(false);
        world.drain_incremental(Duration::from_micros(200));
        world.num_freed()
    };

    assert_eq!(single_freed, 500);
    assert_eq!(sliced_freed, single_freed);
}

#[test]
fn not_ready_objects_are_deferred_until_ready() {
    let world = World::new();
    let slow = world.spawn();
    let fast = world.spawn();
    // The slow object reports not-ready for a few polls, simulating an
    // asynchronous release owned by another subsystem.
    world.set_ready_countdown(slow, 5);
    let slow_object = world.object(slow);
    let fast_object = world.object(fast);

    world.collect(true);

    world.assert_destroyed_once(slow_object);
    world.assert_destroyed_once(fast_object);
}

#[test]
fn deferred_objects_do_not_block_incremental_ticks() {
    let world = World::new();
    let slow = world.spawn();
    world.set_ready_countdown(slow, 3);
    let slow_object = world.object(slow);

    world.collect(false);
    world.drain_incremental(Duration::from_millis(1));

    world.assert_destroyed_once(slow_object);
}

#[test]
fn thread_safe_objects_are_destroyed_on_the_purge_thread() {
    let world = World::new();
    let mixed: Vec<_> = (0..200).map(|_| world.spawn()).collect();
    for (position, index) in mixed.iter().enumerate() {
        // Half the objects allow destruction off the driving thread.
        world.set_thread_safe_destruction(*index, position % 2 == 0);
    }
    let objects: Vec<_> = mixed.iter().map(|index| world.object(*index)).collect();

    world.collect(true);

    for object in objects {
        world.assert_destroyed_once(object);
    }
    assert_eq!(world.num_freed(), 200);
}

#[test]
fn incremental_begin_destroy_can_be_disabled() {
    let mut options = common::default_options();
    options.incremental_begin_destroy = false;
    let world = World::with_options(options);

    for _ in 0..50 {
        world.spawn();
    }
    world.collect(false);

    // BeginDestroy ran to completion inside the cycle; only destruction is
    // left for the ticks.
    assert!(!world.collector.is_incremental_unhash_pending());
    world.drain_incremental(Duration::from_millis(1));
    assert_eq!(world.num_freed(), 50);
}

#[test]
fn serial_destruction_matches_multithreaded() {
    let serial_freed = {
        let world = World::with_options(common::serial_options());
        for _ in 0..300 {
            world.spawn();
        }
        world.collect(true);
        world.num_freed()
    };

    let threaded_freed = {
        let world = World::new();
        let indices: Vec<_> = (0..300).map(|_| world.spawn()).collect();
        for index in &indices {
            world.set_thread_safe_destruction(*index, true);
        }
        world.collect(true);
        world.num_freed()
    };

    assert_eq!(serial_freed, 300);
    assert_eq!(threaded_freed, 300);
}

#[test]
fn scratch_pages_are_recycled_between_cycles() {
    let world = World::new();
    let root = world.spawn();
    world.collector.add_to_root_set(root);
    for _ in 0..2000 {
        world.spawn();
    }
    world.collect(true);
    let bytes_after_first = world.collector.count_scratch_bytes();

    for _ in 0..2000 {
        world.spawn();
    }
    world.collect(true);
    let bytes_after_second = world.collector.count_scratch_bytes();

    // The second cycle reuses the first cycle's pages instead of growing
    // the caches further.
    assert!(bytes_after_second <= bytes_after_first * 2);
    assert!(bytes_after_first > 0);
}
