//! Cluster reachability: members share the root's fate, cluster-recorded
//! references keep external objects alive, dead clusters dissolve into
//! individually destroyed objects, and garbage entries force dissolution.

mod common;

use common::World;

#[test]
fn clustered_island_survives_through_root() {
    let world = World::new();
    let root = world.spawn();
    let members: Vec<_> = (0..3).map(|_| world.spawn()).collect();
    let external = world.spawn();

    let cluster = world.collector.create_cluster(root);
    for member in &members {
        world.collector.add_to_cluster(cluster, *member);
    }
    // Member 1 references an external mutable object; clusters trace their
    // recorded reference lists instead of member schemas.
    world.link(members[1], external);
    world.collector.add_cluster_mutable_reference(cluster, external);
    world.collector.add_to_root_set(root);

    world.collect(true);

    world.assert_never_destroyed(root);
    for member in &members {
        world.assert_never_destroyed(*member);
    }
    world.assert_never_destroyed(external);
    assert_eq!(world.collector.clusters_allocated(), 1);
}

#[test]
fn dead_cluster_is_destroyed_member_by_member() {
    let world = World::new();
    let root = world.spawn();
    let members: Vec<_> = (0..3).map(|_| world.spawn()).collect();
    let external = world.spawn();

    let cluster = world.collector.create_cluster(root);
    for member in &members {
        world.collector.add_to_cluster(cluster, *member);
    }
    world.collector.add_cluster_mutable_reference(cluster, external);

    let mut objects = vec![world.object(root), world.object(external)];
    objects.extend(members.iter().map(|m| world.object(*m)));

    // No roots at all: the whole island dies.
    world.collect(true);

    for object in objects {
        world.assert_destroyed_once(object);
    }
    assert_eq!(world.collector.clusters_allocated(), 0);
    assert_eq!(world.num_freed(), 5);
}

#[test]
fn garbage_cluster_root_dissolves_during_mark() {
    let world = World::new();
    let root = world.spawn();
    let member = world.spawn();
    let cluster = world.collector.create_cluster(root);
    world.collector.add_to_cluster(cluster, member);
    world.collector.mark_as_garbage(root);
    let objects = [world.object(root), world.object(member)];

    world.collect(true);

    for object in objects {
        world.assert_destroyed_once(object);
    }
    assert_eq!(world.collector.clusters_allocated(), 0);
}

#[test]
fn garbage_mutable_reference_dissolves_live_cluster() {
    let world = World::new();
    let root = world.spawn();
    let m1 = world.spawn();
    let m2 = world.spawn();
    let doomed = world.spawn();

    let cluster = world.collector.create_cluster(root);
    world.collector.add_to_cluster(cluster, m1);
    world.collector.add_to_cluster(cluster, m2);
    // m2 holds a killable reference at the doomed object and the cluster
    // records the outgoing edge.
    world.link(m2, doomed);
    world.collector.add_cluster_mutable_reference(cluster, doomed);

    world.collector.add_to_root_set(root);
    world.collector.mark_as_garbage(doomed);
    let doomed_object = world.object(doomed);

    world.collect(true);

    // The garbage entry was nulled in place; the cluster can no longer
    // vouch for its references and is dissolved, while its members stay
    // alive through the root.
    world.assert_destroyed_once(doomed_object);
    assert!(world.node(m2).target.is_null());
    world.assert_never_destroyed(root);
    world.assert_never_destroyed(m1);
    world.assert_never_destroyed(m2);
    assert_eq!(world.collector.clusters_allocated(), 0);
}

#[test]
fn cluster_to_cluster_references_propagate() {
    let world = World::new();
    let root_a = world.spawn();
    let root_b = world.spawn();
    let root_c = world.spawn();
    let member_b = world.spawn();

    let cluster_a = world.collector.create_cluster(root_a);
    let cluster_b = world.collector.create_cluster(root_b);
    let cluster_c = world.collector.create_cluster(root_c);
    world.collector.add_to_cluster(cluster_b, member_b);

    // a -> b -> c, only a is rooted: reachability must flow through the
    // whole referenced-cluster chain.
    world.collector.add_cluster_reference(cluster_a, root_b);
    world.collector.add_cluster_reference(cluster_b, root_c);
    world.collector.add_to_root_set(root_a);

    let _ = cluster_c;
    world.collect(true);

    world.assert_never_destroyed(root_a);
    world.assert_never_destroyed(root_b);
    world.assert_never_destroyed(root_c);
    world.assert_never_destroyed(member_b);
}

#[test]
fn member_reference_revives_whole_cluster() {
    let world = World::new();
    let holder = world.spawn();
    let root = world.spawn();
    let member = world.spawn();
    let other_member = world.spawn();

    let cluster = world.collector.create_cluster(root);
    world.collector.add_to_cluster(cluster, member);
    world.collector.add_to_cluster(cluster, other_member);

    // Only an external strong reference to one member exists.
    world.link_strong(holder, member);
    world.collector.add_to_root_set(holder);

    world.collect(true);

    // Reaching any member keeps the root and every other member alive.
    world.assert_never_destroyed(root);
    world.assert_never_destroyed(member);
    world.assert_never_destroyed(other_member);
    assert_eq!(world.collector.clusters_allocated(), 1);
}
