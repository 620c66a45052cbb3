//! Object clusters: groups of objects that share reachability fate so the
//! tracer can treat read-mostly content as a single unit. One member is the
//! root; while the cluster is alive no member is ever individually
//! unreachable and the root's reachability drives the whole group.

use crate::object::flags::ObjectFlags;
use crate::object::table::{ObjectIndex, ObjectTable};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

/// Index value meaning "entry removed"; garbage targets are nulled in place
/// during tracing and the cluster is dissolved at end of cycle.
const REMOVED: i32 = -1;

pub struct Cluster {
    /// The root's object index.
    pub root: ObjectIndex,
    /// Member object indices, excluding the root.
    pub objects: Vec<ObjectIndex>,
    /// Roots of other clusters this cluster references. Entries are raw
    /// object indices of the referenced roots, REMOVED when nulled.
    pub referenced_clusters: Vec<AtomicI32>,
    /// Non-clustered (or cluster-root) objects this cluster references.
    pub mutable_objects: Vec<AtomicI32>,
    /// Set when tracing nulled a garbage entry in place; the cluster can no
    /// longer guarantee its cross-cluster references and must be dissolved.
    pub needs_dissolving: AtomicBool,
}

impl Cluster {
    fn new(root: ObjectIndex) -> Cluster {
        Cluster {
            root,
            objects: Vec::new(),
            referenced_clusters: Vec::new(),
            mutable_objects: Vec::new(),
            needs_dissolving: AtomicBool::new(false),
        }
    }

    pub fn mark_for_dissolve(&self) {
        self.needs_dissolving.store(true, Ordering::Relaxed);
    }
}

/// Iteration helper over the atomic index vectors: yields live entries and
/// lets the visitor null them.
pub fn live_entries(entries: &[AtomicI32]) -> impl Iterator<Item = (&AtomicI32, ObjectIndex)> {
    entries.iter().filter_map(|slot| {
        let value = slot.load(Ordering::Relaxed);
        if value >= 0 {
            Some((slot, ObjectIndex::new(value as u32)))
        } else {
            None
        }
    })
}

pub fn remove_entry(slot: &AtomicI32) {
    slot.store(REMOVED, Ordering::Relaxed);
}

/// The cluster table. Structural changes (create, free, member mutation)
/// require the GC lock to be held by a mutator or happen in single-threaded
/// collector phases; tracing reads clusters concurrently through
/// [`ClusterTable::cluster_unsafe_for_gc`] and only flips atomic fields.
pub struct ClusterTable {
    clusters: Mutex<Vec<Option<Box<Cluster>>>>,
    free_list: Mutex<Vec<usize>>,
    clusters_need_dissolving: AtomicBool,
    num_allocated: AtomicI32,
}

impl ClusterTable {
    pub fn new() -> ClusterTable {
        ClusterTable {
            clusters: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            clusters_need_dissolving: AtomicBool::new(false),
            num_allocated: AtomicI32::new(0),
        }
    }

    pub fn num_allocated_clusters(&self) -> usize {
        self.num_allocated.load(Ordering::Relaxed) as usize
    }

    pub fn clusters_need_dissolving(&self) -> bool {
        self.clusters_need_dissolving.load(Ordering::Relaxed)
    }

    pub fn set_clusters_need_dissolving(&self) {
        self.clusters_need_dissolving.store(true, Ordering::Relaxed);
    }

    /// Creates a cluster rooted at `root` and flags the root in the table.
    pub fn create_cluster(&self, table: &ObjectTable, root: ObjectIndex) -> usize {
        let root_item = table.index_to_item(root);
        assert!(
            !root_item.is_cluster_root() && !root_item.is_cluster_member(),
            "object {} is already clustered",
            root
        );

        let mut clusters = self.clusters.lock().unwrap();
        let index = if let Some(index) = self.free_list.lock().unwrap().pop() {
            debug_assert!(clusters[index].is_none());
            clusters[index] = Some(Box::new(Cluster::new(root)));
            index
        } else {
            clusters.push(Some(Box::new(Cluster::new(root))));
            clusters.len() - 1
        };
        self.num_allocated.fetch_add(1, Ordering::Relaxed);

        root_item.set_flags(ObjectFlags::CLUSTER_ROOT);
        root_item.set_owner_root(index);
        index
    }

    /// Adds a member to an existing cluster.
    pub fn add_member(&self, table: &ObjectTable, cluster_index: usize, member: ObjectIndex) {
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters[cluster_index]
            .as_mut()
            .expect("cluster already freed");
        debug_assert!(member != cluster.root);
        let member_item = table.index_to_item(member);
        assert!(
            !member_item.is_cluster_root() && !member_item.is_cluster_member(),
            "object {} is already clustered",
            member
        );
        member_item.set_owner_member(cluster.root);
        cluster.objects.push(member);
    }

    /// Records that the cluster references another cluster's root.
    pub fn add_referenced_cluster(&self, cluster_index: usize, referenced_root: ObjectIndex) {
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters[cluster_index]
            .as_mut()
            .expect("cluster already freed");
        cluster
            .referenced_clusters
            .push(AtomicI32::new(referenced_root.as_u32() as i32));
    }

    /// Records that the cluster references a mutable (non-member) object.
    pub fn add_mutable_reference(&self, cluster_index: usize, object: ObjectIndex) {
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters[cluster_index]
            .as_mut()
            .expect("cluster already freed");
        cluster
            .mutable_objects
            .push(AtomicI32::new(object.as_u32() as i32));
    }

    /// Borrows a cluster without locking.
    ///
    /// # Safety
    /// Callers must guarantee no structural mutation is possible: either the
    /// GC lock is held exclusively by the collector, or the caller is a
    /// single-threaded collector phase. Clusters are boxed, so entries never
    /// move while the map grows.
    pub unsafe fn cluster_unsafe_for_gc(&self, cluster_index: usize) -> &Cluster {
        let clusters = self.clusters.lock().unwrap();
        let cluster: &Cluster = clusters[cluster_index]
            .as_ref()
            .expect("cluster already freed");
        // Stable address: the box outlives the guard as long as the caller
        // upholds the no-structural-mutation contract.
        &*(cluster as *const Cluster)
    }

    /// Dissolves a cluster whose root went garbage during mark: members are
    /// re-individualized and marked unreachable so the sweep enumerates them.
    pub fn dissolve_cluster_and_mark_objects_as_unreachable(
        &self,
        table: &ObjectTable,
        root: ObjectIndex,
    ) {
        let root_item = table.index_to_item(root);
        debug_assert!(root_item.is_cluster_root());
        let cluster_index = root_item.cluster_index();

        log::trace!("dissolving cluster {} rooted at {}", cluster_index, root);

        root_item.clear_flags(ObjectFlags::CLUSTER_ROOT);
        root_item.clear_owner();
        root_item.set_flags(ObjectFlags::UNREACHABLE);

        let cluster = self.take_cluster(cluster_index);
        for member in &cluster.objects {
            let member_item = table.index_to_item(*member);
            member_item.clear_owner();
            member_item.set_flags(ObjectFlags::UNREACHABLE);
        }
    }

    /// Dissolves every cluster flagged during tracing (or every cluster when
    /// `force` is set), clearing membership but leaving reachability alone.
    pub fn dissolve_flagged_clusters(&self, table: &ObjectTable, force: bool) -> usize {
        let indices: Vec<usize> = {
            let clusters = self.clusters.lock().unwrap();
            clusters
                .iter()
                .enumerate()
                .filter_map(|(index, cluster)| match cluster {
                    Some(c) if force || c.needs_dissolving.load(Ordering::Relaxed) => Some(index),
                    _ => None,
                })
                .collect()
        };

        for &index in &indices {
            let cluster = self.take_cluster(index);
            let root_item = table.index_to_item(cluster.root);
            root_item.clear_flags(ObjectFlags::CLUSTER_ROOT);
            root_item.clear_owner();
            for member in &cluster.objects {
                table.index_to_item(*member).clear_owner();
            }
        }

        self.clusters_need_dissolving.store(false, Ordering::Relaxed);
        indices.len()
    }

    /// Removes a cluster from the table and recycles its index.
    pub fn take_cluster(&self, cluster_index: usize) -> Box<Cluster> {
        let cluster = self.clusters.lock().unwrap()[cluster_index]
            .take()
            .expect("cluster already freed");
        self.free_list.lock().unwrap().push(cluster_index);
        self.num_allocated.fetch_sub(1, Ordering::Relaxed);
        cluster
    }

    /// Cluster invariant verification, run when sampled in by the
    /// verify-assumptions option: members must point back at their root,
    /// and referenced clusters must name live roots.
    pub fn verify_assumptions(&self, table: &ObjectTable) {
        let clusters = self.clusters.lock().unwrap();
        for (index, cluster) in clusters.iter().enumerate() {
            let Some(cluster) = cluster else { continue };
            let root_item = table.index_to_item(cluster.root);
            assert!(
                root_item.is_cluster_root() && root_item.cluster_index() == index,
                "cluster {} root {} lost its root marker",
                index,
                cluster.root
            );
            for member in &cluster.objects {
                let item = table.index_to_item(*member);
                assert!(
                    item.is_cluster_member() && item.cluster_root_index() == cluster.root,
                    "cluster {} member {} does not point back at root {}",
                    index,
                    member,
                    cluster.root
                );
                assert!(
                    !item.is_unreachable(),
                    "member {} of live cluster {} is marked unreachable",
                    member,
                    index
                );
            }
            for (_, referenced) in live_entries(&cluster.referenced_clusters) {
                assert!(
                    table.index_to_item(referenced).is_cluster_root(),
                    "cluster {} references {} which is not a cluster root",
                    index,
                    referenced
                );
            }
        }
    }
}

impl Default for ClusterTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::flags::ObjectFlags;

    fn table_with_objects(n: usize) -> (ObjectTable, Vec<ObjectIndex>) {
        static DUMMY: u64 = 0;
        let table = ObjectTable::new();
        let indices = (0..n)
            .map(|_| table.register(crate::util::ObjectRef::from_ref(&DUMMY), ObjectFlags::NONE))
            .collect();
        (table, indices)
    }

    #[test]
    fn create_and_membership() {
        let (table, objs) = table_with_objects(3);
        let clusters = ClusterTable::new();
        let ci = clusters.create_cluster(&table, objs[0]);
        clusters.add_member(&table, ci, objs[1]);
        clusters.add_member(&table, ci, objs[2]);

        assert!(table.index_to_item(objs[0]).is_cluster_root());
        assert_eq!(table.index_to_item(objs[0]).cluster_index(), ci);
        assert_eq!(table.index_to_item(objs[1]).cluster_root_index(), objs[0]);
        assert_eq!(clusters.num_allocated_clusters(), 1);
    }

    #[test]
    fn dissolve_marks_members_unreachable() {
        let (table, objs) = table_with_objects(3);
        let clusters = ClusterTable::new();
        let ci = clusters.create_cluster(&table, objs[0]);
        clusters.add_member(&table, ci, objs[1]);
        clusters.add_member(&table, ci, objs[2]);

        clusters.dissolve_cluster_and_mark_objects_as_unreachable(&table, objs[0]);

        for obj in &objs {
            let item = table.index_to_item(*obj);
            assert!(item.is_unreachable());
            assert!(!item.is_cluster_root());
            assert!(!item.is_cluster_member());
        }
        assert_eq!(clusters.num_allocated_clusters(), 0);
    }

    #[test]
    fn flagged_dissolve_keeps_reachability() {
        let (table, objs) = table_with_objects(2);
        let clusters = ClusterTable::new();
        let ci = clusters.create_cluster(&table, objs[0]);
        clusters.add_member(&table, ci, objs[1]);
        unsafe { clusters.cluster_unsafe_for_gc(ci) }.mark_for_dissolve();
        clusters.set_clusters_need_dissolving();

        assert_eq!(clusters.dissolve_flagged_clusters(&table, false), 1);
        assert!(!clusters.clusters_need_dissolving());
        assert!(!table.index_to_item(objs[0]).is_cluster_root());
        assert!(!table.index_to_item(objs[1]).is_cluster_member());
        assert!(!table.index_to_item(objs[1]).is_unreachable());
    }

    #[test]
    fn cluster_index_reuse() {
        let (table, objs) = table_with_objects(2);
        let clusters = ClusterTable::new();
        let a = clusters.create_cluster(&table, objs[0]);
        clusters.take_cluster(a);
        table.index_to_item(objs[0]).clear_flags(ObjectFlags::CLUSTER_ROOT);
        table.index_to_item(objs[0]).clear_owner();
        let b = clusters.create_cluster(&table, objs[1]);
        assert_eq!(a, b);
    }
}
