//! The interface the collector consumes from its embedder. The binding
//! owns object allocation, class reflection and lifecycle hooks; the
//! collector owns the index table, reachability and the purge pipeline.

use crate::object::flags::KeepFlags;
use crate::object::schema::Schema;
use crate::object::table::ObjectIndex;
use crate::util::{Address, ObjectRef};

/// Per-class data the collector needs: the reference schema and a name for
/// diagnostics. One instance per class, owned by the binding for the life
/// of the process.
pub struct ClassInfo {
    pub name: &'static str,
    pub schema: Schema,
}

impl ClassInfo {
    pub fn new(name: &'static str, schema: Schema) -> ClassInfo {
        ClassInfo { name, schema }
    }
}

/// Root reference slots for one cycle. Native references are addresses of
/// `ObjectRef` slots living outside managed objects (subsystem tables,
/// stacks); they are split across tracing workers.
#[derive(Default)]
pub struct RootSet {
    pub native_references: Vec<Address>,
}

impl RootSet {
    pub fn add_native_reference(&mut self, slot: &ObjectRef) {
        self.native_references.push(Address::from_ref(slot));
    }

    pub fn add_native_reference_address(&mut self, slot: Address) {
        self.native_references.push(slot);
    }
}

/// Everything the collector consumes from the embedder. All methods are
/// associated functions: the binding is a type-level plug, not an object,
/// so tracing monomorphizes against it.
///
/// Thread-safety contract: `class_of`, `object_index`, `is_permanent` and
/// `is_resolved` are called from tracing workers concurrently;
/// `destroy`/`free_object` are called from the purge thread for objects
/// whose `is_destruction_thread_safe` returns true, with the object table
/// lock held around the destructor.
pub trait Binding: 'static + Sized + Send + Sync {
    /// The object's class metadata. Hot path; must not lock.
    fn class_of(object: ObjectRef) -> &'static ClassInfo;

    /// Reads back the table index published with `set_object_index`.
    /// Hot path; the batcher prefetches the object header around it.
    fn object_index(object: ObjectRef) -> ObjectIndex;

    /// Publishes the object's table index into its header at registration.
    fn set_object_index(object: ObjectRef, index: ObjectIndex);

    /// Objects in the permanent pool are never traced or collected.
    fn is_permanent(_object: ObjectRef) -> bool {
        false
    }

    /// Unresolved handles (lazy or soft references) are skipped by the
    /// validation stage; the collector never forces resolution.
    fn is_resolved(_object: ObjectRef) -> bool {
        true
    }

    /// Tests the caller-supplied keep flags against the object's own
    /// user-level flags during mark.
    fn has_any_keep_flags(_object: ObjectRef, _keep: KeepFlags) -> bool {
        false
    }

    /// Enumerates the native reference slots that seed reachability.
    fn enumerate_roots(_roots: &mut RootSet) {}

    /// Starts asynchronous teardown. Called at most once per object, from
    /// the thread driving the incremental unhash.
    fn begin_destroy(object: ObjectRef);

    /// Whether the asynchronous cleanup started by `begin_destroy` has
    /// finished. Polled; may itself advance the release.
    fn is_ready_for_finish_destroy(_object: ObjectRef) -> bool {
        true
    }

    /// Completes teardown. Called once, after `is_ready_for_finish_destroy`
    /// returned true.
    fn finish_destroy(object: ObjectRef);

    /// Whether the destructor may run on the purge thread.
    fn is_destruction_thread_safe(_object: ObjectRef) -> bool {
        false
    }

    /// Runs the destructor. The object table lock is held.
    fn destroy(object: ObjectRef);

    /// Returns the object's storage to the allocator. Must be safe to call
    /// from the purge thread while the object table lock is held.
    fn free_object(object: ObjectRef);
}
