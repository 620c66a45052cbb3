//! Per-class reference schemas: an immutable, reference-counted description
//! of where a class keeps its strong references, so the tracer can visit
//! them without per-object virtual dispatch. Built once per class through
//! [`SchemaBuilder`]; subclasses that add no reference-bearing members and
//! no callback reuse the parent schema by cloning the handle.

use crate::util::ObjectRef;
use std::fmt;
use std::sync::Arc;

/// Signature of an out-of-band reference enumeration callback. Receives the
/// object and a collector to report references not describable by a schema.
pub type AroFn = fn(ObjectRef, &mut dyn ReferenceCollector);

/// The sink ARO callbacks report references into. During a collection cycle
/// the tracer's dispatcher implements this; outside of one, utility walkers
/// (reference finders, verifiers) do.
pub trait ReferenceCollector {
    /// Reports a strong reference slot the collector may overwrite with
    /// null when its target is garbage.
    fn add_killable_reference(&mut self, slot: &mut ObjectRef);

    /// Reports a strong reference the collector will never overwrite.
    fn add_reference(&mut self, object: ObjectRef);

    /// Reports a contiguous run of strong reference slots.
    fn add_references(&mut self, slots: &mut [ObjectRef]) {
        for slot in slots {
            self.add_killable_reference(slot);
        }
    }

    /// Records a slot that must be nulled if its target dies, without
    /// keeping the target alive.
    fn add_weak_reference(&mut self, slot: &mut ObjectRef);
}

/// How a member holds its references. Closed set; the tracer dispatches on
/// this per schema entry.
#[derive(Clone)]
pub enum MemberKind {
    /// A single `ObjectRef` slot.
    Reference,
    /// An `UntypedArray` of `ObjectRef` slots.
    ReferenceArray,
    /// An `UntypedArray` of compound elements, each visited with the nested
    /// schema.
    StructArray(Schema),
    /// Set/map backing store: same traversal as `StructArray`, but elements
    /// may be unoccupied and are visited defensively.
    SparseStructArray(Schema),
    /// An `OptionalSlot` whose payload is visited with the nested schema
    /// when present.
    Optional(Schema),
    /// A `FieldPathSlot`; only the owner slot is strong.
    FieldPath,
    /// An `UntypedArray` of `FieldPathSlot`s.
    FieldPathArray,
    /// A synchronous callback enumerating references the schema cannot
    /// describe.
    Callback(AroFn),
    /// A callback registered as slow; calls are queued to the per-worker
    /// slow queues and drained in batches. The index is the registration
    /// index returned by `register_slow_aro`.
    SlowCallback { index: u32, callback: AroFn },
    /// Reference array backed by the freezable allocator. Traversal is
    /// identical to `ReferenceArray`; frozen pages are never killable.
    FreezableReferenceArray,
    /// Struct array backed by the freezable allocator.
    FreezableStructArray(Schema),
    /// A weak slot: recorded for post-cycle clearing, never traced through.
    Weak,
}

impl fmt::Debug for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MemberKind::Reference => "Reference",
            MemberKind::ReferenceArray => "ReferenceArray",
            MemberKind::StructArray(_) => "StructArray",
            MemberKind::SparseStructArray(_) => "SparseStructArray",
            MemberKind::Optional(_) => "Optional",
            MemberKind::FieldPath => "FieldPath",
            MemberKind::FieldPathArray => "FieldPathArray",
            MemberKind::Callback(_) => "Callback",
            MemberKind::SlowCallback { .. } => "SlowCallback",
            MemberKind::FreezableReferenceArray => "FreezableReferenceArray",
            MemberKind::FreezableStructArray(_) => "FreezableStructArray",
            MemberKind::Weak => "Weak",
        };
        write!(f, "{}", name)
    }
}

/// Where a member's declaration came from. Script-declared members may be
/// nulled by the collector whenever their target is garbage; native members
/// are only nulled when the whole cycle runs with reference elimination.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Native,
    Script,
}

/// One schema entry: a member's byte offset inside the object (or struct
/// element), its kind, its declaration origin and a debug name used in
/// diagnostics.
#[derive(Clone, Debug)]
pub struct Member {
    pub offset: u32,
    pub kind: MemberKind,
    pub origin: Origin,
    pub name: &'static str,
}

struct SchemaInner {
    members: Vec<Member>,
    /// Element stride when this schema describes struct-array elements.
    /// Always a multiple of 8.
    struct_stride: u32,
}

/// Immutable, cheaply clonable handle to a class's reference layout.
#[derive(Clone)]
pub struct Schema(Arc<SchemaInner>);

impl Schema {
    /// The empty schema: a class with no reference-bearing members.
    pub fn empty() -> Schema {
        Schema(Arc::new(SchemaInner {
            members: Vec::new(),
            struct_stride: 0,
        }))
    }

    pub fn members(&self) -> &[Member] {
        &self.0.members
    }

    pub fn is_empty(&self) -> bool {
        self.0.members.is_empty()
    }

    pub fn struct_stride(&self) -> u32 {
        self.0.struct_stride
    }

    /// Whether two handles share one schema (subclass reuse).
    pub fn ptr_eq(&self, other: &Schema) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Schema")
            .field("members", &self.0.members)
            .field("struct_stride", &self.0.struct_stride)
            .finish()
    }
}

/// Builds a schema for one class. `stride` is the object (or struct
/// element) size in bytes and bounds every member offset.
pub struct SchemaBuilder {
    members: Vec<Member>,
    stride: u32,
}

impl SchemaBuilder {
    pub fn new(stride: usize) -> SchemaBuilder {
        assert!(stride % 8 == 0, "schema stride {} is not a multiple of 8", stride);
        SchemaBuilder {
            members: Vec::new(),
            stride: stride as u32,
        }
    }

    /// Seeds the builder with a parent class's members for subclassing.
    pub fn extend(parent: &Schema, stride: usize) -> SchemaBuilder {
        let mut builder = SchemaBuilder::new(stride);
        builder.members.extend_from_slice(parent.members());
        builder
    }

    pub fn add_reference(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member(name, offset, MemberKind::Reference)
    }

    /// A script-declared reference: killable regardless of cycle options.
    pub fn add_script_reference(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member_with_origin(name, offset, MemberKind::Reference, Origin::Script)
    }

    /// A script-declared reference array.
    pub fn add_script_reference_array(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member_with_origin(name, offset, MemberKind::ReferenceArray, Origin::Script)
    }

    pub fn add_weak_reference(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member(name, offset, MemberKind::Weak)
    }

    pub fn add_reference_array(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member(name, offset, MemberKind::ReferenceArray)
    }

    pub fn add_struct_array(
        &mut self,
        name: &'static str,
        offset: usize,
        element: Schema,
    ) -> &mut Self {
        assert!(element.struct_stride() > 0, "struct array element schema needs a stride");
        self.add_member(name, offset, MemberKind::StructArray(element))
    }

    pub fn add_sparse_struct_array(
        &mut self,
        name: &'static str,
        offset: usize,
        element: Schema,
    ) -> &mut Self {
        assert!(element.struct_stride() > 0, "struct array element schema needs a stride");
        self.add_member(name, offset, MemberKind::SparseStructArray(element))
    }

    pub fn add_optional(&mut self, name: &'static str, offset: usize, payload: Schema) -> &mut Self {
        assert!(payload.struct_stride() > 0, "optional payload schema needs a stride");
        self.add_member(name, offset, MemberKind::Optional(payload))
    }

    pub fn add_field_path(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member(name, offset, MemberKind::FieldPath)
    }

    pub fn add_field_path_array(&mut self, name: &'static str, offset: usize) -> &mut Self {
        self.add_member(name, offset, MemberKind::FieldPathArray)
    }

    pub fn add_freezable_reference_array(
        &mut self,
        name: &'static str,
        offset: usize,
    ) -> &mut Self {
        self.add_member(name, offset, MemberKind::FreezableReferenceArray)
    }

    pub fn add_freezable_struct_array(
        &mut self,
        name: &'static str,
        offset: usize,
        element: Schema,
    ) -> &mut Self {
        assert!(element.struct_stride() > 0, "struct array element schema needs a stride");
        self.add_member(name, offset, MemberKind::FreezableStructArray(element))
    }

    /// Registers a synchronous enumeration callback run while the object is
    /// visited.
    pub fn add_callback(&mut self, name: &'static str, callback: AroFn) -> &mut Self {
        self.members.push(Member {
            offset: 0,
            kind: MemberKind::Callback(callback),
            origin: Origin::Native,
            name,
        });
        self
    }

    /// Registers a callback previously registered as slow; `index` is the
    /// value returned by `register_slow_aro`.
    pub fn add_slow_callback(
        &mut self,
        name: &'static str,
        index: u32,
        callback: AroFn,
    ) -> &mut Self {
        self.members.push(Member {
            offset: 0,
            kind: MemberKind::SlowCallback { index, callback },
            origin: Origin::Native,
            name,
        });
        self
    }

    pub fn build(&mut self) -> Schema {
        Schema(Arc::new(SchemaInner {
            members: std::mem::take(&mut self.members),
            struct_stride: self.stride,
        }))
    }

    fn add_member(&mut self, name: &'static str, offset: usize, kind: MemberKind) -> &mut Self {
        self.add_member_with_origin(name, offset, kind, Origin::Native)
    }

    fn add_member_with_origin(
        &mut self,
        name: &'static str,
        offset: usize,
        kind: MemberKind,
        origin: Origin,
    ) -> &mut Self {
        assert!(
            (offset as u32) < self.stride,
            "member {:?} offset {} is past the object (stride {})",
            name,
            offset,
            self.stride
        );
        self.members.push(Member {
            offset: offset as u32,
            kind,
            origin,
            name,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ObjectRef;
    use memoffset::offset_of;

    #[repr(C)]
    struct Holder {
        id: u64,
        target: ObjectRef,
        other: ObjectRef,
    }

    fn noop_aro(_object: ObjectRef, _collector: &mut dyn ReferenceCollector) {}

    #[test]
    fn builder_collects_members() {
        let schema = SchemaBuilder::new(std::mem::size_of::<Holder>())
            .add_reference("target", offset_of!(Holder, target))
            .add_weak_reference("other", offset_of!(Holder, other))
            .build();
        assert_eq!(schema.members().len(), 2);
        assert_eq!(schema.members()[0].offset as usize, offset_of!(Holder, target));
        assert!(matches!(schema.members()[1].kind, MemberKind::Weak));
    }

    #[test]
    fn subclass_extends_parent() {
        let parent = SchemaBuilder::new(24)
            .add_reference("base", 8)
            .build();
        let child = SchemaBuilder::extend(&parent, 40)
            .add_reference("extra", 32)
            .build();
        assert_eq!(child.members().len(), 2);
        assert_eq!(child.members()[0].name, "base");

        // A subclass adding nothing shares the parent's schema outright.
        let alias = parent.clone();
        assert!(alias.ptr_eq(&parent));
        assert!(!child.ptr_eq(&parent));
    }

    #[test]
    #[should_panic(expected = "not a multiple of 8")]
    fn stride_must_be_multiple_of_eight() {
        let _ = SchemaBuilder::new(12);
    }

    #[test]
    #[should_panic(expected = "past the object")]
    fn offsets_are_bounded() {
        SchemaBuilder::new(16).add_reference("bad", 16);
    }

    #[test]
    fn callbacks_carry_no_offset() {
        let schema = SchemaBuilder::new(16)
            .add_callback("extra_refs", noop_aro)
            .build();
        assert!(matches!(schema.members()[0].kind, MemberKind::Callback(_)));
    }
}
