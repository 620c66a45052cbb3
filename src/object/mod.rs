//! The managed-object data model: index table, per-object flags, clusters,
//! container layouts and per-class reference schemas.

pub mod cluster;
pub mod flags;
pub mod layout;
pub mod schema;
pub mod table;

pub use cluster::{Cluster, ClusterTable};
pub use flags::{KeepFlags, ObjectFlags};
pub use layout::{FieldPathSlot, OptionalSlot, RefArray, TypedArray, UntypedArray};
pub use schema::{AroFn, Member, MemberKind, ReferenceCollector, Schema, SchemaBuilder};
pub use table::{ObjectIndex, ObjectItem, ObjectTable};
