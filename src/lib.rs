//! Scythe is a concurrent, incremental, parallel mark-sweep garbage
//! collector for a large, externally allocated managed-object universe.
//!
//! Objects register themselves in a global, chunked, index-addressable
//! [table](object::ObjectTable) and expose their outgoing strong references
//! through a compact per-class [reference schema](object::Schema); the
//! collector periodically determines which objects are reachable from a
//! root set and destroys the rest in three phases:
//!
//! * **mark**: a parallel sweep that tags everything not kept by the root
//!   set or keep flags as a destruction candidate;
//! * **reachability**: parallel tracing over lock-free work-stealing
//!   queues, with batched reference prefetching, per-worker page caches, a
//!   cluster fast path for read-mostly content and weak-reference
//!   post-processing;
//! * **purge**: a two-phase *BeginDestroy → FinishDestroy* teardown that
//!   tolerates objects waiting on other subsystems' asynchronous release,
//!   followed by destructor + free on a dedicated purge thread, all
//!   time-sliced against per-frame budgets.
//!
//! The embedder plugs in through the [`vm::Binding`] trait: allocation,
//! class reflection, root enumeration and the per-object lifecycle hooks
//! stay on its side; the collector owns reachability and destruction.
//!
//! The mark phase is stop-the-world (gated by the GC lock which mutators
//! share through [`collector::MutatorGuard`]); the unhash and purge phases
//! are cooperative and incremental, resumable across frames via
//! [`collector::Collector::incremental_purge_garbage`].

pub mod collector;
pub mod events;
pub mod global_state;
pub mod object;
pub mod stats;
pub mod util;
pub mod vm;

pub(crate) mod phase;
pub(crate) mod scheduler;
pub(crate) mod tracer;

pub use collector::{Collector, MutatorGuard};
pub use events::{EventHandle, Events};
pub use object::{
    KeepFlags, ObjectFlags, ObjectIndex, ObjectTable, ReferenceCollector, Schema, SchemaBuilder,
};
pub use scheduler::aro::AroFlags;
pub use stats::WorkerStats;
pub use util::options::Options;
pub use util::{Address, ObjectRef};
pub use vm::{Binding, ClassInfo, RootSet};
