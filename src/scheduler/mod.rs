//! Worker machinery for the parallel reachability phase: per-worker
//! contexts, work blocks on work-stealing queues, the coordinator that
//! starts/spins/stops workers, and the slow-callback queues.

pub mod aro;
pub mod context;
pub mod coordinator;
pub mod queue;

pub use aro::{AroFlags, SlowAroManager, MAX_SLOW_AROS};
pub use context::{ContextPoolScope, GarbageReference, WorkerContext};
pub use coordinator::{process_async, WorkCoordinator};
pub use queue::{BoundedQueue, QueueManager, WorkBlock, WorkBlockifier, BLOCK_CAPACITY};
