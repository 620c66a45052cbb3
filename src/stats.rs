//! Per-worker and per-cycle statistics. Workers accumulate into their own
//! context during tracing; the main thread merges and logs at phase ends.

use enum_map::{Enum, EnumMap};
use std::time::Duration;

/// Counters one tracing worker accumulates. Merged single-threaded after
/// the reachability phase.
#[derive(Default, Clone, Copy)]
pub struct WorkerStats {
    pub num_objects: u64,
    pub num_references: u64,
    /// A reference kept a garbage-flagged object alive this cycle. Triggers
    /// the attribution rerun when garbage-reference tracking is enabled.
    pub found_garbage_ref: bool,
}

impl WorkerStats {
    pub fn add_objects(&mut self, count: u64) {
        self.num_objects += count;
    }

    pub fn add_references(&mut self, count: u64) {
        self.num_references += count;
    }

    pub fn track_potential_garbage_reference(&mut self, is_garbage: bool) {
        self.found_garbage_ref |= is_garbage;
    }

    pub fn add_stats(&mut self, other: &WorkerStats) {
        self.num_objects += other.num_objects;
        self.num_references += other.num_references;
        self.found_garbage_ref |= other.found_garbage_ref;
    }
}

/// The phases a cycle moves through, in order. Keys the per-phase timing
/// table and the purge pipeline's resumable state.
#[derive(Copy, Clone, Debug, Enum, Eq, PartialEq)]
pub enum GcPhase {
    Mark,
    Reachability,
    Gather,
    ClearWeak,
    Unhash,
    Purge,
}

/// Wall-clock spent per phase in the last cycle.
#[derive(Default)]
pub struct PhaseTimes {
    times: EnumMap<GcPhase, Duration>,
}

impl PhaseTimes {
    pub fn reset(&mut self) {
        self.times = EnumMap::default();
    }

    pub fn record(&mut self, phase: GcPhase, elapsed: Duration) {
        self.times[phase] += elapsed;
    }

    pub fn get(&self, phase: GcPhase) -> Duration {
        self.times[phase]
    }

    pub fn log_summary(&self) {
        for (phase, time) in &self.times {
            if !time.is_zero() {
                log::debug!("{:?}: {:.3} ms", phase, time.as_secs_f64() * 1000.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_stats_merge() {
        let mut a = WorkerStats::default();
        a.add_objects(3);
        a.add_references(10);
        let mut b = WorkerStats::default();
        b.add_references(5);
        b.track_potential_garbage_reference(true);
        a.add_stats(&b);
        assert_eq!(a.num_objects, 3);
        assert_eq!(a.num_references, 15);
        assert!(a.found_garbage_ref);
    }

    #[test]
    fn phase_times_accumulate() {
        let mut times = PhaseTimes::default();
        times.record(GcPhase::Mark, Duration::from_millis(2));
        times.record(GcPhase::Mark, Duration::from_millis(3));
        assert_eq!(times.get(GcPhase::Mark), Duration::from_millis(5));
        times.reset();
        assert_eq!(times.get(GcPhase::Mark), Duration::ZERO);
    }
}
