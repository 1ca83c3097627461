use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Execution phases tracked per request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Primary index scans.
    PrimaryScan,
    /// Secondary index scans.
    IndexScan,
    /// Keyspace count served by `CountScan`.
    Count,
    /// Document fetches.
    Fetch,
    /// Filter evaluation.
    Filter,
    /// Nest evaluation.
    Nest,
    /// Grouping and aggregation.
    Group,
    /// Sorting.
    Sort,
    /// Result projection.
    Project,
}

impl Phase {
    const ALL: [Phase; 9] = [
        Phase::PrimaryScan,
        Phase::IndexScan,
        Phase::Count,
        Phase::Fetch,
        Phase::Filter,
        Phase::Nest,
        Phase::Group,
        Phase::Sort,
        Phase::Project,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct PhaseCounters {
    count: AtomicU64,
    nanos: AtomicU64,
}

/// Per-request phase counters shared by every operator of a pipeline.
///
/// Scans add their item counts in batches of `phase_update_count`; other
/// operators record one timed call per processed batch.
#[derive(Default)]
pub struct PhaseStats {
    counters: [PhaseCounters; 9],
}

impl std::fmt::Debug for PhaseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot().phases).finish()
    }
}

/// Phase counters at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseSnapshot {
    /// Per phase: items counted and nanoseconds spent.
    pub phases: BTreeMap<Phase, PhaseTotals>,
}

/// Totals for one phase.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTotals {
    /// Items processed.
    pub count: u64,
    /// Time spent, in nanoseconds.
    pub nanos: u64,
}

impl PhaseSnapshot {
    /// Items counted for `phase`.
    pub fn count(&self, phase: Phase) -> u64 {
        self.phases.get(&phase).map_or(0, |t| t.count)
    }
}

impl PhaseStats {
    /// Adds `n` processed items to `phase`.
    pub fn add_count(&self, phase: Phase, n: u64) {
        if n > 0 {
            self.counters[phase.slot()]
                .count
                .fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Adds the time elapsed since `start` to `phase`.
    pub fn record(&self, phase: Phase, start: Instant) {
        let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.counters[phase.slot()]
            .nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    /// Current totals; phases never touched are omitted.
    pub fn snapshot(&self) -> PhaseSnapshot {
        let phases = Phase::ALL
            .iter()
            .filter_map(|phase| {
                let c = &self.counters[phase.slot()];
                let totals = PhaseTotals {
                    count: c.count.load(Ordering::Relaxed),
                    nanos: c.nanos.load(Ordering::Relaxed),
                };
                (totals != PhaseTotals::default()).then_some((*phase, totals))
            })
            .collect();
        PhaseSnapshot { phases }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_omits_idle_phases() {
        let stats = PhaseStats::default();
        stats.add_count(Phase::IndexScan, 100);
        stats.add_count(Phase::IndexScan, 7);
        stats.add_count(Phase::Fetch, 0);
        let snap = stats.snapshot();
        assert_eq!(snap.count(Phase::IndexScan), 107);
        assert!(!snap.phases.contains_key(&Phase::Fetch));
        let json = serde_json::to_value(&snap).expect("serializes");
        assert_eq!(json["phases"]["index_scan"]["count"], 107);
    }
}
