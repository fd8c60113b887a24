// Performance counters — wall-clock and memory snapshots between sync points
//
// Usage mirrors how benchmarks are written against the engine:
//
//   let mut counters = engine.create_performance_counters();
//   counters.synchronise();
//   net.run_once()?;
//   counters.synchronise();
//   println!("{} ns", counters[0].value);
//
// Each `synchronise()` closes the interval opened by the previous one and
// updates every counter to describe that interval.

use std::ops::Index;
use std::time::Instant;

use crate::memory;

/// One named measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceCounter {
    pub name: &'static str,
    pub value: u64,
}

/// A set of counters updated at explicit synchronisation points.
pub trait PerformanceCounters: Send + Index<usize, Output = PerformanceCounter> {
    /// Close the current interval and refresh every counter.
    fn synchronise(&mut self);

    /// All counters, in a stable order.
    fn counters(&self) -> &[PerformanceCounter];

    /// Number of counters.
    fn len(&self) -> usize {
        self.counters().len()
    }

    fn is_empty(&self) -> bool {
        self.counters().is_empty()
    }
}

/// Counters for the CPU engine.
///
/// - `[0]` "time ns": wall-clock nanoseconds between the last two syncs
/// - `[1]` "peak memory": peak tensor bytes at the last sync
/// - `[2]` "allocations": storages allocated during the interval
#[derive(Debug)]
pub struct CpuPerformanceCounters {
    last_sync: Option<Instant>,
    last_alloc_count: usize,
    counters: [PerformanceCounter; 3],
}

impl CpuPerformanceCounters {
    pub fn new() -> Self {
        CpuPerformanceCounters {
            last_sync: None,
            last_alloc_count: memory::alloc_count(),
            counters: [
                PerformanceCounter {
                    name: "time ns",
                    value: 0,
                },
                PerformanceCounter {
                    name: "peak memory",
                    value: 0,
                },
                PerformanceCounter {
                    name: "allocations",
                    value: 0,
                },
            ],
        }
    }
}

impl Default for CpuPerformanceCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCounters for CpuPerformanceCounters {
    fn synchronise(&mut self) {
        let now = Instant::now();
        let elapsed = self
            .last_sync
            .map(|t| now.duration_since(t).as_nanos() as u64)
            .unwrap_or(0);
        let allocs = memory::alloc_count();

        self.counters[0].value = elapsed;
        self.counters[1].value = memory::peak_bytes() as u64;
        self.counters[2].value = allocs.saturating_sub(self.last_alloc_count) as u64;

        self.last_sync = Some(now);
        self.last_alloc_count = allocs;
    }

    fn counters(&self) -> &[PerformanceCounter] {
        &self.counters
    }
}

impl Index<usize> for CpuPerformanceCounters {
    type Output = PerformanceCounter;

    fn index(&self, index: usize) -> &PerformanceCounter {
        &self.counters[index]
    }
}
