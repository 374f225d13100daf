use std::collections::VecDeque;
use std::time::Duration;

/// What one drain did, for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Operations executed, including ones enqueued while the drain was running.
    pub operations: usize,
    /// Passes over the queue before it was observed empty.
    pub cycles: usize,
    /// Chunks considered for eviction.
    pub candidates: usize,
    /// Dirty chunks written to storage before eviction.
    pub saved: usize,
    /// Chunks dropped from memory.
    pub evicted: usize,
    /// Chunks resident when the drain went idle.
    pub resident: usize,
    pub duration: Duration,
}

/// Outcome of a call to process the operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was already running; this call did nothing.
    AlreadyDraining,
    Drained(DrainStats),
}

impl DrainOutcome {
    pub fn stats(&self) -> Option<&DrainStats> {
        match self {
            Self::AlreadyDraining => None,
            Self::Drained(stats) => Some(stats),
        }
    }
}

/// The most recent drains, oldest first.
#[derive(Debug, Clone)]
pub struct DrainHistory {
    drains: VecDeque<DrainStats>,
    capacity: usize,
}

impl DrainHistory {
    /// Keep the last `capacity` drains, at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            drains: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, stats: DrainStats) {
        if self.drains.len() == self.capacity {
            self.drains.pop_front();
        }
        self.drains.push_back(stats);
    }

    pub fn len(&self) -> usize {
        self.drains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drains.is_empty()
    }

    pub fn last(&self) -> Option<&DrainStats> {
        self.drains.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrainStats> + '_ {
        self.drains.iter()
    }

    /// Counters summed over the kept drains. `duration` is the total time spent draining and
    /// `resident` is the latest count.
    pub fn totals(&self) -> DrainStats {
        self.drains.iter().fold(DrainStats::default(), |acc, d| DrainStats {
            operations: acc.operations + d.operations,
            cycles: acc.cycles + d.cycles,
            candidates: acc.candidates + d.candidates,
            saved: acc.saved + d.saved,
            evicted: acc.evicted + d.evicted,
            resident: d.resident,
            duration: acc.duration + d.duration,
        })
    }

    pub fn mean_duration(&self) -> Duration {
        match u32::try_from(self.drains.len()) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.totals().duration / n,
            Err(_) => Duration::ZERO,
        }
    }

    /// The drain that took longest.
    pub fn slowest(&self) -> Option<&DrainStats> {
        self.drains.iter().max_by_key(|d| d.duration)
    }
}
