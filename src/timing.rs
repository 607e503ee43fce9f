//! Phase timing and throughput for one benchmark step.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::comm::Communicator;

/// Bytes per MiB, the unit all throughput figures use.
pub const MIB: f64 = 1024.0 * 1024.0;

/// Boundaries recorded within one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Before the open, right after the step's synchronization barrier.
    Start,
    /// Target opened and ready for data.
    Opened,
    /// Data handed to the backend, close not yet started.
    Transferred,
    /// Close returned.
    Closed,
}

/// Timestamps for one step on one rank. Built fresh every step.
#[derive(Debug, Clone)]
pub struct PhaseTimings {
    marks: BTreeMap<Phase, Instant>,
    excluded: Duration,
}

impl PhaseTimings {
    /// Start timing now.
    pub fn start() -> Self {
        let mut marks = BTreeMap::new();
        marks.insert(Phase::Start, Instant::now());
        Self {
            marks,
            excluded: Duration::ZERO,
        }
    }

    /// Record that `phase` was reached now.
    pub fn mark(&mut self, phase: Phase) {
        self.marks.insert(phase, Instant::now());
    }

    /// Leave `d` out of the total (e.g. a metadata query between phases).
    pub fn exclude(&mut self, d: Duration) {
        self.excluded += d;
    }

    pub fn at(&self, phase: Phase) -> Option<Instant> {
        self.marks.get(&phase).copied()
    }

    /// Time from `phase` to `Closed`; zero when either mark is missing.
    fn until_closed(&self, phase: Phase) -> Duration {
        match (self.at(phase), self.at(Phase::Closed)) {
            (Some(from), Some(to)) => to.saturating_duration_since(from),
            _ => Duration::ZERO,
        }
    }

    pub fn elapsed(&self) -> Elapsed {
        Elapsed {
            total: self.until_closed(Phase::Start).saturating_sub(self.excluded),
            from_open: self.until_closed(Phase::Opened),
            from_transfer_done: self.until_closed(Phase::Transferred),
        }
    }
}

/// The three durations reported per step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Elapsed {
    pub total: Duration,
    pub from_open: Duration,
    pub from_transfer_done: Duration,
}

impl Elapsed {
    pub fn as_secs(&self) -> [f64; 3] {
        [
            self.total.as_secs_f64(),
            self.from_open.as_secs_f64(),
            self.from_transfer_done.as_secs_f64(),
        ]
    }

    pub fn from_secs(secs: [f64; 3]) -> Self {
        let d = |s: f64| Duration::from_secs_f64(s.max(0.0));
        Self {
            total: d(secs[0]),
            from_open: d(secs[1]),
            from_transfer_done: d(secs[2]),
        }
    }

    /// Throughput of `bytes` over each duration, in MiB/s.
    pub fn rates(&self, bytes: u64) -> [f64; 3] {
        self.as_secs().map(|s| mib_per_sec(bytes, s))
    }
}

/// `bytes / secs` in MiB/s. A zero duration gives infinity.
pub fn mib_per_sec(bytes: u64, secs: f64) -> f64 {
    bytes as f64 / secs / MIB
}

/// Local and (on the root) max-reduced timings for one step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: Option<u32>,
    pub local: Elapsed,
    pub local_bytes: u64,
    /// Slowest rank's durations; `Some` on the root only.
    pub slowest: Option<Elapsed>,
    pub total_bytes: u64,
}

impl StepMetrics {
    /// Reduce this rank's timings across `comm`. Collective.
    pub fn collect(
        comm: &dyn Communicator,
        step: Option<u32>,
        timings: &PhaseTimings,
        local_bytes: u64,
        total_bytes: u64,
    ) -> Self {
        let local = timings.elapsed();
        let slowest = comm.reduce_max(&local.as_secs()).map(|v| {
            let mut secs = [0.0; 3];
            secs.copy_from_slice(&v[..3]);
            Elapsed::from_secs(secs)
        });
        Self {
            step,
            local,
            local_bytes,
            slowest,
            total_bytes,
        }
    }

    pub fn local_rates(&self) -> [f64; 3] {
        self.local.rates(self.local_bytes)
    }

    /// Aggregate rates: all ranks' bytes over the slowest rank's time.
    pub fn aggregate_rates(&self) -> Option<[f64; 3]> {
        self.slowest.map(|e| e.rates(self.total_bytes))
    }
}
