//! Process-group abstraction for the benchmark.
//!
//! Provides the collective operations the benchmark needs (barrier, name
//! gather, max reduction, communicator split) behind a trait, with a
//! single-process implementation, an in-process threaded group, and an MPI
//! group behind the `distributed` feature.

pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

pub use local::{spawn_ranks, ThreadComm};

use crate::error::Result;

/// Rank that receives gathers and reductions.
pub const ROOT: i32 = 0;

/// Abstraction over a group of cooperating ranks.
///
/// Every collective method must be called by all ranks of the group in the
/// same order. Implementations: `SingleProcessComm`, `ThreadComm`,
/// `MpiComm` (via mpi crate).
pub trait Communicator {
    /// This process's rank within the group.
    fn rank(&self) -> i32;

    /// Number of ranks in the group.
    fn size(&self) -> i32;

    /// Synchronization barrier.
    fn barrier(&self);

    /// Name of the host this rank runs on.
    fn processor_name(&self) -> String;

    /// Collect one string per rank at `ROOT`, ordered by rank.
    ///
    /// Returns `Some` on the root only.
    fn gather_names(&self, local: &str) -> Option<Vec<String>>;

    /// Element-wise maximum of `local` across all ranks, delivered to `ROOT`.
    ///
    /// Every rank must pass a slice of the same length. Returns `Some` on
    /// the root only.
    fn reduce_max(&self, local: &[f64]) -> Option<Vec<f64>>;

    /// Minimum of a scalar across all ranks, delivered to every rank.
    fn all_reduce_min(&self, local: i64) -> i64;

    /// Partition the group by `color`; ranks sharing a color form a new
    /// group ordered by `key`, ties broken by current rank.
    ///
    /// `color` must be non-negative.
    fn split(&self, color: i32, key: i32) -> Result<Box<dyn Communicator>>;

    /// True on every rank iff `ok` is true on every rank.
    fn all_agree(&self, ok: bool) -> bool {
        self.all_reduce_min(i64::from(ok)) == 1
    }
}

/// Best-effort host name without a process-group runtime.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Group of exactly one rank.
///
/// Every collective returns its input unchanged.
pub struct SingleProcessComm;

impl Communicator for SingleProcessComm {
    fn rank(&self) -> i32 {
        0
    }

    fn size(&self) -> i32 {
        1
    }

    fn barrier(&self) {}

    fn processor_name(&self) -> String {
        local_hostname()
    }

    fn gather_names(&self, local: &str) -> Option<Vec<String>> {
        Some(vec![local.to_string()])
    }

    fn reduce_max(&self, local: &[f64]) -> Option<Vec<f64>> {
        Some(local.to_vec())
    }

    fn all_reduce_min(&self, local: i64) -> i64 {
        local
    }

    fn split(&self, color: i32, _key: i32) -> Result<Box<dyn Communicator>> {
        if color < 0 {
            return Err(crate::error::BenchError::Config(format!(
                "split color must be non-negative, got {color}"
            )));
        }
        Ok(Box::new(SingleProcessComm))
    }
}
