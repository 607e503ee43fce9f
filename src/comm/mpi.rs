//! MPI process group.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let world = MpiComm::world();
//! ```

use mpi::collective::SystemOperation;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use super::{local_hostname, Communicator, ROOT};
use crate::error::{BenchError, Result};

/// Fixed width of a gathered host name, matching `MPI_MAX_PROCESSOR_NAME`.
const NAME_LEN: usize = 256;

/// A rank of an MPI communicator.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

impl MpiComm {
    /// The world communicator.
    pub fn world() -> Self {
        Self {
            comm: SimpleCommunicator::world(),
        }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn size(&self) -> i32 {
        self.comm.size()
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn processor_name(&self) -> String {
        mpi::environment::processor_name().unwrap_or_else(|_| local_hostname())
    }

    fn gather_names(&self, local: &str) -> Option<Vec<String>> {
        let mut buf = [0u8; NAME_LEN];
        let bytes = local.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        buf[..n].copy_from_slice(&bytes[..n]);

        let root = self.comm.process_at_rank(ROOT);
        if self.comm.rank() != ROOT {
            root.gather_into(&buf[..]);
            return None;
        }

        let mut all = vec![0u8; NAME_LEN * self.comm.size() as usize];
        root.gather_into_root(&buf[..], &mut all[..]);
        Some(
            all.chunks(NAME_LEN)
                .map(|chunk| {
                    let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                    String::from_utf8_lossy(&chunk[..end]).into_owned()
                })
                .collect(),
        )
    }

    fn reduce_max(&self, local: &[f64]) -> Option<Vec<f64>> {
        let root = self.comm.process_at_rank(ROOT);
        if self.comm.rank() != ROOT {
            root.reduce_into(local, SystemOperation::max());
            return None;
        }
        let mut out = vec![0.0f64; local.len()];
        root.reduce_into_root(local, &mut out[..], SystemOperation::max());
        Some(out)
    }

    fn all_reduce_min(&self, local: i64) -> i64 {
        let mut global = 0i64;
        self.comm
            .all_reduce_into(&local, &mut global, SystemOperation::min());
        global
    }

    fn split(&self, color: i32, key: i32) -> Result<Box<dyn Communicator>> {
        // Negative colors still take part in the split so peers do not hang.
        let mpi_color = if color < 0 {
            Color::undefined()
        } else {
            Color::with_value(color)
        };
        match self.comm.split_by_color_with_key(mpi_color, key) {
            Some(comm) if color >= 0 => Ok(Box::new(MpiComm { comm })),
            _ => Err(BenchError::Config(format!(
                "split color must be non-negative, got {color}"
            ))),
        }
    }
}
