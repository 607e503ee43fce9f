//! In-process rank group: one thread per rank.
//!
//! Ranks exchange values through a shared slot table; each collective is a
//! deposit, a barrier, a read, and a second barrier so slots are not
//! overwritten while a slower rank is still reading them.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use super::{local_hostname, Communicator, ROOT};
use crate::error::{BenchError, Result};

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    Name(String),
    Values(Vec<f64>),
    Int(i64),
    Split { color: i32, key: i32 },
}

struct Hub {
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
    /// Child groups keyed by (split generation, color).
    children: Mutex<HashMap<(u64, i32), Arc<Hub>>>,
}

impl Hub {
    fn new(size: usize) -> Self {
        Self {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Slot::Empty; size]),
            children: Mutex::new(HashMap::new()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock means another rank panicked mid-collective; its
    // data is still consistent for our purposes.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One rank of an in-process group.
pub struct ThreadComm {
    hub: Arc<Hub>,
    rank: usize,
    size: usize,
    splits: Cell<u64>,
    host: String,
}

impl ThreadComm {
    fn exchange(&self, slot: Slot) -> Vec<Slot> {
        lock(&self.hub.slots)[self.rank] = slot;
        self.hub.barrier.wait();
        let all = lock(&self.hub.slots).clone();
        self.hub.barrier.wait();
        all
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> i32 {
        self.rank as i32
    }

    fn size(&self) -> i32 {
        self.size as i32
    }

    fn barrier(&self) {
        self.hub.barrier.wait();
    }

    fn processor_name(&self) -> String {
        self.host.clone()
    }

    fn gather_names(&self, local: &str) -> Option<Vec<String>> {
        let all = self.exchange(Slot::Name(local.to_string()));
        (self.rank() == ROOT).then(|| {
            all.into_iter()
                .map(|slot| match slot {
                    Slot::Name(name) => name,
                    other => unreachable!("mismatched collective: expected name, got {other:?}"),
                })
                .collect()
        })
    }

    fn reduce_max(&self, local: &[f64]) -> Option<Vec<f64>> {
        let all = self.exchange(Slot::Values(local.to_vec()));
        if self.rank() != ROOT {
            return None;
        }
        let mut out = vec![f64::NEG_INFINITY; local.len()];
        for slot in all {
            let Slot::Values(values) = slot else {
                unreachable!("mismatched collective: expected values, got {slot:?}");
            };
            assert_eq!(values.len(), out.len(), "reduce_max length differs across ranks");
            for (acc, v) in out.iter_mut().zip(values) {
                *acc = acc.max(v);
            }
        }
        Some(out)
    }

    fn all_reduce_min(&self, local: i64) -> i64 {
        self.exchange(Slot::Int(local))
            .into_iter()
            .map(|slot| match slot {
                Slot::Int(v) => v,
                other => unreachable!("mismatched collective: expected int, got {other:?}"),
            })
            .min()
            .unwrap_or(local)
    }

    fn split(&self, color: i32, key: i32) -> Result<Box<dyn Communicator>> {
        let all = self.exchange(Slot::Split { color, key });
        let generation = self.splits.get();
        self.splits.set(generation + 1);

        if color < 0 {
            return Err(BenchError::Config(format!(
                "split color must be non-negative, got {color}"
            )));
        }

        let mut members: Vec<(i32, usize)> = all
            .iter()
            .enumerate()
            .filter_map(|(rank, slot)| match *slot {
                Slot::Split { color: c, key: k } if c == color => Some((k, rank)),
                _ => None,
            })
            .collect();
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, rank)| rank == self.rank)
            .ok_or_else(|| BenchError::Config("rank missing from its own split group".into()))?;

        let hub = Arc::clone(
            lock(&self.hub.children)
                .entry((generation, color))
                .or_insert_with(|| Arc::new(Hub::new(members.len()))),
        );

        Ok(Box::new(ThreadComm {
            hub,
            rank: new_rank,
            size: members.len(),
            splits: Cell::new(0),
            host: self.host.clone(),
        }))
    }
}

/// Run `f` once per rank on `size` scoped threads and collect the results
/// in rank order.
pub fn spawn_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ThreadComm) -> T + Sync,
{
    assert!(size >= 1, "a rank group needs at least one rank");
    let hub = Arc::new(Hub::new(size));
    let host = local_hostname();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let comm = ThreadComm {
                    hub: Arc::clone(&hub),
                    rank,
                    size,
                    splits: Cell::new(0),
                    host: host.clone(),
                };
                let f = &f;
                std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || f(comm))
                    .unwrap_or_else(|e| panic!("failed to spawn rank {rank}: {e}"))
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
            .collect()
    })
}
