//! Deterministic synthetic payload shared by the writer and the reader.
//!
//! The value at `(step, global_index)` depends only on the global array
//! length, so a reader started independently of the writer can check every
//! element it gets back.

use crate::partition::Partition;

/// Modulus applied to every generated value (`2^31 - 1`).
pub const MODULUS: u64 = i32::MAX as u64;

/// Value stored at `global_index` of the global array in step `step`.
///
/// Computes `(global_len * step + global_index) mod (2^31 - 1)` without
/// intermediate overflow.
pub fn value_at(global_len: u64, step: u32, global_index: u64) -> i32 {
    let scaled = (global_len % MODULUS) * (u64::from(step) % MODULUS) % MODULUS;
    ((scaled + global_index % MODULUS) % MODULUS) as i32
}

/// Fill `buf` with this rank's block for `step`, reusing its allocation.
pub fn fill_step(global_len: u64, step: u32, part: &Partition, buf: &mut Vec<i32>) {
    buf.clear();
    buf.extend((part.offset..part.end()).map(|i| value_at(global_len, step, i)));
}

/// One element that came back different from what the writer produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub step: u32,
    pub local_index: u64,
    pub global_index: u64,
    pub observed: i32,
    pub expected: i32,
}

/// Outcome of checking one step of one rank's block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepVerdict {
    pub step: u32,
    pub mismatches: Vec<Mismatch>,
}

impl StepVerdict {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Check one step's worth of data for this rank's block.
pub fn verify_step(global_len: u64, step: u32, part: &Partition, data: &[i32]) -> StepVerdict {
    let mismatches = data
        .iter()
        .zip(part.offset..part.end())
        .enumerate()
        .filter_map(|(local, (&observed, global))| {
            let expected = value_at(global_len, step, global);
            (observed != expected).then_some(Mismatch {
                step,
                local_index: local as u64,
                global_index: global,
                observed,
                expected,
            })
        })
        .collect();

    StepVerdict { step, mismatches }
}

/// Check a `[step][local_index]` buffer covering `step_count` steps.
///
/// Every step is checked even after a failing one.
pub fn verify_all(
    global_len: u64,
    step_count: u32,
    part: &Partition,
    data: &[i32],
) -> Vec<StepVerdict> {
    let per_step = part.count as usize;
    (0..step_count)
        .map(|step| {
            let start = step as usize * per_step;
            let chunk = data.get(start..start + per_step).unwrap_or(&[]);
            let mut verdict = verify_step(global_len, step, part, chunk);
            // A short buffer is reported against the first missing element.
            if chunk.len() < per_step {
                verdict.mismatches.push(Mismatch {
                    step,
                    local_index: chunk.len() as u64,
                    global_index: part.offset + chunk.len() as u64,
                    observed: 0,
                    expected: value_at(global_len, step, part.offset + chunk.len() as u64),
                });
            }
            verdict
        })
        .collect()
}
