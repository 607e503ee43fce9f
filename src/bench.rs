//! Benchmark drivers: the writer step loop and the one-shot reader.
//!
//! Both run SPMD: every rank calls the same function with its own
//! communicator and the same configuration. Failures that could leave ranks
//! on different code paths are agreed on across the world group before the
//! next collective call.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use tracing::{debug, info_span};

use crate::comm::{Communicator, ROOT};
use crate::config::{ReaderConfig, WriterConfig};
use crate::error::{BenchError, Result};
use crate::hierarchy::Hierarchy;
use crate::partition::{partition, Partition};
use crate::report;
use crate::storage::{
    ReadHandle, Schema, Selection, StorageEngine, GLOBAL_LEN, LOCAL_COUNT, OFFSET, PAYLOAD,
};
use crate::synth::{fill_step, verify_all, StepVerdict};
use crate::timing::{Phase, PhaseTimings, StepMetrics, MIB};

/// Bytes per payload element.
const ELEM_BYTES: u64 = std::mem::size_of::<i32>() as u64;

/// What one rank saw over a writer run.
#[derive(Debug, Clone)]
pub struct WriteSummary {
    /// Target this rank's group wrote to.
    pub target: String,
    pub partition: Partition,
    pub steps: Vec<StepMetrics>,
}

/// What one rank saw over a reader run.
#[derive(Debug, Clone)]
pub struct ReadSummary {
    pub global_len: u64,
    pub step_count: u32,
    pub partition: Partition,
    pub metrics: StepMetrics,
    pub verdicts: Vec<StepVerdict>,
}

impl ReadSummary {
    pub fn failed_steps(&self) -> usize {
        self.verdicts.iter().filter(|v| !v.passed()).count()
    }
}

/// Turn a local result into one every rank of `world` agrees on.
///
/// Ranks whose own step succeeded get `peer_error` when any other rank
/// failed.
fn agree<T>(
    world: &dyn Communicator,
    local: Result<T>,
    peer_error: fn(String) -> BenchError,
) -> Result<T> {
    if world.all_agree(local.is_ok()) {
        return local;
    }
    Err(match local {
        Err(e) => e,
        Ok(_) => peer_error(format!(
            "failed on another rank (this is rank {})",
            world.rank()
        )),
    })
}

/// Write report text, flush, and agree on the outcome across `world`.
///
/// A closed output stream on one rank (e.g. `stepbench write ... | head`)
/// stops every rank at the same point.
fn emit<W: Write>(
    world: &dyn Communicator,
    out: &mut W,
    write: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let written = write(&mut *out).and_then(|()| Ok(out.flush()?));
    agree(world, written, BenchError::Report)
}

/// Gather host names on the root.
fn host_map(world: &dyn Communicator) -> Option<Vec<String>> {
    world.gather_names(&world.processor_name())
}

/// Run the writer on this rank.
///
/// Rank 0 of `world` prints the info header and the aggregate rows to
/// `out`; every rank prints its own rows.
pub fn run_writer<W: Write>(
    cfg: &WriterConfig,
    world: &dyn Communicator,
    engine: &mut dyn StorageEngine,
    out: &mut W,
) -> Result<WriteSummary> {
    let rank = world.rank();
    let nproc = world.size();
    let global_len = cfg
        .len_per_rank
        .checked_mul(nproc as u64)
        .filter(|gnx| gnx.checked_mul(ELEM_BYTES).is_some())
        .ok_or_else(|| {
            BenchError::Config(format!(
                "--len {} on {} ranks overflows the global array size",
                cfg.len_per_rank, nproc
            ))
        })?;
    let part = partition(global_len, nproc as u32, rank as u32);

    let hosts = host_map(world);
    let hierarchy = Hierarchy::build(world, &cfg.grouping)?;
    let target = hierarchy.target_name(&cfg.output);
    let declared = engine.declare(Schema::benchmark());
    agree(world, declared, BenchError::Config)?;

    let mib_per_rank = (ELEM_BYTES * cfg.len_per_rank) as f64 / MIB;
    emit(world, out, |out| {
        if rank != ROOT {
            return Ok(());
        }
        let fields = [
            ("NX", cfg.len_per_rank.to_string()),
            ("nsteps", cfg.steps.to_string()),
            ("Total NPs", nproc.to_string()),
            ("MBs/proc", format!("{:.3}", mib_per_rank)),
            ("Method", engine.method().to_string()),
            ("Params", cfg.params.clone()),
        ];
        report::write_info(out, &fields, hosts.as_deref().unwrap_or(&[]))?;
        report::write_timing_header(out, true)
    })?;

    let local_bytes = ELEM_BYTES * part.count;
    let total_bytes = ELEM_BYTES * global_len;
    let mut buf = Vec::with_capacity(part.count as usize);
    let mut steps = Vec::with_capacity(cfg.steps as usize);

    for step in 0..cfg.steps {
        let _span = info_span!("write_step", step).entered();
        fill_step(global_len, step, &part, &mut buf);
        let mode = cfg.open_policy.mode_for(step);

        world.barrier();
        let mut timings = PhaseTimings::start();
        let written = write_step(
            engine,
            &target,
            mode,
            hierarchy.comm(),
            &mut timings,
            global_len,
            &part,
            &buf,
            cfg.fsync,
        );
        agree(world, written, BenchError::Transfer)?;
        debug!(%mode, path = %target, "step written");

        world.barrier();
        let metrics = StepMetrics::collect(world, Some(step), &timings, local_bytes, total_bytes);
        emit_rows(world, out, rank, &metrics)?;
        steps.push(metrics);

        if step + 1 < cfg.steps && !cfg.sleep.is_zero() {
            std::thread::sleep(cfg.sleep);
        }
    }

    Ok(WriteSummary {
        target,
        partition: part,
        steps,
    })
}

/// Every rank's own row, then the root's aggregate row.
fn emit_rows<W: Write>(
    world: &dyn Communicator,
    out: &mut W,
    rank: i32,
    metrics: &StepMetrics,
) -> Result<()> {
    emit(world, out, |out| {
        report::write_timing_row(
            out,
            &rank.to_string(),
            metrics.step,
            &metrics.local,
            metrics.local_rates(),
        )
    })?;
    emit(world, out, |out| {
        match (metrics.slowest, metrics.aggregate_rates()) {
            (Some(slowest), Some(rates)) => {
                report::write_timing_row(out, report::ALL_LABEL, metrics.step, &slowest, rates)
            }
            _ => Ok(()),
        }
    })
}

/// Open, put and close one step, marking the phase boundaries.
#[allow(clippy::too_many_arguments)]
fn write_step(
    engine: &dyn StorageEngine,
    target: &str,
    mode: crate::storage::OpenMode,
    comm: &dyn Communicator,
    timings: &mut PhaseTimings,
    global_len: u64,
    part: &Partition,
    data: &[i32],
    fsync: bool,
) -> Result<()> {
    let mut handle = engine.open_write(target, mode, comm)?;
    timings.mark(Phase::Opened);

    let put = (|| {
        handle.put_scalar(GLOBAL_LEN, global_len)?;
        handle.put_scalar(OFFSET, part.offset)?;
        handle.put_scalar(LOCAL_COUNT, part.count)?;
        handle.put_array(PAYLOAD, data)
    })();
    timings.mark(Phase::Transferred);

    let closed = handle.close(fsync);
    timings.mark(Phase::Closed);
    put.and(closed)
}

/// Run the reader on this rank.
///
/// Reads every step of this rank's block in one request, reports timing,
/// then verifies each step. With `cfg.strict` a failed step turns into
/// `BenchError::Verification` after all steps were checked and reported.
pub fn run_reader<W: Write>(
    cfg: &ReaderConfig,
    world: &dyn Communicator,
    engine: &dyn StorageEngine,
    out: &mut W,
) -> Result<ReadSummary> {
    let _span = info_span!("read").entered();
    let rank = world.rank();
    let nproc = world.size();
    let hosts = host_map(world);

    world.barrier();
    let mut timings = PhaseTimings::start();
    let opened = engine.open_read(&cfg.input, world, cfg.open_timeout);

    let query_start = Instant::now();
    let mut handle = agree(world, opened, BenchError::Open)?;
    let gnx = handle.inquire(GLOBAL_LEN).and_then(|info| {
        info.value
            .map(|v| (v, info.step_count))
            .ok_or_else(|| BenchError::Transfer(format!("'{GLOBAL_LEN}' holds no value")))
    });
    let (global_len, step_count) = match agree(world, gnx, BenchError::Transfer) {
        Ok(v) => v,
        Err(e) => {
            handle.close()?;
            return Err(e);
        }
    };
    let query_end = Instant::now();
    timings.exclude(query_end - query_start);
    timings.mark(Phase::Opened);

    let part = partition(global_len, nproc as u32, rank as u32);
    let read = read_block(handle.as_mut(), &part, step_count, &mut timings);
    let closed = handle.close();
    timings.mark(Phase::Closed);
    let data = agree(
        world,
        read.and_then(|d| closed.map(|_| d)),
        BenchError::Transfer,
    )?;
    debug!(
        global_len,
        step_count,
        offset = part.offset,
        count = part.count,
        "block read"
    );

    let mib_per_rank = (ELEM_BYTES * global_len) as f64 / nproc as f64 / MIB;
    emit(world, out, |out| {
        if rank != ROOT {
            return Ok(());
        }
        let fields = [
            ("gnx", global_len.to_string()),
            ("nsteps", step_count.to_string()),
            ("Total NPs", nproc.to_string()),
            ("MBs/proc", format!("{:.3}", mib_per_rank)),
            ("Method", engine.method().to_string()),
            ("Params", cfg.params.clone()),
        ];
        report::write_info(out, &fields, hosts.as_deref().unwrap_or(&[]))?;
        report::write_timing_header(out, false)
    })?;

    let steps = u64::from(step_count);
    let metrics = StepMetrics::collect(
        world,
        None,
        &timings,
        ELEM_BYTES * steps * part.count,
        ELEM_BYTES * steps * global_len,
    );
    emit_rows(world, out, rank, &metrics)?;

    let verdicts = verify_all(global_len, step_count, &part, &data);
    emit(world, out, |out| {
        verdicts
            .iter()
            .try_for_each(|verdict| report::write_verdict(out, rank, verdict))
    })?;

    if let Some(dir) = &cfg.dump_dir {
        let dumped = dump_block(dir, &part, step_count, &data);
        agree(world, dumped, BenchError::Transfer)?;
    }

    let summary = ReadSummary {
        global_len,
        step_count,
        partition: part,
        metrics,
        verdicts,
    };
    let failed_steps = summary.failed_steps();
    if cfg.strict && failed_steps > 0 {
        return Err(BenchError::Verification { failed_steps });
    }
    Ok(summary)
}

/// Schedule and perform the read of `part` for every step.
fn read_block(
    handle: &mut dyn ReadHandle,
    part: &Partition,
    step_count: u32,
    timings: &mut PhaseTimings,
) -> Result<Vec<i32>> {
    let selection = Selection {
        offset: part.offset,
        count: part.count,
    };
    let id = handle.schedule_read(PAYLOAD, selection, 0..step_count)?;
    let mut batch = handle.perform_reads()?;
    timings.mark(Phase::Transferred);
    batch.take(id)
}

fn dump_block(
    dir: &std::path::Path,
    part: &Partition,
    step_count: u32,
    data: &[i32],
) -> Result<()> {
    let path = dir.join(format!("reader.{}.txt", part.rank));
    let mut w = BufWriter::new(File::create(&path)?);
    report::write_rank_dump(&mut w, part, step_count, data)?;
    w.flush()?;
    debug!(path = %path.display(), "reader dump written");
    Ok(())
}
