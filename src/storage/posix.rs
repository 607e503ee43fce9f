//! `POSIX` method: a target is a directory shared by one communicator.
//!
//! Each member rank `r` of the opening communicator owns two files:
//!
//! - `data.<r>`: raw little-endian `i32` array blocks, appended step by step
//! - `index.<r>`: one JSON record per step with the step's scalars and the
//!   placement and file position of each array block
//!
//! Ranks never write each other's files, so a step needs no locking. Readers
//! merge every member's index.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{
    require_schema, ReadBatch, ReadHandle, ReadId, Schema, Selection, StepWrites, StorageEngine,
    VarInfo, WriteHandle, OpenMode,
};
use crate::comm::Communicator;
use crate::error::{BenchError, Result};

const ELEM: u64 = std::mem::size_of::<i32>() as u64;

/// How often a streaming open re-checks the target.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArrayRecord {
    name: String,
    global: u64,
    offset: u64,
    count: u64,
    /// Byte position in the owner's data file.
    pos: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRecord {
    step: u32,
    scalars: BTreeMap<String, u64>,
    arrays: Vec<ArrayRecord>,
}

fn data_path(dir: &Path, rank: u32) -> PathBuf {
    dir.join(format!("data.{rank}"))
}

fn index_path(dir: &Path, rank: u32) -> PathBuf {
    dir.join(format!("index.{rank}"))
}

pub struct PosixEngine {
    schema: Option<Arc<Schema>>,
    buffered: bool,
}

impl PosixEngine {
    /// Build from parsed `key=value` parameters.
    pub fn new(params: &[(String, String)]) -> Result<Self> {
        let mut buffered = true;
        for (key, value) in params {
            match key.as_str() {
                "verbose" => tracing::debug!(level = %value, "POSIX verbose parameter accepted"),
                "buffer" => {
                    buffered = match value.to_ascii_lowercase().as_str() {
                        "on" | "1" | "true" | "yes" => true,
                        "off" | "0" | "false" | "no" => false,
                        other => {
                            return Err(BenchError::Config(format!(
                                "POSIX parameter buffer={other}: expected on or off"
                            )))
                        }
                    }
                }
                other => tracing::warn!(param = other, "ignoring unknown POSIX parameter"),
            }
        }
        Ok(Self {
            schema: None,
            buffered,
        })
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn read_index(path: &Path) -> Result<Vec<StepRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

impl StorageEngine for PosixEngine {
    fn method(&self) -> &'static str {
        "POSIX"
    }

    fn declare(&mut self, schema: Schema) -> Result<()> {
        self.schema = Some(Arc::new(schema));
        Ok(())
    }

    fn open_write(
        &self,
        target: &str,
        mode: OpenMode,
        comm: &dyn Communicator,
    ) -> Result<Box<dyn WriteHandle>> {
        let schema = require_schema(&self.schema)?;
        let dir = PathBuf::from(target);
        let rank = comm.rank() as u32;

        let step = match mode {
            OpenMode::Create => {
                let cleared = if rank == 0 { reset_dir(&dir) } else { Ok(()) };
                if !comm.all_agree(cleared.is_ok()) {
                    return Err(match cleared {
                        Err(e) => BenchError::Open(format!("{target}: {e}")),
                        Ok(()) => BenchError::Open(format!(
                            "{target}: group root could not create it"
                        )),
                    });
                }
                0
            }
            OpenMode::Append => {
                fs::create_dir_all(&dir).map_err(|e| BenchError::Open(format!("{target}: {e}")))?;
                let previous = read_index(&index_path(&dir, rank))
                    .map_err(|e| BenchError::Open(format!("{target}: bad index: {e}")))?;
                previous.iter().map(|r| r.step + 1).max().unwrap_or(0)
            }
        };

        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_path(&dir, rank))
            .map_err(|e| BenchError::Open(format!("{target}: {e}")))?;
        let pos = data.metadata()?.len();

        tracing::debug!(path = target, %mode, rank, step, "POSIX target opened");
        Ok(Box::new(PosixWriter {
            dir,
            rank,
            step,
            data,
            pos,
            buffered: self.buffered,
            pending: Vec::new(),
            writes: StepWrites::new(schema),
            arrays: Vec::new(),
        }))
    }

    fn open_read(
        &self,
        target: &str,
        _comm: &dyn Communicator,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn ReadHandle>> {
        let dir = PathBuf::from(target);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let found = load_indices(&dir);
            match found {
                Ok(records) if !records.is_empty() => {
                    tracing::debug!(
                        path = target,
                        records = records.len(),
                        "POSIX target opened for reading"
                    );
                    return Ok(Box::new(PosixReader {
                        dir,
                        records,
                        files: HashMap::new(),
                        scheduled: Vec::new(),
                    }));
                }
                Ok(_) | Err(_) if deadline.is_some_and(|d| Instant::now() < d) => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Ok(_) => return Err(BenchError::Open(format!("{target}: target holds no steps"))),
                Err(e) => return Err(BenchError::Open(format!("{target}: {e}"))),
            }
        }
    }
}

/// Every member's index records, tagged with the owning rank.
fn load_indices(dir: &Path) -> Result<Vec<(u32, StepRecord)>> {
    let mut all = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(rank) = name
            .to_str()
            .and_then(|n| n.strip_prefix("index."))
            .and_then(|r| r.parse::<u32>().ok())
        else {
            continue;
        };
        for record in read_index(&entry.path())? {
            all.push((rank, record));
        }
    }
    all.sort_by_key(|(rank, record)| (record.step, *rank));
    Ok(all)
}

struct PosixWriter {
    dir: PathBuf,
    rank: u32,
    step: u32,
    data: File,
    pos: u64,
    buffered: bool,
    pending: Vec<u8>,
    writes: StepWrites,
    arrays: Vec<ArrayRecord>,
}

impl WriteHandle for PosixWriter {
    fn put_scalar(&mut self, name: &str, value: u64) -> Result<()> {
        self.writes.put_scalar(name, value)
    }

    fn put_array(&mut self, name: &str, data: &[i32]) -> Result<()> {
        let placement = self.writes.put_array(name, data.len())?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();

        if self.buffered {
            self.pending.extend_from_slice(&bytes);
        } else {
            self.data
                .write_all(&bytes)
                .map_err(|e| BenchError::Transfer(format!("writing '{name}': {e}")))?;
        }

        self.arrays.push(ArrayRecord {
            name: name.to_string(),
            global: placement.global,
            offset: placement.offset,
            count: placement.count,
            pos: self.pos,
        });
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn close(mut self: Box<Self>, sync: bool) -> Result<()> {
        let step = self.step;
        let transfer =
            |e: std::io::Error| BenchError::Transfer(format!("closing step {step}: {e}"));

        if !self.pending.is_empty() {
            self.data.write_all(&self.pending).map_err(transfer)?;
        }
        if sync {
            self.data.sync_all().map_err(transfer)?;
        }

        let record = StepRecord {
            step,
            scalars: self.writes.scalars().clone(),
            arrays: std::mem::take(&mut self.arrays),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(index_path(&self.dir, self.rank))
            .map_err(transfer)?;
        index.write_all(line.as_bytes()).map_err(transfer)?;
        if sync {
            index.sync_all().map_err(transfer)?;
        }
        tracing::debug!(rank = self.rank, step, sync, "POSIX step closed");
        Ok(())
    }
}

struct ScheduledRead {
    name: String,
    selection: Selection,
    steps: Range<u32>,
}

struct PosixReader {
    dir: PathBuf,
    records: Vec<(u32, StepRecord)>,
    files: HashMap<u32, File>,
    scheduled: Vec<ScheduledRead>,
}

impl PosixReader {
    fn read_block(&mut self, owner: u32, pos: u64, out: &mut [i32]) -> Result<()> {
        let file = match self.files.entry(owner) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(File::open(data_path(&self.dir, owner))?)
            }
        };
        let mut bytes = vec![0u8; out.len() * ELEM as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut bytes)?;
        for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(ELEM as usize)) {
            *dst = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn perform_one(&mut self, read: &ScheduledRead) -> Result<Vec<i32>> {
        let sel = read.selection;
        let width = sel.count as usize;
        let mut out = vec![0i32; read.steps.len() * width];

        for (i, step) in read.steps.clone().enumerate() {
            // (owner, file position, destination start, element count)
            let blocks: Vec<(u32, u64, usize, usize)> = self
                .records
                .iter()
                .filter(|(_, rec)| rec.step == step)
                .flat_map(|(owner, rec)| rec.arrays.iter().map(move |a| (*owner, a)))
                .filter(|(_, a)| a.name == read.name)
                .filter_map(|(owner, a)| {
                    let lo = a.offset.max(sel.offset);
                    let hi = (a.offset + a.count).min(sel.end());
                    (lo < hi).then(|| {
                        (
                            owner,
                            a.pos + (lo - a.offset) * ELEM,
                            i * width + (lo - sel.offset) as usize,
                            (hi - lo) as usize,
                        )
                    })
                })
                .collect();

            let covered: usize = blocks.iter().map(|b| b.3).sum();
            if covered < width {
                return Err(BenchError::Transfer(format!(
                    "'{}' step {}: only {} of {} selected elements [{}, {}) are stored",
                    read.name,
                    step,
                    covered,
                    width,
                    sel.offset,
                    sel.end()
                )));
            }

            for (owner, pos, start, len) in blocks {
                self.read_block(owner, pos, &mut out[start..start + len])
                    .map_err(|e| {
                        BenchError::Transfer(format!("'{}' step {}: {}", read.name, step, e))
                    })?;
            }
        }
        Ok(out)
    }
}

impl ReadHandle for PosixReader {
    fn inquire(&self, name: &str) -> Result<VarInfo> {
        let mut info: Option<VarInfo> = None;
        for (_, rec) in &self.records {
            let value = match rec.scalars.get(name) {
                Some(v) => Some(*v),
                None if rec.arrays.iter().any(|a| a.name == name) => None,
                None => continue,
            };
            let entry = info.get_or_insert(VarInfo {
                value,
                step_count: 0,
            });
            entry.step_count = entry.step_count.max(rec.step + 1);
        }
        info.ok_or_else(|| BenchError::Transfer(format!("variable '{name}' not found")))
    }

    fn schedule_read(
        &mut self,
        name: &str,
        selection: Selection,
        steps: Range<u32>,
    ) -> Result<ReadId> {
        self.scheduled.push(ScheduledRead {
            name: name.to_string(),
            selection,
            steps,
        });
        Ok(ReadId(self.scheduled.len() - 1))
    }

    fn perform_reads(&mut self) -> Result<ReadBatch> {
        let scheduled = std::mem::take(&mut self.scheduled);
        let mut buffers = Vec::with_capacity(scheduled.len());
        for read in &scheduled {
            buffers.push(self.perform_one(read)?);
        }
        Ok(ReadBatch::new(buffers))
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
