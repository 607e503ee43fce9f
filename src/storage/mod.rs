//! Storage backend interface.
//!
//! The benchmark talks to storage through `StorageEngine`: declare a schema
//! once, then open a target per step (writer) or once (reader). Methods are
//! selected by name at run time:
//!
//! - `POSIX`: a directory of per-rank data and index files
//! - `NULL`: accepts and discards writes

pub mod null;
pub mod posix;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::comm::Communicator;
use crate::error::{BenchError, Result};

pub use null::NullEngine;
pub use posix::PosixEngine;

/// Scalar: global array length.
pub const GLOBAL_LEN: &str = "gnx";
/// Scalar: offset of this rank's block.
pub const OFFSET: &str = "offs";
/// Scalar: length of this rank's block.
pub const LOCAL_COUNT: &str = "nx";
/// Array: the synthetic payload.
pub const PAYLOAD: &str = "x";

/// How a write target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start the target from scratch.
    Create,
    /// Add a step after the ones already stored.
    Append,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Create => write!(f, "create"),
            OpenMode::Append => write!(f, "append"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    /// An `i32` block sized by `count`, placed at `offset` in a `global`
    /// sized array. Each names a scalar written in the same step.
    Array {
        count: String,
        global: String,
        offset: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
}

/// The set of variables a writer may put in each step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub fields: Vec<FieldDecl>,
}

impl Schema {
    /// Global length, offset, local count and the payload array.
    pub fn benchmark() -> Self {
        let scalar = |name: &str| FieldDecl {
            name: name.to_string(),
            kind: FieldKind::Scalar,
        };
        Self {
            fields: vec![
                scalar(GLOBAL_LEN),
                scalar(OFFSET),
                scalar(LOCAL_COUNT),
                FieldDecl {
                    name: PAYLOAD.to_string(),
                    kind: FieldKind::Array {
                        count: LOCAL_COUNT.to_string(),
                        global: GLOBAL_LEN.to_string(),
                        offset: OFFSET.to_string(),
                    },
                },
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.kind)
    }
}

/// Contiguous range of the (one-dimensional) global array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub offset: u64,
    pub count: u64,
}

impl Selection {
    pub fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// Where a written block sits in the global array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub global: u64,
    pub offset: u64,
    pub count: u64,
}

/// Result of inquiring a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    /// First-step value for scalars, `None` for arrays.
    pub value: Option<u64>,
    pub step_count: u32,
}

/// Handle to one scheduled read inside a `ReadBatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadId(pub(crate) usize);

/// Buffers filled by `ReadHandle::perform_reads`, laid out `[step][element]`.
#[derive(Debug, Default)]
pub struct ReadBatch {
    buffers: Vec<Option<Vec<i32>>>,
}

impl ReadBatch {
    pub(crate) fn new(buffers: Vec<Vec<i32>>) -> Self {
        Self {
            buffers: buffers.into_iter().map(Some).collect(),
        }
    }

    /// Take the buffer of a scheduled read.
    pub fn take(&mut self, id: ReadId) -> Result<Vec<i32>> {
        self.buffers
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| BenchError::Transfer(format!("no buffer for read #{}", id.0)))
    }
}

/// A target opened for writing one step.
pub trait WriteHandle {
    fn put_scalar(&mut self, name: &str, value: u64) -> Result<()>;

    /// Hand an array block to the backend. Its dimensions must have been
    /// put earlier in the same step.
    fn put_array(&mut self, name: &str, data: &[i32]) -> Result<()>;

    /// Finish the step; `sync` forces data to stable storage first.
    fn close(self: Box<Self>, sync: bool) -> Result<()>;
}

/// A target opened for reading.
pub trait ReadHandle {
    fn inquire(&self, name: &str) -> Result<VarInfo>;

    /// Queue a read of `selection` of `name` for `steps`.
    fn schedule_read(
        &mut self,
        name: &str,
        selection: Selection,
        steps: Range<u32>,
    ) -> Result<ReadId>;

    /// Execute every queued read.
    fn perform_reads(&mut self) -> Result<ReadBatch>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// A transfer method.
pub trait StorageEngine {
    /// Method name as given on the command line.
    fn method(&self) -> &'static str;

    /// Declare the variables written each step. Must precede `open_write`.
    fn declare(&mut self, schema: Schema) -> Result<()>;

    /// Open `target` for one step. Collective over `comm`.
    fn open_write(
        &self,
        target: &str,
        mode: OpenMode,
        comm: &dyn Communicator,
    ) -> Result<Box<dyn WriteHandle>>;

    /// Open `target` for reading, waiting up to `timeout` for it to appear.
    fn open_read(
        &self,
        target: &str,
        comm: &dyn Communicator,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn ReadHandle>>;
}

/// Resolve a method name (case-insensitive) to an engine.
pub fn select(method: &str, params: &str) -> Result<Box<dyn StorageEngine>> {
    let params = parse_params(params);
    match method.to_ascii_uppercase().as_str() {
        "POSIX" => Ok(Box::new(PosixEngine::new(&params)?)),
        "NULL" => Ok(Box::new(NullEngine::new(&params))),
        other => Err(BenchError::Config(format!(
            "unknown transfer method '{other}' (expected POSIX or NULL)"
        ))),
    }
}

/// Split a backend parameter string into `key=value` pairs.
///
/// Pairs are separated by `,` or `;`; a bare key gets an empty value.
pub fn parse_params(params: &str) -> Vec<(String, String)> {
    params
        .split([',', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim().to_string()),
            None => (p.to_ascii_lowercase(), String::new()),
        })
        .collect()
}

/// Validates one step's puts against the declared schema.
#[derive(Debug)]
pub(crate) struct StepWrites {
    schema: Arc<Schema>,
    scalars: BTreeMap<String, u64>,
}

impl StepWrites {
    pub(crate) fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            scalars: BTreeMap::new(),
        }
    }

    pub(crate) fn put_scalar(&mut self, name: &str, value: u64) -> Result<()> {
        match self.schema.field(name) {
            Some(FieldKind::Scalar) => {
                self.scalars.insert(name.to_string(), value);
                Ok(())
            }
            Some(FieldKind::Array { .. }) => Err(BenchError::Transfer(format!(
                "'{name}' is an array, not a scalar"
            ))),
            None => Err(BenchError::Transfer(format!("undeclared variable '{name}'"))),
        }
    }

    /// Resolve the block's placement and check its length.
    pub(crate) fn put_array(&self, name: &str, len: usize) -> Result<Placement> {
        let Some(FieldKind::Array {
            count,
            global,
            offset,
        }) = self.schema.field(name)
        else {
            return Err(BenchError::Transfer(format!(
                "'{name}' is not a declared array"
            )));
        };

        let dim = |dim: &str| {
            self.scalars.get(dim).copied().ok_or_else(|| {
                BenchError::Transfer(format!(
                    "dimension '{dim}' of '{name}' must be written before it"
                ))
            })
        };
        let placement = Placement {
            global: dim(global)?,
            offset: dim(offset)?,
            count: dim(count)?,
        };

        if placement.count != len as u64 {
            return Err(BenchError::Transfer(format!(
                "'{name}' block has {len} elements but '{count}' is {}",
                placement.count
            )));
        }
        if placement.offset + placement.count > placement.global {
            return Err(BenchError::Transfer(format!(
                "'{name}' block [{}, {}) exceeds global length {}",
                placement.offset,
                placement.offset + placement.count,
                placement.global
            )));
        }
        Ok(placement)
    }

    pub(crate) fn scalars(&self) -> &BTreeMap<String, u64> {
        &self.scalars
    }
}

pub(crate) fn require_schema(schema: &Option<Arc<Schema>>) -> Result<Arc<Schema>> {
    schema
        .clone()
        .ok_or_else(|| BenchError::Config("no schema declared before open".into()))
}
