//! `NULL` method: puts are validated against the schema, then dropped.
//!
//! Useful to time the benchmark's own overhead.

use std::sync::Arc;
use std::time::Duration;

use super::{require_schema, OpenMode, ReadHandle, Schema, StepWrites, StorageEngine, WriteHandle};
use crate::comm::Communicator;
use crate::error::{BenchError, Result};

#[derive(Default)]
pub struct NullEngine {
    schema: Option<Arc<Schema>>,
}

impl NullEngine {
    pub fn new(params: &[(String, String)]) -> Self {
        for (key, _) in params {
            tracing::warn!(param = %key, "NULL method takes no parameters; ignoring");
        }
        Self::default()
    }
}

impl StorageEngine for NullEngine {
    fn method(&self) -> &'static str {
        "NULL"
    }

    fn declare(&mut self, schema: Schema) -> Result<()> {
        self.schema = Some(Arc::new(schema));
        Ok(())
    }

    fn open_write(
        &self,
        _target: &str,
        _mode: OpenMode,
        _comm: &dyn Communicator,
    ) -> Result<Box<dyn WriteHandle>> {
        Ok(Box::new(NullWriter {
            writes: StepWrites::new(require_schema(&self.schema)?),
        }))
    }

    fn open_read(
        &self,
        target: &str,
        _comm: &dyn Communicator,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn ReadHandle>> {
        Err(BenchError::Open(format!(
            "{target}: the NULL method stores nothing to read"
        )))
    }
}

struct NullWriter {
    writes: StepWrites,
}

impl WriteHandle for NullWriter {
    fn put_scalar(&mut self, name: &str, value: u64) -> Result<()> {
        self.writes.put_scalar(name, value)
    }

    fn put_array(&mut self, name: &str, data: &[i32]) -> Result<()> {
        self.writes.put_array(name, data.len()).map(|_| ())
    }

    fn close(self: Box<Self>, _sync: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcessComm;
    use crate::storage::{GLOBAL_LEN, LOCAL_COUNT, OFFSET, PAYLOAD};

    #[test]
    fn writes_are_checked_then_dropped() {
        let mut e = NullEngine::new(&[]);
        e.declare(Schema::benchmark()).expect("declare");
        let mut h = e
            .open_write("ignored", OpenMode::Create, &SingleProcessComm)
            .expect("open");
        h.put_scalar(GLOBAL_LEN, 2).expect("gnx");
        h.put_scalar(OFFSET, 0).expect("offs");
        h.put_scalar(LOCAL_COUNT, 2).expect("nx");
        assert!(h.put_array(PAYLOAD, &[1]).is_err());
        h.put_array(PAYLOAD, &[1, 2]).expect("x");
        h.close(true).expect("close");
    }

    #[test]
    fn reading_is_an_open_error() {
        let e = NullEngine::new(&[]);
        let err = e
            .open_read("anything", &SingleProcessComm, None)
            .err()
            .expect("should fail");
        assert!(matches!(err, BenchError::Open(_)));
    }
}
