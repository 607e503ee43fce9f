//! Run configuration handed from the command line to the benchmark.

use std::path::PathBuf;
use std::time::Duration;

use crate::hierarchy::Grouping;
use crate::storage::OpenMode;

/// Elements per rank when `--len` is not given.
pub const DEFAULT_LEN_PER_RANK: u64 = 1024 * 1024;

/// Which mode each writer step opens its target in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenPolicy {
    /// Create on the first step, append afterwards.
    #[default]
    AppendAfterFirst,
    /// Create (and so truncate) on every step.
    CreateEveryStep,
}

impl OpenPolicy {
    pub fn mode_for(self, step: u32) -> OpenMode {
        match self {
            OpenPolicy::AppendAfterFirst if step > 0 => OpenMode::Append,
            _ => OpenMode::Create,
        }
    }
}

pub struct WriterConfig {
    /// Base target name; sub-group tokens are inserted into it.
    pub output: String,
    pub len_per_rank: u64,
    pub steps: u32,
    pub method: String,
    pub params: String,
    pub open_policy: OpenPolicy,
    /// Sync to stable storage before each step's timing stops.
    pub fsync: bool,
    /// Pause between steps, outside every timed interval.
    pub sleep: Duration,
    pub grouping: Grouping,
}

impl WriterConfig {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            len_per_rank: DEFAULT_LEN_PER_RANK,
            steps: 1,
            method: "POSIX".to_string(),
            params: String::new(),
            open_policy: OpenPolicy::default(),
            fsync: true,
            sleep: Duration::ZERO,
            grouping: Grouping::Flat,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub input: String,
    pub method: String,
    pub params: String,
    /// Wait up to this long for the target to appear.
    pub open_timeout: Option<Duration>,
    /// Write `reader.<rank>.txt` into this directory.
    pub dump_dir: Option<PathBuf>,
    /// Fail the run when any step does not verify.
    pub strict: bool,
}

impl ReaderConfig {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            method: "POSIX".to_string(),
            params: String::new(),
            open_timeout: None,
            dump_dir: None,
            strict: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_creates_then_appends() {
        let p = OpenPolicy::AppendAfterFirst;
        assert_eq!(p.mode_for(0), OpenMode::Create);
        assert_eq!(p.mode_for(1), OpenMode::Append);
        assert_eq!(p.mode_for(7), OpenMode::Append);
    }

    #[test]
    fn create_every_step_never_appends() {
        let p = OpenPolicy::CreateEveryStep;
        assert!((0..4).all(|s| p.mode_for(s) == OpenMode::Create));
    }
}
