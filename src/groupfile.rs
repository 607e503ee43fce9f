//! Group-assignment file parser.
//!
//! One line per global rank, in rank order:
//!
//! ```text
//! # comment line
//! color [key]
//! ```
//!
//! `color` selects the sub-group, `key` orders ranks inside it. When the key
//! column is absent on every line, each rank's own id is used as its key.

use std::collections::HashSet;
use std::path::Path;

use nom::character::complete::{i32 as int32, space0, space1};
use nom::combinator::{eof, opt};
use nom::sequence::preceded;
use nom::IResult;
use nom::Parser;

use crate::error::{BenchError, Result};

/// Color and ordering key for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEntry {
    pub color: i32,
    pub key: i32,
}

/// Sub-group membership for every rank of the world group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    entries: Vec<GroupEntry>,
    explicit_keys: bool,
}

impl GroupAssignment {
    /// Read and validate a group file against the world size.
    pub fn load(path: &Path, world_size: usize) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("cannot read group file {}: {}", path.display(), e))
        })?;
        Self::parse(&input, world_size)
    }

    /// Parse and validate group file contents against the world size.
    pub fn parse(input: &str, world_size: usize) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_num, raw_line) in input.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (_, (color, key)) = entry_line(line).map_err(|_| {
                BenchError::Config(format!(
                    "group file line {}: expected 'color [key]', got: {}",
                    line_num + 1,
                    raw_line
                ))
            })?;
            if color < 0 {
                return Err(BenchError::Config(format!(
                    "group file line {}: color {} out of range (must be >= 0)",
                    line_num + 1,
                    color
                )));
            }
            rows.push((line_num + 1, color, key));
        }

        if rows.len() != world_size {
            return Err(BenchError::Config(format!(
                "group file has {} entries but the run has {} ranks",
                rows.len(),
                world_size
            )));
        }

        let keyed = rows.iter().filter(|(_, _, key)| key.is_some()).count();
        if keyed != 0 && keyed != rows.len() {
            return Err(BenchError::Config(
                "group file mixes lines with and without a key column".into(),
            ));
        }
        let explicit_keys = keyed != 0;

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(rows.len());
        for (rank, (line, color, key)) in rows.into_iter().enumerate() {
            let key = key.unwrap_or(rank as i32);
            if !seen.insert((color, key)) {
                return Err(BenchError::Config(format!(
                    "group file line {line}: key {key} used twice in color {color}"
                )));
            }
            entries.push(GroupEntry { color, key });
        }

        Ok(Self {
            entries,
            explicit_keys,
        })
    }

    /// The entry for a world rank.
    pub fn entry(&self, rank: usize) -> GroupEntry {
        self.entries[rank]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// False when keys were filled in from rank ids.
    pub fn has_explicit_keys(&self) -> bool {
        self.explicit_keys
    }

    /// Number of distinct colors.
    pub fn group_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.color)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Parse `color [key]` with nothing trailing.
fn entry_line(input: &str) -> IResult<&str, (i32, Option<i32>)> {
    let (rest, (color, key, _, _)) =
        (int32, opt(preceded(space1, int32)), space0, eof).parse(input)?;
    Ok((rest, (color, key)))
}
