//! Text report formatting.
//!
//! Rows are prefixed with `>>>` so they can be grepped out of mixed job
//! output:
//!
//! ```text
//! >>>  rank  step     total    (MiB/s) post-open    (MiB/s) post-xfer    (MiB/s)
//! >>>     0     0     0.012     83.102     0.011     90.113     0.010     99.720
//! >>>   ALL     0     0.013    306.998     0.012    330.101     0.011    361.456
//! ```

use std::io::Write;

use crate::error::Result;
use crate::partition::Partition;
use crate::synth::StepVerdict;
use crate::timing::Elapsed;

/// Label of the aggregate row.
pub const ALL_LABEL: &str = "ALL";

/// Write the run description printed once by the root rank.
pub fn write_info<W: Write>(
    w: &mut W,
    fields: &[(&str, String)],
    hosts: &[String],
) -> Result<()> {
    writeln!(w, "====== Info =======")?;
    for (name, value) in fields {
        writeln!(w, "{:>10}: {}", name, value)?;
    }
    for (rank, host) in hosts.iter().enumerate() {
        writeln!(w, "{:>10}: {:>5} {}", "MAP", rank, host)?;
    }
    writeln!(w, "===================")?;
    writeln!(w)?;
    Ok(())
}

/// Column header for timing rows. `with_step` adds the step column.
pub fn write_timing_header<W: Write>(w: &mut W, with_step: bool) -> Result<()> {
    write!(w, ">>> {:>5}", "rank")?;
    if with_step {
        write!(w, " {:>5}", "step")?;
    }
    writeln!(
        w,
        " {:>9} {:>12} {:>9} {:>12} {:>9} {:>12}",
        "total", "(MiB/s)", "post-open", "(MiB/s)", "post-xfer", "(MiB/s)"
    )?;
    Ok(())
}

/// One timing row: durations in seconds with the matching MiB/s figures.
///
/// The row goes out in a single write so rows of concurrent ranks sharing a
/// stream stay whole.
pub fn write_timing_row<W: Write>(
    w: &mut W,
    label: &str,
    step: Option<u32>,
    elapsed: &Elapsed,
    rates: [f64; 3],
) -> Result<()> {
    let secs = elapsed.as_secs();
    let mut line = format!(">>> {:>5}", label);
    if let Some(step) = step {
        line.push_str(&format!(" {:>5}", step));
    }
    line.push_str(&format!(
        " {:>9.3} {:>12.3} {:>9.3} {:>12.3} {:>9.3} {:>12.3}\n",
        secs[0], rates[0], secs[1], rates[1], secs[2], rates[2]
    ));
    w.write_all(line.as_bytes())?;
    Ok(())
}

/// Verification outcome for one step: a line per bad element, then the verdict.
///
/// Written in one call, like timing rows.
pub fn write_verdict<W: Write>(w: &mut W, rank: i32, verdict: &StepVerdict) -> Result<()> {
    let mut text = String::new();
    for m in &verdict.mismatches {
        text.push_str(&format!(
            "rank {} step {}: element {} (global {}) = {}, expected {}\n",
            rank, m.step, m.local_index, m.global_index, m.observed, m.expected
        ));
    }
    if verdict.passed() {
        text.push_str(&format!("rank {} step {}: PASS\n", rank, verdict.step));
    } else {
        text.push_str(&format!(
            "rank {} step {}: FAIL ({} mismatches)\n",
            rank,
            verdict.step,
            verdict.mismatches.len()
        ));
    }
    w.write_all(text.as_bytes())?;
    Ok(())
}

/// Table of the values a rank read back, one row per step.
pub fn write_rank_dump<W: Write>(
    w: &mut W,
    part: &Partition,
    steps: u32,
    data: &[i32],
) -> Result<()> {
    writeln!(
        w,
        "rank={} columns={} offset={} steps={}",
        part.rank, part.count, part.offset, steps
    )?;
    if part.is_empty() {
        writeln!(w, " time   columns (none)")?;
        return Ok(());
    }
    writeln!(w, " time   columns {}...{}", part.offset, part.end() - 1)?;

    write!(w, "             ")?;
    for col in part.offset..part.end() {
        write!(w, "{:>5}", col)?;
    }
    write!(w, "\n-------------")?;
    for _ in 0..part.count {
        write!(w, "-----")?;
    }
    writeln!(w)?;

    let width = part.count as usize;
    for (step, row) in data.chunks(width).take(steps as usize).enumerate() {
        write!(w, "{:>5}        ", step)?;
        for v in row {
            write!(w, "{:>5} ", v)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use crate::synth::Mismatch;

    fn render<F: FnOnce(&mut Vec<u8>) -> Result<()>>(f: F) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("write failed");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn info_lists_fields_and_hosts() {
        let hosts = vec!["n01".to_string(), "n02".to_string()];
        let out = render(|w| write_info(w, &[("NX", "8".to_string())], &hosts));
        assert!(out.starts_with("====== Info =======\n"));
        assert!(out.contains("        NX: 8\n"));
        assert!(out.contains("       MAP:     1 n02\n"));
    }

    #[test]
    fn rows_line_up_with_header() {
        let header = render(|w| write_timing_header(w, true));
        let elapsed = Elapsed::from_secs([1.0, 0.5, 0.25]);
        let row = render(|w| write_timing_row(w, ALL_LABEL, Some(3), &elapsed, [1.0, 2.0, 4.0]));
        assert_eq!(header.len(), row.len());
        assert!(row.starts_with(">>>   ALL     3     1.000        1.000     0.500"));
    }

    #[test]
    fn reader_rows_have_no_step_column() {
        let header = render(|w| write_timing_header(w, false));
        let row = render(|w| write_timing_row(w, "0", None, &Elapsed::default(), [0.0; 3]));
        assert_eq!(header.len(), row.len());
    }

    /// Records the size of every `write` call.
    #[derive(Default)]
    struct CallLog(Vec<usize>);

    impl Write for CallLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.push(buf.len());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rows_and_verdicts_are_single_writes() {
        let mut log = CallLog::default();
        write_timing_row(&mut log, "12", Some(4), &Elapsed::default(), [0.0; 3]).expect("row");
        let fail = StepVerdict {
            step: 0,
            mismatches: vec![
                Mismatch {
                    step: 0,
                    local_index: 0,
                    global_index: 0,
                    observed: 1,
                    expected: 0,
                };
                3
            ],
        };
        write_verdict(&mut log, 0, &fail).expect("verdict");
        assert_eq!(log.0.len(), 2);
    }

    #[test]
    fn verdict_lines() {
        let pass = StepVerdict { step: 2, mismatches: vec![] };
        assert_eq!(render(|w| write_verdict(w, 1, &pass)), "rank 1 step 2: PASS\n");

        let fail = StepVerdict {
            step: 0,
            mismatches: vec![Mismatch {
                step: 0,
                local_index: 1,
                global_index: 5,
                observed: 7,
                expected: 5,
            }],
        };
        let out = render(|w| write_verdict(w, 1, &fail));
        assert_eq!(
            out,
            "rank 1 step 0: element 1 (global 5) = 7, expected 5\n\
             rank 1 step 0: FAIL (1 mismatches)\n"
        );
    }

    #[test]
    fn dump_table() {
        let part = partition(4, 2, 1);
        let out = render(|w| write_rank_dump(w, &part, 2, &[2, 3, 6, 7]));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "rank=1 columns=2 offset=2 steps=2");
        assert_eq!(lines[1], " time   columns 2...3");
        assert_eq!(lines[2], "                 2    3");
        assert_eq!(lines[3], "-----------------------");
        assert_eq!(lines[4], "    0            2     3 ");
        assert_eq!(lines[5], "    1            6     7 ");
    }

    #[test]
    fn dump_of_empty_block() {
        let part = partition(1, 2, 0);
        let out = render(|w| write_rank_dump(w, &part, 1, &[]));
        assert!(out.contains("(none)"));
    }
}
