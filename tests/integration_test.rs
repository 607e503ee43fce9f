//! End-to-end writer/reader runs over in-process rank groups.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use stepbench::bench::{run_reader, run_writer, ReadSummary, WriteSummary};
use stepbench::comm::{spawn_ranks, SingleProcessComm};
use stepbench::config::{ReaderConfig, WriterConfig};
use stepbench::error::BenchError;
use stepbench::hierarchy::Grouping;
use stepbench::storage::{self, Selection, PAYLOAD};
use stepbench::synth::value_at;

/// Write with `ranks` threads; returns each rank's summary and report text.
fn write(cfg: &WriterConfig, ranks: usize) -> Vec<(WriteSummary, String)> {
    spawn_ranks(ranks, |comm| {
        let mut engine = storage::select(&cfg.method, &cfg.params).expect("engine");
        let mut out = Vec::new();
        let summary = run_writer(cfg, &comm, engine.as_mut(), &mut out).expect("write failed");
        (summary, String::from_utf8(out).expect("utf8"))
    })
}

fn read(cfg: &ReaderConfig, ranks: usize) -> Vec<(Result<ReadSummary, BenchError>, String)> {
    spawn_ranks(ranks, |comm| {
        let engine = storage::select(&cfg.method, &cfg.params).expect("engine");
        let mut out = Vec::new();
        let result = run_reader(cfg, &comm, engine.as_ref(), &mut out);
        (result, String::from_utf8(out).expect("utf8"))
    })
}

fn writer_config(target: &str, len: u64, steps: u32) -> WriterConfig {
    let mut cfg = WriterConfig::new(target);
    cfg.len_per_rank = len;
    cfg.steps = steps;
    cfg.fsync = false;
    cfg
}

#[test]
fn three_steps_two_ranks_verify() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("out.bp");
    let target = target.to_str().expect("utf8");

    let written = write(&writer_config(target, 4, 3), 2);
    assert!(written.iter().all(|(s, _)| s.target == target && s.steps.len() == 3));

    let root_text = &written[0].1;
    assert_eq!(root_text.matches("MAP").count(), 2);
    assert_eq!(root_text.lines().filter(|l| l.starts_with(">>>   ALL")).count(), 3);
    assert!(!written[1].1.contains("====== Info"));
    assert_eq!(written[1].1.lines().filter(|l| l.starts_with(">>>     1")).count(), 3);

    let results = read(&ReaderConfig::new(target), 2);
    for (rank, (result, text)) in results.iter().enumerate() {
        let summary = result.as_ref().expect("read failed");
        assert_eq!(summary.global_len, 8);
        assert_eq!(summary.step_count, 3);
        assert_eq!(summary.partition.count, 4);
        assert_eq!(summary.failed_steps(), 0);
        for step in 0..3 {
            assert!(text.contains(&format!("rank {rank} step {step}: PASS")), "{text}");
        }
    }
    let root = results[0].0.as_ref().expect("root");
    assert_eq!(root.metrics.total_bytes, 4 * 3 * 8);
    assert_eq!(root.metrics.local_bytes, 4 * 3 * 4);
}

#[test]
fn reader_rank_count_may_differ_from_writer() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("out.bp");
    let target = target.to_str().expect("utf8");

    write(&writer_config(target, 4, 2), 2);
    let results = read(&ReaderConfig::new(target), 3);

    let counts: Vec<u64> = results
        .iter()
        .map(|(r, _)| r.as_ref().expect("read failed").partition.count)
        .collect();
    assert_eq!(counts, vec![2, 2, 4]);
    assert!(results
        .iter()
        .all(|(r, _)| r.as_ref().map(|s| s.failed_steps() == 0).unwrap_or(false)));
}

#[test]
fn group_file_splits_into_two_targets() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let groups = tmp.path().join("groups.txt");
    fs::write(&groups, "0 0\n0 1\n1 0\n1 1\n").expect("group file");
    let target = tmp.path().join("out.bp");

    let mut cfg = writer_config(target.to_str().expect("utf8"), 4, 1);
    cfg.grouping = Grouping::Assigned(groups);
    let written = write(&cfg, 4);

    let targets: Vec<&str> = written.iter().map(|(s, _)| s.target.as_str()).collect();
    assert_eq!(targets[0], targets[1]);
    assert_eq!(targets[2], targets[3]);
    assert_ne!(targets[0], targets[2]);
    assert!(targets[0].ends_with("out.0.bp"));
    assert!(targets[2].ends_with("out.1.bp"));

    // Each sub-target holds the blocks of its own two ranks only.
    let engine = storage::select("POSIX", "").expect("engine");
    for (target, offset) in [(targets[0], 0u64), (targets[2], 8)] {
        let mut r = engine.open_read(target, &SingleProcessComm, None).expect("open");
        let id = r
            .schedule_read(PAYLOAD, Selection { offset, count: 8 }, 0..1)
            .expect("schedule");
        let data = r.perform_reads().expect("perform").take(id).expect("take");
        let expected: Vec<i32> = (offset..offset + 8).map(|i| value_at(16, 0, i)).collect();
        assert_eq!(data, expected);

        let mut outside = engine.open_read(target, &SingleProcessComm, None).expect("open");
        outside
            .schedule_read(PAYLOAD, Selection { offset: 0, count: 16 }, 0..1)
            .expect("schedule");
        assert!(outside.perform_reads().is_err());
    }
}

#[test]
fn bad_group_file_fails_every_rank_before_writing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let groups = tmp.path().join("groups.txt");
    fs::write(&groups, "0 0\n0 1\n1 0\n").expect("group file");
    let target = tmp.path().join("out.bp");

    let mut cfg = writer_config(target.to_str().expect("utf8"), 4, 1);
    cfg.grouping = Grouping::Assigned(groups);
    let results = spawn_ranks(4, |comm| {
        let mut engine = storage::select("POSIX", "").expect("engine");
        run_writer(&cfg, &comm, engine.as_mut(), &mut std::io::sink()).map(|_| ())
    });
    assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_config())));
    assert!(!target.exists());
}

#[test]
fn corrupted_element_fails_only_its_step() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("out.bp");
    let target_str = target.to_str().expect("utf8");
    write(&writer_config(target_str, 4, 2), 2);

    // Element 2 of rank 0's block in step 1.
    let mut data = fs::OpenOptions::new()
        .write(true)
        .open(target.join("data.0"))
        .expect("data file");
    data.seek(SeekFrom::Start(4 * (4 + 2))).expect("seek");
    data.write_all(&(-1i32).to_le_bytes()).expect("corrupt");
    drop(data);

    let relaxed = read(&ReaderConfig::new(target_str), 2);
    let (result, text) = &relaxed[0];
    let summary = result.as_ref().expect("relaxed read succeeds");
    assert_eq!(summary.failed_steps(), 1);
    assert!(summary.verdicts[0].passed());
    let m = &summary.verdicts[1].mismatches;
    assert_eq!(m.len(), 1);
    assert_eq!((m[0].local_index, m[0].observed, m[0].expected), (2, -1, value_at(8, 1, 2)));
    assert!(text.contains("rank 0 step 0: PASS"));
    assert!(text.contains("rank 0 step 1: FAIL (1 mismatches)"));

    let mut strict = ReaderConfig::new(target_str);
    strict.strict = true;
    let results = read(&strict, 2);
    assert!(matches!(results[0].0, Err(BenchError::Verification { failed_steps: 1 })));
    assert!(results[1].0.is_ok());
}

#[test]
fn reader_dump_files() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("out.bp");
    let target = target.to_str().expect("utf8");
    let dump = tmp.path().join("dump");
    fs::create_dir(&dump).expect("dump dir");

    write(&writer_config(target, 3, 2), 2);
    let mut cfg = ReaderConfig::new(target);
    cfg.dump_dir = Some(dump.clone());
    let results = read(&cfg, 2);
    assert!(results.iter().all(|(r, _)| r.is_ok()));

    let rank1 = fs::read_to_string(dump.join("reader.1.txt")).expect("dump");
    assert!(rank1.starts_with("rank=1 columns=3 offset=3 steps=2"));
    // Step 1 of gnx=6: values 9..11 at columns 3..5.
    assert!(rank1.lines().any(|l| l.split_whitespace().eq(["1", "9", "10", "11"])));
}

#[test]
fn streaming_open_times_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("never.bp");
    let mut cfg = ReaderConfig::new(target.to_str().expect("utf8"));
    cfg.open_timeout = Some(std::time::Duration::from_millis(200));

    let start = std::time::Instant::now();
    let results = read(&cfg, 2);
    assert!(start.elapsed() >= std::time::Duration::from_millis(200));
    assert!(results.iter().all(|(r, _)| matches!(r, Err(BenchError::Open(_)))));
}

#[test]
fn aggregate_rate_uses_slowest_rank() {
    let mut cfg = writer_config("unused", 256, 2);
    cfg.method = "NULL".to_string();
    let written = write(&cfg, 2);

    let (root, _) = &written[0];
    for m in &root.steps {
        let slowest = m.slowest.expect("root has aggregate");
        assert!(slowest.total >= m.local.total);
        assert_eq!(m.total_bytes, 4 * 512);
        let secs = slowest.total.as_secs_f64();
        if secs > 0.0 {
            let rates = m.aggregate_rates().expect("rates");
            let expected = (4 * 512) as f64 / secs / (1024.0 * 1024.0);
            assert_abs_diff_eq!(rates[0], expected, epsilon = expected * 1e-9);
        }
    }
    assert!(written[1].0.steps.iter().all(|m| m.slowest.is_none()));
}

/// Stream shared by every rank, locked once per `write` call like `Stdout`.
#[derive(Clone, Default)]
struct SharedStream(Arc<Mutex<Vec<u8>>>);

impl Write for SharedStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("lock").extend_from_slice(buf);
        std::thread::yield_now();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// `label step` followed by three (seconds, MiB/s) pairs.
fn parse_row(line: &str) -> Option<(String, u32)> {
    let mut fields = line.strip_prefix(">>>")?.split_whitespace();
    let label = fields.next()?.to_string();
    let step = fields.next()?.parse().ok()?;
    let numbers: Vec<f64> = fields.map(|f| f.parse().ok()).collect::<Option<_>>()?;
    (numbers.len() == 6).then_some((label, step))
}

#[test]
fn concurrent_rank_rows_stay_whole() {
    let stream = SharedStream::default();
    let mut cfg = writer_config("unused", 64, 20);
    cfg.method = "NULL".to_string();

    spawn_ranks(6, |comm| {
        let mut engine = storage::select(&cfg.method, &cfg.params).expect("engine");
        let mut out = stream.clone();
        run_writer(&cfg, &comm, engine.as_mut(), &mut out).expect("write failed");
    });

    let bytes = stream.0.lock().expect("lock").clone();
    let text = String::from_utf8(bytes).expect("utf8");
    let mut rows = Vec::new();
    for line in text.lines().filter(|l| l.starts_with(">>>") && !l.contains("rank")) {
        rows.push(parse_row(line).unwrap_or_else(|| panic!("garbled row: {line:?}")));
    }
    assert_eq!(rows.len(), 7 * 20);
    for step in 0..20 {
        for label in ["0", "1", "2", "3", "4", "5", "ALL"] {
            assert_eq!(
                rows.iter().filter(|(l, s)| l == label && *s == step).count(),
                1,
                "{label} step {step}"
            );
        }
    }
    assert!(text.lines().all(|l| !l.contains(">>>") || l.starts_with(">>>")));
}
