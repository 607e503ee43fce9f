//! MPI process group tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use stepbench::bench::{run_reader, run_writer};
use stepbench::comm::mpi::MpiComm;
use stepbench::comm::Communicator;
use stepbench::config::{ReaderConfig, WriterConfig};
use stepbench::storage;

#[test]
fn mpi_write_then_read_round_trip() {
    // MPI can be initialized once per process, so one test covers the
    // collectives and a full run.
    let _universe = mpi::initialize().expect("MPI init failed");
    let world = MpiComm::world();

    let names = world.gather_names(&world.processor_name());
    assert_eq!(names.is_some(), world.rank() == 0);
    assert!(world.all_agree(true));

    let sub = world.split(world.rank() % 2, world.rank()).expect("split");
    assert!(sub.size() >= 1);

    // Same name on every rank; multi-node runs need a shared TMPDIR.
    let target = std::env::temp_dir().join("stepbench-mpi-test.bp");
    let target = target.to_str().expect("utf8").to_string();

    let mut cfg = WriterConfig::new(target.clone());
    cfg.len_per_rank = 16;
    cfg.steps = 2;
    cfg.fsync = false;
    let mut engine = storage::select("POSIX", "").expect("engine");
    run_writer(&cfg, &world, engine.as_mut(), &mut std::io::sink()).expect("write failed");

    let rcfg = ReaderConfig::new(target.clone());
    let summary = run_reader(&rcfg, &world, engine.as_ref(), &mut std::io::sink())
        .expect("read failed");
    assert_eq!(summary.step_count, 2);
    assert_eq!(summary.failed_steps(), 0);

    world.barrier();
    if world.rank() == 0 {
        let _ = std::fs::remove_dir_all(&target);
    }
}
