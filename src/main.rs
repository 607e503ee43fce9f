use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use stepbench::bench;
use stepbench::comm::Communicator;
use stepbench::config::{OpenPolicy, ReaderConfig, WriterConfig, DEFAULT_LEN_PER_RANK};
use stepbench::error::{BenchError, Result};
use stepbench::hierarchy::{Grouping, MeshCoordinateTopology, MAX_TREE_LEVEL};
use stepbench::storage;

/// Parallel step-wise write/read throughput benchmark
#[derive(Parser)]
#[command(name = "stepbench", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write synthetic steps and time each one
    Write(WriteArgs),
    /// Read every step back in one request, time it and verify the data
    Read(ReadArgs),
}

#[derive(Args)]
struct ProcessArgs {
    /// Ranks to run as threads of this process
    #[arg(long, default_value_t = 1)]
    local_ranks: usize,
}

#[derive(Args)]
struct WriteArgs {
    /// Output target name
    output: String,

    /// Elements per rank
    #[arg(long, default_value_t = DEFAULT_LEN_PER_RANK)]
    len: u64,

    /// Number of steps
    #[arg(long, default_value_t = 1)]
    nsteps: u32,

    /// Transfer method (POSIX or NULL)
    #[arg(long, default_value = "POSIX")]
    method: String,

    /// Method parameters, key=value pairs
    #[arg(long, default_value = "")]
    params: String,

    /// Create the target on every step instead of appending after the first
    #[arg(long)]
    create_every_step: bool,

    /// Do not sync to stable storage before timing stops
    #[arg(long)]
    skip_fsync: bool,

    /// Seconds to sleep between steps
    #[arg(long, default_value_t = 0.0)]
    sleep: f64,

    /// Split by mesh coordinates down to this level (0-5, 0 = flat)
    #[arg(
        long,
        value_parser = clap::value_parser!(u8).range(0..=MAX_TREE_LEVEL as i64),
        conflicts_with = "group_file"
    )]
    tree_level: Option<u8>,

    /// Group file with one "color [key]" line per rank
    #[arg(long)]
    group_file: Option<PathBuf>,

    #[command(flatten)]
    process: ProcessArgs,
}

#[derive(Args)]
struct ReadArgs {
    /// Input target name
    input: String,

    /// Transfer method
    #[arg(long, default_value = "POSIX")]
    method: String,

    /// Method parameters, key=value pairs
    #[arg(long, default_value = "")]
    params: String,

    /// Seconds to wait for the target to appear
    #[arg(long)]
    timeout: Option<f64>,

    /// Directory to write reader.<rank>.txt into
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Exit with an error when any step fails verification
    #[arg(long)]
    strict: bool,

    #[command(flatten)]
    process: ProcessArgs,
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| BenchError::Config(format!("--{flag} {secs}: {e}")))
}

fn writer_config(args: &WriteArgs) -> Result<WriterConfig> {
    let grouping = match (args.tree_level, &args.group_file) {
        (Some(depth), _) if depth > 0 => Grouping::Tree {
            depth,
            topology: Box::new(MeshCoordinateTopology::from_env()),
        },
        (_, Some(path)) => Grouping::Assigned(path.clone()),
        _ => Grouping::Flat,
    };
    let mut cfg = WriterConfig::new(args.output.clone());
    cfg.len_per_rank = args.len;
    cfg.steps = args.nsteps;
    cfg.method = args.method.clone();
    cfg.params = args.params.clone();
    cfg.open_policy = if args.create_every_step {
        OpenPolicy::CreateEveryStep
    } else {
        OpenPolicy::AppendAfterFirst
    };
    cfg.fsync = !args.skip_fsync;
    cfg.sleep = seconds("sleep", args.sleep)?;
    cfg.grouping = grouping;
    Ok(cfg)
}

fn reader_config(args: &ReadArgs) -> Result<ReaderConfig> {
    let mut cfg = ReaderConfig::new(args.input.clone());
    cfg.method = args.method.clone();
    cfg.params = args.params.clone();
    cfg.open_timeout = args.timeout.map(|t| seconds("timeout", t)).transpose()?;
    cfg.dump_dir = args.dump.clone();
    cfg.strict = args.strict;
    Ok(cfg)
}

fn write_rank(cfg: &WriterConfig, world: &dyn Communicator) -> Result<()> {
    let mut engine = storage::select(&cfg.method, &cfg.params)?;
    bench::run_writer(cfg, world, engine.as_mut(), &mut io::stdout())?;
    Ok(())
}

fn read_rank(cfg: &ReaderConfig, world: &dyn Communicator) -> Result<()> {
    let engine = storage::select(&cfg.method, &cfg.params)?;
    bench::run_reader(cfg, world, engine.as_ref(), &mut io::stdout())?;
    Ok(())
}

#[cfg(feature = "distributed")]
fn run_ranks<F>(process: &ProcessArgs, f: F) -> Vec<Result<()>>
where
    F: Fn(&dyn Communicator) -> Result<()> + Sync,
{
    if process.local_ranks != 1 {
        return vec![Err(BenchError::Config(
            "--local-ranks is not available in an MPI build; use the MPI launcher".into(),
        ))];
    }
    let Some(_universe) = mpi::initialize() else {
        return vec![Err(BenchError::Config("MPI is already initialized".into()))];
    };
    let world = stepbench::comm::mpi::MpiComm::world();
    vec![f(&world)]
}

#[cfg(not(feature = "distributed"))]
fn run_ranks<F>(process: &ProcessArgs, f: F) -> Vec<Result<()>>
where
    F: Fn(&dyn Communicator) -> Result<()> + Sync,
{
    match process.local_ranks {
        0 => vec![Err(BenchError::Config("--local-ranks must be at least 1".into()))],
        1 => vec![f(&stepbench::comm::SingleProcessComm)],
        n => stepbench::comm::spawn_ranks(n, |comm| f(&comm)),
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let results = match &cli.command {
        Command::Write(args) => {
            let cfg = writer_config(args).unwrap_or_else(|e| {
                eprintln!("{}", e);
                eprintln!("See 'stepbench write --help'.");
                std::process::exit(1);
            });
            run_ranks(&args.process, |world| write_rank(&cfg, world))
        }
        Command::Read(args) => {
            let cfg = reader_config(args).unwrap_or_else(|e| {
                eprintln!("{}", e);
                eprintln!("See 'stepbench read --help'.");
                std::process::exit(1);
            });
            run_ranks(&args.process, |world| read_rank(&cfg, world))
        }
    };

    let mut failed = false;
    for (rank, result) in results.iter().enumerate() {
        if let Err(e) = result {
            if results.len() > 1 {
                eprintln!("Rank {}: {}", rank, e);
            } else {
                eprintln!("Error: {}", e);
            }
            if e.is_config() {
                eprintln!("See 'stepbench --help'.");
            }
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}
