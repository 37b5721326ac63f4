// `sprofile` -- Report the resource use of a Slurm job
//
// Run `sprofile start` from the job prolog (or at the top of the batch script) and `sprofile stop`
// from the epilog (or at the bottom).  Both must run on every node of the job; only local rank 0 on
// each node does anything, so it's fine to run them under srun with one task per core.
//
// `start` snapshots the counters into $CACHEDIR (default ~/.cache).  `stop` prints a report like
// this one for each node:
//
//   -- sprofile report (c7-3) --
//     Time:       1:02:03  /  1 day, 0:00:00
//     CPU load:      30.2  /  32.0
//     RAM peak:       41G  /  120G
//     GPU load:       3.6  /   4.0
//     GPU peak mem:   71G  /   80G
//     GPU energy:     2.1kWh
//
// GPU lines are there only if the node has NVIDIA GPUs.  GPU load is computed from the driver's
// per-process accounting records and will read as zero unless accounting mode is on
// (`nvidia-smi -am 1`).
//
// Quirks
//
// The report lock is per job, in the cache directory.  If the cache directory is node-local then
// reports from different nodes are not kept apart; they only go to different files if the job's
// stdout does.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobstats::{Config, Engine, JobContext, ReportLock, DEFAULT_CGROUP_ROOT};
use log::debug;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot the counters at the start of the job
    Start(StartArgs),

    /// Print the resource usage of the job on this node
    Stop(StopArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    common_args: CommonArgs,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    common_args: CommonArgs,

    /// Seconds to wait for other nodes to finish printing their reports
    #[arg(long, default_value_t = 10)]
    lock_timeout: u64,

    /// Leave the snapshot in the cache directory after printing the report
    #[arg(long, default_value_t = false)]
    keep_snapshot: bool,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Directory for snapshots and lock files [default: $CACHEDIR, or $HOME/.cache]
    #[arg(long)]
    cache_dir: Option<String>,

    /// Mount point of the cgroup v1 controllers
    #[arg(long, default_value = DEFAULT_CGROUP_ROOT)]
    cgroup_root: String,

    /// File holding the output of `scontrol show job <id> -o` [default: run scontrol]
    #[arg(long)]
    job_info: Option<String>,

    /// Log what is being read to stderr
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() {
    match sprofile() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            process::exit(1);
        }
    }
}

fn sprofile() -> Result<()> {
    let cli = Cli::parse();

    let common_args = match cli.command {
        Commands::Start(ref start_args) => &start_args.common_args,
        Commands::Stop(ref stop_args) => &stop_args.common_args,
    };

    // RUST_LOG overrides the default level.
    let level = if common_args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Only one process per node does the work.  Outside srun there is no local ID and we are the
    // only process.
    if let Ok(rank) = env::var("SLURM_LOCALID") {
        if rank != "0" {
            debug!("Local rank {rank}, nothing to do");
            return Ok(());
        }
    }

    let ctx = job_context(common_args)?;

    let mut config = Config::new(&cache_dir(common_args)?);
    config.cgroup_root = PathBuf::from(&common_args.cgroup_root);
    if let Commands::Stop(ref stop_args) = cli.command {
        config.lock_timeout = Duration::from_secs(stop_args.lock_timeout);
        config.keep_snapshot = stop_args.keep_snapshot;
    }
    debug!("{:?}", config);

    let gpus = jobstats::system_gpus();
    let engine = Engine::new(&config, &ctx, gpus.as_ref());

    match cli.command {
        Commands::Start(_) => {
            engine.start()?;
        }
        Commands::Stop(_) => {
            // Compute everything first: the report is printed whole or not at all.
            let report = engine.stop()?;
            {
                let _lock = ReportLock::acquire(&config.lock_path(&ctx), config.lock_timeout)?;
                report.write(&mut io::stdout().lock())?;
            }
            engine.finish()?;
        }
    }
    Ok(())
}

// The job is identified by the environment; the rest of the context comes from the scheduler.

fn job_context(common_args: &CommonArgs) -> Result<JobContext> {
    let Ok(job_id) = env::var("SLURM_JOB_ID") else {
        bail!("SLURM_JOB_ID is not set, sprofile must run inside a Slurm job")
    };
    let hostname = nix::unistd::gethostname()
        .context("Could not get host name")?
        .into_string()
        .map_err(|h| anyhow::anyhow!("Host name {:?} is not UTF-8", h))?;
    let uid = nix::unistd::getuid().as_raw();

    let job_info = if let Some(ref filename) = common_args.job_info {
        fs::read_to_string(filename).with_context(|| format!("Could not read {filename}"))?
    } else {
        jobstats::query_scheduler(&job_id)?
    };
    Ok(JobContext::from_job_info(&job_id, &hostname, uid, &job_info)?)
}

fn cache_dir(common_args: &CommonArgs) -> Result<PathBuf> {
    if let Some(ref dir) = common_args.cache_dir {
        Ok(PathBuf::from(dir))
    } else if let Ok(dir) = env::var("CACHEDIR") {
        Ok(PathBuf::from(dir))
    } else if let Ok(home) = env::var("HOME") {
        Ok(PathBuf::from(home).join(".cache"))
    } else {
        bail!("No cache directory: set CACHEDIR or HOME, or use --cache-dir")
    }
}

#[test]
fn test_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();

    let cli = Cli::try_parse_from(["sprofile", "stop", "--keep-snapshot", "--lock-timeout", "3"]).unwrap();
    match cli.command {
        Commands::Stop(ref stop_args) => {
            assert!(stop_args.keep_snapshot);
            assert!(stop_args.lock_timeout == 3);
            assert!(stop_args.common_args.cgroup_root == "/sys/fs/cgroup");
        }
        _ => panic!("expected stop"),
    }

    let cli = Cli::try_parse_from(["sprofile", "start", "--cache-dir", "/tmp/x"]).unwrap();
    match cli.command {
        Commands::Start(ref start_args) => {
            assert!(start_args.common_args.cache_dir.as_deref() == Some("/tmp/x"));
        }
        _ => panic!("expected start"),
    }

    // Stop-only switches are not accepted by start
    assert!(Cli::try_parse_from(["sprofile", "start", "--keep-snapshot"]).is_err());
    assert!(Cli::try_parse_from(["sprofile", "restart"]).is_err());
}

#[test]
fn test_cache_dir_switch_wins() {
    let args = CommonArgs {
        cache_dir: Some("/scratch/cache".to_string()),
        cgroup_root: DEFAULT_CGROUP_ROOT.to_string(),
        job_info: None,
        verbose: false,
    };
    assert!(cache_dir(&args).unwrap() == PathBuf::from("/scratch/cache"));
}
