// This library measures the resource use of one Slurm job on one node.  At job start it snapshots
// cumulative counters (CPU time per core from cgroups, GPU energy from NVML); at job end it reads
// them again and turns the differences, together with the job's memory high-water mark and the GPU
// accounting records, into a report.
//
// The binary (`sprofile`) owns the command line, the environment and the printing; everything that
// knows about counters lives here.

mod cgroup;
mod config;
mod context;
mod engine;
mod error;
mod gate;
mod gpu;
mod monitor;
#[cfg(feature = "nvml")]
mod nvml;
mod overlap;
mod report;
mod snapshot;

pub use cgroup::CgroupCounters;
pub use config::{Config, DEFAULT_CGROUP_ROOT, DEFAULT_LOCK_TIMEOUT};
pub use context::{parse_slurm_duration, query_scheduler, JobContext};
pub use error::{Error, Result};
pub use gpu::{system_gpus, AccountingRecord, DeviceAccounting, GpuSource, NoGpus};
pub use monitor::{cpu_load, Monitor, Sources, MONITORS};
pub use overlap::{aggregate, DeviceUsage};
pub use report::{format_duration, CpuUsage, GpuUsage, MemoryUsage, ReportRecord};
pub use snapshot::{Snapshot, SnapshotStore};

// Start and stop a job's accounting.  `Engine::stop` returns the report without printing it.

pub use engine::Engine;

// Serialize report printing across the nodes of a job.

pub use gate::ReportLock;
