// The monitors.  Each monitor is a start/stop pair over one counter source: `start` records whatever
// baseline it needs in the snapshot, `stop` reads the counters again and fills in its part of the
// report.  The set is closed and the engine runs them in the order of `MONITORS`.
//
// The GPU monitors only run when the node has GPUs.

use crate::cgroup::CgroupCounters;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::gpu::GpuSource;
use crate::overlap;
use crate::report::{CpuUsage, GpuUsage, ReportRecord};
use crate::snapshot::Snapshot;
use chrono::Duration;
use log::{debug, warn};
use std::collections::BTreeSet;

/// Millijoules per kilowatt-hour.
const MJ_PER_KWH: f64 = 3.6e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    Cpu,
    Memory,
    GpuEnergy,
    GpuUtilization,
}

pub const MONITORS: [Monitor; 4] = [
    Monitor::Cpu,
    Monitor::Memory,
    Monitor::GpuEnergy,
    Monitor::GpuUtilization,
];

/// What the monitors read from.  `devices` is the GPU device list, queried once per invocation.

pub struct Sources<'a> {
    pub cgroup: &'a CgroupCounters,
    pub gpus: &'a dyn GpuSource,
    pub devices: &'a [u32],
}

impl Monitor {
    pub fn needs_gpu(self) -> bool {
        matches!(self, Monitor::GpuEnergy | Monitor::GpuUtilization)
    }

    pub fn start(self, sources: &Sources, snapshot: &mut Snapshot) -> Result<()> {
        match self {
            Monitor::Cpu => {
                snapshot.cpu_usage_baseline = Some(sources.cgroup.read_per_core_cpu_usage()?);
            }
            Monitor::GpuEnergy => {
                let energy = sources
                    .devices
                    .iter()
                    .map(|i| sources.gpus.energy(*i))
                    .collect::<Result<Vec<u64>>>()?;
                snapshot.gpu_energy_baseline = Some(energy);
            }
            // Peak memory is a high-water mark and GPU utilization is windowed on the job start
            // time, neither needs a baseline.
            Monitor::Memory | Monitor::GpuUtilization => {}
        }
        Ok(())
    }

    pub fn stop(
        self,
        ctx: &JobContext,
        sources: &Sources,
        baseline: &Snapshot,
        report: &mut ReportRecord,
    ) -> Result<()> {
        match self {
            Monitor::Cpu => {
                let Some(ref old) = baseline.cpu_usage_baseline else {
                    return Err(missing_baseline(ctx));
                };
                let current = sources.cgroup.read_per_core_cpu_usage()?;
                let cpus = sources.cgroup.read_cpu_set()?;
                report.cpu = cpu_load(old, &current, &cpus, ctx.run_time)?;
            }
            Monitor::Memory => {
                report.memory.peak_bytes = sources.cgroup.read_memory_peak()?;
                report.memory.limit_bytes = sources.cgroup.read_memory_limit()?;
            }
            Monitor::GpuEnergy => {
                let Some(ref old) = baseline.gpu_energy_baseline else {
                    return Err(missing_baseline(ctx));
                };
                if old.len() != sources.devices.len() {
                    return Err(Error::device(
                        "device count",
                        format!("{} GPUs at start, {} now", old.len(), sources.devices.len()),
                    ));
                }
                let mut kwh = 0.0;
                for (i, before) in sources.devices.iter().zip(old) {
                    let now = sources.gpus.energy(*i)?;
                    let used = now.checked_sub(*before).ok_or_else(|| {
                        Error::device(format!("device {i}"), "energy counter went backwards")
                    })?;
                    kwh += used as f64 / MJ_PER_KWH;
                }
                gpu_part(report).energy_kwh = kwh;
            }
            Monitor::GpuUtilization => {
                let mut load = 0.0;
                let mut peak = 0u64;
                let mut min_total = u64::MAX;
                for i in sources.devices {
                    let accounting = sources.gpus.accounting(*i)?;
                    let usage = overlap::aggregate(&accounting.records, ctx.start_time);
                    debug!("GPU {i}: load {:.3}, peak {} bytes", usage.load, usage.peak_memory_bytes);
                    load += usage.load;
                    peak = peak.max(usage.peak_memory_bytes);
                    min_total = min_total.min(accounting.total_memory_bytes);
                }
                let gpu = gpu_part(report);
                gpu.load = load;
                gpu.devices = sources.devices.len();
                gpu.peak_memory_bytes = peak;
                gpu.min_total_memory_bytes = if sources.devices.is_empty() { 0 } else { min_total };
            }
        }
        Ok(())
    }
}

fn missing_baseline(ctx: &JobContext) -> Error {
    Error::MissingBaseline {
        job_id: ctx.job_id.clone(),
        hostname: ctx.hostname.clone(),
    }
}

fn gpu_part(report: &mut ReportRecord) -> &mut GpuUsage {
    report.gpu.get_or_insert_with(GpuUsage::default)
}

/// Sum over the cores in `cpus` of (current - baseline) / run time, with counters in ns.  A zero run
/// time is taken to be one second so the result stays finite.

pub fn cpu_load(
    baseline: &[u64],
    current: &[u64],
    cpus: &BTreeSet<usize>,
    run_time: Duration,
) -> Result<CpuUsage> {
    let mut seconds = run_time.num_seconds();
    if seconds <= 0 {
        warn!("Run time is {seconds}s, computing CPU load over 1s instead");
        seconds = 1;
    }
    let mut busy_ns = 0u64;
    for &c in cpus {
        let (Some(&before), Some(&now)) = (baseline.get(c), current.get(c)) else {
            return Err(Error::parse(
                "cpuset.cpus",
                format!(
                    "core {c} not in cpuacct.usage_percpu ({} cores at start, {} now)",
                    baseline.len(),
                    current.len()
                ),
            ));
        };
        let delta = now.checked_sub(before).ok_or_else(|| {
            Error::parse("cpuacct.usage_percpu", format!("counter for core {c} went backwards"))
        })?;
        busy_ns = busy_ns.saturating_add(delta);
    }
    Ok(CpuUsage {
        load: busy_ns as f64 / (seconds as f64 * 1e9),
        cores: cpus.len(),
    })
}

#[test]
fn test_cpu_load() {
    let baseline = [100, 1_000_000_000, 0, 5];
    let current = [100, 3_000_000_000, 1_000_000_000, 999_999_999_999];
    // Core 3 is busy but not ours
    let cpus = BTreeSet::from([0, 1, 2]);
    let u = cpu_load(&baseline, &current, &cpus, Duration::seconds(2)).unwrap();
    assert!(u.cores == 3);
    assert!((u.load - 1.5).abs() < 1e-12);
}

#[test]
fn test_cpu_load_zero_runtime() {
    let u = cpu_load(&[0, 0], &[500_000_000, 0], &BTreeSet::from([0, 1]), Duration::zero()).unwrap();
    assert!(u.load.is_finite());
    assert!((u.load - 0.5).abs() < 1e-12);
}

#[test]
fn test_cpu_load_errors() {
    // cpuset names a core the node doesn't have
    let r = cpu_load(&[0, 0], &[1, 1], &BTreeSet::from([2]), Duration::seconds(1));
    assert!(matches!(r, Err(Error::Parse { .. })));

    // counter reset
    let r = cpu_load(&[10], &[5], &BTreeSet::from([0]), Duration::seconds(1));
    assert!(matches!(r, Err(Error::Parse { .. })));

    // empty cpuset is fine, if odd
    let u = cpu_load(&[10], &[50], &BTreeSet::new(), Duration::seconds(1)).unwrap();
    assert!(u.cores == 0 && u.load == 0.0);
}
