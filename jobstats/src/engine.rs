// The accounting engine: `start` captures baselines and persists them, `stop` loads them back, runs
// every monitor and returns the finished report.
//
// Per (job, host) the life cycle is Idle -> Started -> Stopped, where Started is "a snapshot exists"
// and Stopped is "the report has been computed".  Nothing is printed here; the caller prints the
// report only once `stop` has succeeded completely, so there are never partial reports.  Removing
// the snapshot is a separate step the caller takes after printing.

use crate::cgroup::CgroupCounters;
use crate::config::Config;
use crate::context::JobContext;
use crate::error::Result;
use crate::gpu::GpuSource;
use crate::monitor::{Sources, MONITORS};
use crate::report::ReportRecord;
use crate::snapshot::{Snapshot, SnapshotStore};
use log::{debug, info};

pub struct Engine<'a> {
    ctx: &'a JobContext,
    config: &'a Config,
    cgroup: CgroupCounters,
    gpus: &'a dyn GpuSource,
    store: SnapshotStore,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a Config, ctx: &'a JobContext, gpus: &'a dyn GpuSource) -> Engine<'a> {
        Engine {
            ctx,
            config,
            cgroup: CgroupCounters::new(&config.cgroup_root, ctx),
            gpus,
            store: SnapshotStore::new(config, ctx),
        }
    }

    /// Capture the baseline counters and persist them.  Returns the snapshot that was saved.

    pub fn start(&self) -> Result<Snapshot> {
        let devices = self.gpus.device_indices()?;
        debug!("Starting job {} on {} with {} GPUs", self.ctx.job_id, self.ctx.hostname, devices.len());
        let sources = self.sources(&devices);
        let mut snapshot = Snapshot::default();
        for monitor in MONITORS {
            if monitor.needs_gpu() && devices.is_empty() {
                continue;
            }
            monitor.start(&sources, &mut snapshot)?;
        }
        self.store.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Load the snapshot saved by `start` and compute the report against it.

    pub fn stop(&self) -> Result<ReportRecord> {
        let snapshot = self.store.load()?;
        self.measure(&snapshot)
    }

    /// Compute the report from the current counters and a baseline.

    pub fn measure(&self, baseline: &Snapshot) -> Result<ReportRecord> {
        let devices = self.gpus.device_indices()?;
        let sources = self.sources(&devices);
        let mut report = ReportRecord::new(self.ctx);
        for monitor in MONITORS {
            if monitor.needs_gpu() && devices.is_empty() {
                continue;
            }
            monitor.stop(self.ctx, &sources, baseline, &mut report)?;
        }
        Ok(report)
    }

    /// Dispose of the snapshot after a successful `stop`, unless configured to keep it.

    pub fn finish(&self) -> Result<()> {
        if self.config.keep_snapshot {
            info!("Keeping snapshot {}", self.store.path().display());
            return Ok(());
        }
        self.store.remove()
    }

    fn sources<'b>(&'b self, devices: &'b [u32]) -> Sources<'b> {
        Sources {
            cgroup: &self.cgroup,
            gpus: self.gpus,
            devices,
        }
    }
}

#[cfg(test)]
use crate::cgroup::fake_cgroup_tree;
#[cfg(test)]
use crate::error::Error;
#[cfg(test)]
use crate::gpu::{AccountingRecord, DeviceAccounting, FakeGpus, NoGpus};
#[cfg(test)]
use std::fs;

#[cfg(test)]
fn set_usage(root: &std::path::Path, usage: &str) {
    fs::write(root.join("cpuacct/cpuacct.usage_percpu"), usage).unwrap();
}

#[test]
fn test_start_stop_cpu_only() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(10);
    let root = fake_cgroup_tree(
        &dir.path().join("cgroup"),
        &ctx,
        "0 0 0 0\n",
        "1-2\n",
        "2147483648\n",
        "8589934592\n",
    );
    let mut config = Config::new(&dir.path().join("cache"));
    config.cgroup_root = root.clone();
    let engine = Engine::new(&config, &ctx, &NoGpus);

    let snapshot = engine.start().unwrap();
    assert!(snapshot.cpu_usage_baseline == Some(vec![0, 0, 0, 0]));
    assert!(snapshot.gpu_energy_baseline.is_none());
    assert!(config.snapshot_path(&ctx).exists());

    // Cores 1 and 2 belong to the job; core 3 is someone else's
    set_usage(&root, "0 10000000000 5000000000 99000000000\n");
    let report = engine.stop().unwrap();
    assert!(report.cpu.cores == 2);
    assert!((report.cpu.load - 1.5).abs() < 1e-12);
    assert!(report.memory.peak_bytes == 2 << 30);
    assert!(report.memory.limit_bytes == 8 << 30);
    assert!(report.gpu.is_none());
    assert!(!report.to_text().contains("GPU"));

    engine.finish().unwrap();
    assert!(!config.snapshot_path(&ctx).exists());
    assert!(matches!(engine.stop(), Err(Error::MissingBaseline { .. })));
}

#[test]
fn test_stop_without_start() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(10);
    let root = fake_cgroup_tree(&dir.path().join("cgroup"), &ctx, "0 0\n", "0-1\n", "1\n", "2\n");
    let mut config = Config::new(&dir.path().join("cache"));
    config.cgroup_root = root;
    let engine = Engine::new(&config, &ctx, &NoGpus);
    assert!(matches!(engine.stop(), Err(Error::MissingBaseline { .. })));
}

#[test]
fn test_keep_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(0);
    let root = fake_cgroup_tree(&dir.path().join("cgroup"), &ctx, "7 7\n", "0-1\n", "1\n", "2\n");
    let mut config = Config::new(&dir.path().join("cache"));
    config.cgroup_root = root;
    config.keep_snapshot = true;
    let engine = Engine::new(&config, &ctx, &NoGpus);
    engine.start().unwrap();

    // Immediate stop with zero run time: finite figures
    let report = engine.stop().unwrap();
    assert!(report.cpu.load == 0.0);
    assert!(!report.to_text().contains("NaN") && !report.to_text().contains("inf"));

    engine.finish().unwrap();
    assert!(engine.stop().is_ok());
}

#[test]
fn test_start_stop_with_gpus() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = crate::context::test_context(100);
    ctx.start_time = 1_000_000;
    let root = fake_cgroup_tree(&dir.path().join("cgroup"), &ctx, "0\n", "0\n", "1\n", "2\n");
    let mut config = Config::new(&dir.path().join("cache"));
    config.cgroup_root = root;

    let rec = |start_time, duration, util, mem| AccountingRecord {
        start_time,
        duration,
        gpu_utilization_percent: util,
        peak_memory_bytes: mem,
    };
    let gpus = FakeGpus::new(vec![
        DeviceAccounting {
            // A leftover from an earlier job, and one process at 80%
            records: vec![rec(0, 5_000_000, 100, 40 << 30), rec(1_000_000, 1_000_000, 80, 10 << 30)],
            total_memory_bytes: 80 << 30,
        },
        DeviceAccounting {
            records: vec![rec(2_000_000, 1_000_000, 40, 20 << 30)],
            total_memory_bytes: 40 << 30,
        },
    ]);
    *gpus.energy.borrow_mut() = vec![1_000, 2_000];
    let engine = Engine::new(&config, &ctx, &gpus);
    let snapshot = engine.start().unwrap();
    assert!(snapshot.gpu_energy_baseline == Some(vec![1_000, 2_000]));

    // 0.5 kWh on each device
    *gpus.energy.borrow_mut() = vec![1_000 + 1_800_000_000, 2_000 + 1_800_000_000];
    let report = engine.stop().unwrap();
    let gpu = report.gpu.unwrap();
    assert!(gpu.devices == 2);
    assert!((gpu.load - 1.2).abs() < 1e-12);
    assert!(gpu.peak_memory_bytes == 20 << 30);
    assert!(gpu.min_total_memory_bytes == 40 << 30);
    assert!((gpu.energy_kwh - 1.0).abs() < 1e-12);
}

#[test]
fn test_gpu_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(100);
    let root = fake_cgroup_tree(&dir.path().join("cgroup"), &ctx, "0\n", "0\n", "1\n", "2\n");
    let mut config = Config::new(&dir.path().join("cache"));
    config.cgroup_root = root;
    let mut gpus = FakeGpus::new(vec![DeviceAccounting::default(), DeviceAccounting::default()]);
    let engine = Engine::new(&config, &ctx, &gpus);
    engine.start().unwrap();

    // A device with no accounting records is idle, not broken
    let report = engine.stop().unwrap();
    assert!(report.gpu.as_ref().unwrap().load == 0.0);

    gpus.failing = Some(1);
    let engine = Engine::new(&config, &ctx, &gpus);
    assert!(matches!(engine.stop(), Err(Error::DeviceQuery { .. })));

    // A snapshot taken without GPUs can't be used to stop with GPUs
    let snapshot = Snapshot {
        cpu_usage_baseline: Some(vec![0]),
        gpu_energy_baseline: None,
    };
    gpus.failing = None;
    let engine = Engine::new(&config, &ctx, &gpus);
    assert!(matches!(engine.measure(&snapshot), Err(Error::MissingBaseline { .. })));
}
