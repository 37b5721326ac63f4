// The report record assembled by `stop`, and its text form.  The layout is fixed, operators grep it:
//
//   -- sprofile report (<hostname>) --
//     Time:  <run time, right-aligned in 12>  /  <time limit>
//     CPU load:      <load>  /  <cores>
//     RAM peak:      <GB>G  /  <GB>G
//     GPU load:      <load>  /  <devices>        only with GPUs
//     GPU peak mem:  <GB>G  /  <GB>G             only with GPUs
//     GPU energy:    <kWh>kWh                    only with GPUs
//
// GB is 2^30 bytes.

use crate::context::JobContext;
use chrono::Duration;
use std::io;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuUsage {
    /// Sum over the job's cores of the fraction of the run time each core was busy.
    pub load: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryUsage {
    pub peak_bytes: u64,
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuUsage {
    /// Sum of per-device average loads, 1.0 = one full card.
    pub load: f64,
    pub devices: usize,

    /// Largest per-device peak.
    pub peak_memory_bytes: u64,

    /// Memory of the smallest card in the job.
    pub min_total_memory_bytes: u64,

    pub energy_kwh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    pub hostname: String,
    pub run_time: Duration,
    pub time_limit: Option<Duration>,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub gpu: Option<GpuUsage>,
}

impl ReportRecord {
    /// An empty report for the job, to be filled in by the monitors.

    pub fn new(ctx: &JobContext) -> ReportRecord {
        ReportRecord {
            hostname: ctx.hostname.clone(),
            run_time: ctx.run_time,
            time_limit: ctx.time_limit,
            cpu: CpuUsage::default(),
            memory: MemoryUsage::default(),
            gpu: None,
        }
    }

    /// Render the whole report and write it with a single call, so that it is not interleaved
    /// with other output at the level of our own writes.

    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        output.write_all(self.to_text().as_bytes())?;
        output.flush()
    }

    pub fn to_text(&self) -> String {
        let limit = match self.time_limit {
            Some(d) => format_duration(d),
            None => "UNLIMITED".to_string(),
        };
        let mut s = format!("-- sprofile report ({}) --\n", self.hostname);
        s += &format!("  Time:  {:>12}  /  {}\n", format_duration(self.run_time), limit);
        s += &format!("  CPU load:      {:4.1}  /  {:4.1}\n", self.cpu.load, self.cpu.cores as f64);
        s += &format!(
            "  RAM peak:      {:3.0}G  /  {:3.0}G\n",
            gib(self.memory.peak_bytes),
            gib(self.memory.limit_bytes)
        );
        if let Some(ref gpu) = self.gpu {
            s += &format!("  GPU load:      {:4.1}  /  {:4.1}\n", gpu.load, gpu.devices as f64);
            s += &format!(
                "  GPU peak mem:  {:3.0}G  /  {:3.0}G\n",
                gib(gpu.peak_memory_bytes),
                gib(gpu.min_total_memory_bytes)
            );
            s += &format!("  GPU energy:    {:4.1}kWh\n", gpu.energy_kwh);
        }
        s
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// `H:MM:SS`, preceded by `N day, ` or `N days, ` when a day or longer.

pub fn format_duration(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    let (days, rest) = (total / 86400, total % 86400);
    let hms = format!("{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    match days {
        0 => hms,
        1 => format!("1 day, {hms}"),
        n => format!("{n} days, {hms}"),
    }
}

#[test]
fn test_format_duration() {
    assert!(format_duration(Duration::seconds(0)) == "0:00:00");
    assert!(format_duration(Duration::seconds(3723)) == "1:02:03");
    assert!(format_duration(Duration::hours(24)) == "1 day, 0:00:00");
    assert!(format_duration(Duration::seconds(2 * 86400 + 36000 + 5)) == "2 days, 10:00:05");
}

#[test]
fn test_report_without_gpus() {
    let ctx = crate::context::test_context(3723);
    let mut report = ReportRecord::new(&ctx);
    report.cpu = CpuUsage { load: 3.46, cores: 4 };
    report.memory = MemoryUsage {
        peak_bytes: 3 << 30,
        limit_bytes: 16 << 30,
    };
    let expected = "-- sprofile report (c7-3) --\n\
                    \x20 Time:       1:02:03  /  2:00:00\n\
                    \x20 CPU load:       3.5  /   4.0\n\
                    \x20 RAM peak:        3G  /   16G\n";
    assert!(report.to_text() == expected);
}

#[test]
fn test_report_with_gpus() {
    let ctx = crate::context::test_context(60);
    let mut report = ReportRecord::new(&ctx);
    report.time_limit = None;
    report.gpu = Some(GpuUsage {
        load: 1.26,
        devices: 2,
        peak_memory_bytes: 30 << 30,
        min_total_memory_bytes: 40 << 30,
        energy_kwh: 0.43,
    });
    let text = report.to_text();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 7);
    assert!(lines[1] == "  Time:       0:01:00  /  UNLIMITED");
    assert!(lines[4] == "  GPU load:       1.3  /   2.0");
    assert!(lines[5] == "  GPU peak mem:   30G  /   40G");
    assert!(lines[6] == "  GPU energy:     0.4kWh");

    let mut out = Vec::<u8>::new();
    report.write(&mut out).unwrap();
    assert!(out == text.as_bytes());
}
