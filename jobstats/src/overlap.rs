// Time-weighted GPU utilization from overlapping per-process accounting records.
//
// Every record contributes its start and end to a sorted list of endpoints, which cuts the timeline
// into sub-intervals within which the set of active processes is constant.  A record covers the
// sub-interval [a,b] iff start <= a and end >= b (closed on both sides).  Per sub-interval we sum
// the utilization and the peak memory of the covering records; utilization is weighted by the
// width of the sub-interval and averaged over the span from the first to the last endpoint, and
// memory is maximized.
//
// Duplicate endpoints are kept.  They make zero-width sub-intervals [t,t], which add nothing to the
// load but do count for memory: a process ending at t and another starting at t are both live at t,
// and so is a zero-duration process together with everything running across it.
//
// Records that started before the job did belong to a previous job on the same device and are
// dropped entirely, not clipped.

use crate::gpu::AccountingRecord;
use std::cmp::max;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceUsage {
    /// Average utilization over the observed span, 1.0 = one full card.
    pub load: f64,

    /// Highest concurrent device memory use seen.
    pub peak_memory_bytes: u64,
}

/// Aggregate the records of one device, considering only those that started at or after
/// `job_start` (microseconds, like the records).

pub fn aggregate(records: &[AccountingRecord], job_start: u64) -> DeviceUsage {
    let live = records
        .iter()
        .filter(|r| r.start_time >= job_start)
        .collect::<Vec<&AccountingRecord>>();

    let mut endpoints = live
        .iter()
        .flat_map(|r| [r.start_time, r.end_time()])
        .collect::<Vec<u64>>();
    endpoints.sort_unstable();

    let (first, last) = match (endpoints.first(), endpoints.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return DeviceUsage::default(),
    };

    let mut peak = 0u64;
    let mut weighted = 0.0;
    for w in endpoints.windows(2) {
        let (a, b) = (w[0], w[1]);
        let mut util = 0u64;
        let mut mem = 0u64;
        for r in live.iter().filter(|r| r.start_time <= a && r.end_time() >= b) {
            util += r.gpu_utilization_percent as u64;
            mem = mem.saturating_add(r.peak_memory_bytes);
        }
        weighted += util as f64 * (b - a) as f64;
        peak = max(peak, mem);
    }

    DeviceUsage {
        load: weighted / 100.0 / max(last - first, 1) as f64,
        peak_memory_bytes: peak,
    }
}

#[cfg(test)]
fn rec(start_time: u64, duration: u64, util: u32, mem: u64) -> AccountingRecord {
    AccountingRecord {
        start_time,
        duration,
        gpu_utilization_percent: util,
        peak_memory_bytes: mem,
    }
}

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_empty() {
    let u = aggregate(&[], 0);
    assert!(u.load == 0.0);
    assert!(u.peak_memory_bytes == 0);

    // Everything filtered away is the same as nothing
    let u = aggregate(&[rec(5, 10, 80, 1000)], 100);
    assert!(u == DeviceUsage::default());
}

#[test]
fn test_single_record() {
    let u = aggregate(&[rec(1000, 500, 50, 7 << 30)], 1000);
    assert!(close(u.load, 0.5));
    assert!(u.peak_memory_bytes == 7 << 30);
}

#[test]
fn test_full_overlap() {
    let u = aggregate(&[rec(0, 100, 30, 10), rec(0, 100, 40, 20)], 0);
    assert!(close(u.load, 0.7));
    assert!(u.peak_memory_bytes == 30);
}

#[test]
fn test_disjoint() {
    // Three back-to-back records with a gap: sum(u_i * d_i) / 100 / (max_end - min_start)
    let records = [rec(0, 100, 20, 1), rec(100, 100, 60, 5), rec(300, 100, 100, 2)];
    let u = aggregate(&records, 0);
    let expected = (20.0 * 100.0 + 60.0 * 100.0 + 100.0 * 100.0) / 100.0 / 400.0;
    assert!(close(u.load, expected));
    // Touching at 100 counts as concurrent
    assert!(u.peak_memory_bytes == 6);

    // Uniform durations without gaps reduce to the arithmetic mean
    let records = [rec(0, 50, 10, 0), rec(50, 50, 30, 0), rec(100, 50, 80, 0)];
    assert!(close(aggregate(&records, 0).load, 0.4));
}

#[test]
fn test_partial_overlap() {
    // [0,100) at 50% and [50,150) at 30%: 50*50 + 80*50 + 30*50 over 150
    let u = aggregate(&[rec(0, 100, 50, 3), rec(50, 100, 30, 4)], 0);
    assert!(close(u.load, (50.0 * 50.0 + 80.0 * 50.0 + 30.0 * 50.0) / 100.0 / 150.0));
    assert!(u.peak_memory_bytes == 7);
}

#[test]
fn test_prior_job_excluded() {
    // The first record started before the job and runs into it; it is dropped, not clipped
    let records = [rec(900, 300, 100, 99), rec(1000, 100, 40, 1)];
    let u = aggregate(&records, 1000);
    assert!(close(u.load, 0.4));
    assert!(u.peak_memory_bytes == 1);
}

#[test]
fn test_zero_duration() {
    // Starts at job start, never ran: no division by zero, no load, but its memory was seen
    let u = aggregate(&[rec(1000, 0, 90, 64)], 1000);
    assert!(u.load == 0.0);
    assert!(u.load.is_finite());
    assert!(u.peak_memory_bytes == 64);
}

#[test]
fn test_zero_duration_inside_running() {
    // A zero-duration process at 50 is live together with the one running across it
    let u = aggregate(&[rec(0, 100, 50, 10), rec(50, 0, 0, 7)], 0);
    assert!(close(u.load, 0.5));
    assert!(u.peak_memory_bytes == 17);

    // At the very end of the running one, too
    let u = aggregate(&[rec(0, 100, 50, 10), rec(100, 0, 0, 7)], 0);
    assert!(u.peak_memory_bytes == 17);
}
