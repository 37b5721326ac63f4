// GPU counters.  The vendor API sits behind `GpuSource` so that nodes without GPUs, builds without
// the nvml feature, and tests all look the same to the engine.

use crate::error::Result;

/// Per-process accounting summary for one GPU.  Times are in microseconds.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    /// Microseconds since the epoch, same scale as `JobContext::start_time`.
    pub start_time: u64,

    /// Microseconds the process was active on the device.
    pub duration: u64,

    /// Average utilization over the process's lifetime, 100 = the whole card.
    pub gpu_utilization_percent: u32,

    /// Peak device memory of the process.
    pub peak_memory_bytes: u64,
}

impl AccountingRecord {
    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceAccounting {
    pub records: Vec<AccountingRecord>,
    pub total_memory_bytes: u64,
}

/// Access to the GPUs on this node.  Implementations must acquire and release any library handle
/// within each call.

pub trait GpuSource {
    /// `0..count`, or empty if there are no GPUs or no usable GPU library.  Absence is not an error.
    fn device_indices(&self) -> Result<Vec<u32>>;

    /// Accounting records and total memory for the device.
    fn accounting(&self, index: u32) -> Result<DeviceAccounting>;

    /// Cumulative energy counter of the device, in millijoules.
    fn energy(&self, index: u32) -> Result<u64>;
}

/// The node has no GPUs, or we were built without GPU support.

pub struct NoGpus;

impl GpuSource for NoGpus {
    fn device_indices(&self) -> Result<Vec<u32>> {
        Ok(vec![])
    }

    fn accounting(&self, index: u32) -> Result<DeviceAccounting> {
        Err(crate::error::Error::device(format!("device {index}"), "no GPU support"))
    }

    fn energy(&self, index: u32) -> Result<u64> {
        Err(crate::error::Error::device(format!("device {index}"), "no GPU support"))
    }
}

/// The GPU source for this build.

#[cfg(feature = "nvml")]
pub fn system_gpus() -> Box<dyn GpuSource> {
    Box::new(crate::nvml::NvmlGpus)
}

#[cfg(not(feature = "nvml"))]
pub fn system_gpus() -> Box<dyn GpuSource> {
    Box::new(NoGpus)
}

// In-memory devices for tests.  Energy counters can be bumped between `start` and `stop`, and a
// device can be made to fail.

#[cfg(test)]
pub(crate) struct FakeGpus {
    pub devices: Vec<DeviceAccounting>,
    pub energy: std::cell::RefCell<Vec<u64>>,
    pub failing: Option<u32>,
}

#[cfg(test)]
impl FakeGpus {
    pub fn new(devices: Vec<DeviceAccounting>) -> FakeGpus {
        let n = devices.len();
        FakeGpus {
            devices,
            energy: std::cell::RefCell::new(vec![0; n]),
            failing: None,
        }
    }

    fn check(&self, index: u32) -> Result<usize> {
        if self.failing == Some(index) || index as usize >= self.devices.len() {
            return Err(crate::error::Error::device(format!("device {index}"), "Unknown Error"));
        }
        Ok(index as usize)
    }
}

#[cfg(test)]
impl GpuSource for FakeGpus {
    fn device_indices(&self) -> Result<Vec<u32>> {
        Ok((0..self.devices.len() as u32).collect())
    }

    fn accounting(&self, index: u32) -> Result<DeviceAccounting> {
        let i = self.check(index)?;
        Ok(self.devices[i].clone())
    }

    fn energy(&self, index: u32) -> Result<u64> {
        let i = self.check(index)?;
        Ok(self.energy.borrow()[i])
    }
}

#[test]
fn test_no_gpus() {
    assert!(NoGpus.device_indices().unwrap().is_empty());
    assert!(NoGpus.energy(0).is_err());
}

#[test]
fn test_end_time() {
    let r = AccountingRecord {
        start_time: u64::MAX - 1,
        duration: 10,
        gpu_utilization_percent: 0,
        peak_memory_bytes: 0,
    };
    assert!(r.end_time() == u64::MAX);
}
