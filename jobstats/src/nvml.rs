// NVML-backed GPU source.
//
// Each query initializes the library, looks up the device, runs, and shuts the library down again
// when the `Nvml` value is dropped.  That is wasteful but keeps handles from leaking across calls,
// and there are only a handful of queries per invocation.
//
// NVML reports the accounting start time in microseconds but the active time in milliseconds; the
// records we hand out are all microseconds.  The energy counter is in millijoules.

use crate::error::{Error, Result};
use crate::gpu::{AccountingRecord, DeviceAccounting, GpuSource};
use log::{debug, warn};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};

pub struct NvmlGpus;

impl GpuSource for NvmlGpus {
    fn device_indices(&self) -> Result<Vec<u32>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(e) => {
                // No driver, no library, or no GPU: all the same to us.
                debug!("NVML unavailable, assuming no GPUs: {e}");
                return Ok(vec![]);
            }
        };
        let count = nvml
            .device_count()
            .map_err(|e| Error::device("device count", e))?;
        Ok((0..count).collect())
    }

    fn accounting(&self, index: u32) -> Result<DeviceAccounting> {
        with_device(index, |device| {
            // Without accounting mode there are no records, which reads as an idle GPU.
            if let Ok(false) = device.is_accounting_enabled() {
                warn!("Accounting mode is disabled on GPU {index}, its load will read as zero");
            }
            let mut records = vec![];
            for pid in device.accounting_pids()? {
                let stats = device.accounting_stats_for(pid)?;
                records.push(AccountingRecord {
                    start_time: stats.start_time,
                    duration: stats.time.saturating_mul(1000),
                    gpu_utilization_percent: stats.gpu_utilization.unwrap_or(0),
                    peak_memory_bytes: stats.max_memory_usage.unwrap_or(0),
                });
            }
            let total_memory_bytes = device.memory_info()?.total;
            debug!("GPU {index}: {} accounting records, {total_memory_bytes} bytes", records.len());
            Ok(DeviceAccounting {
                records,
                total_memory_bytes,
            })
        })
    }

    fn energy(&self, index: u32) -> Result<u64> {
        with_device(index, |device| device.total_energy_consumption())
    }
}

fn with_device<T, F>(index: u32, query: F) -> Result<T>
where
    F: FnOnce(&Device) -> std::result::Result<T, NvmlError>,
{
    let what = || format!("device {index}");
    let nvml = Nvml::init().map_err(|e| Error::device(what(), e))?;
    let device = nvml.device_by_index(index).map_err(|e| Error::device(what(), e))?;
    query(&device).map_err(|e| Error::device(what(), e))
}
