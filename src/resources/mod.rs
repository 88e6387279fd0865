//! Accelerator discovery and assignment for background jobs.
//!
//! Discovery shells out to `nvidia-smi`; any failure (missing binary,
//! timeout, unparseable output) degrades to an empty device list and jobs
//! run without a device pin.

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_UTILIZATION: u32 = 30;

/// Snapshot of one accelerator at probe time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub utilization: u32,
}

impl DeviceInfo {
    pub fn memory_free_gb(&self) -> f64 {
        self.memory_free_mb as f64 / 1024.0
    }
}

/// Probe the host for accelerators. Empty on any failure.
pub fn discover_devices() -> Vec<DeviceInfo> {
    let child = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            debug!("nvidia-smi not available: {e}");
            return Vec::new();
        }
    };

    let status = match child.wait_timeout(PROBE_TIMEOUT) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!("nvidia-smi probe timed out");
            let _ = child.kill();
            let _ = child.wait();
            return Vec::new();
        }
        Err(e) => {
            warn!("nvidia-smi probe failed: {e}");
            return Vec::new();
        }
    };

    if !status.success() {
        debug!("nvidia-smi exited with {status}");
        return Vec::new();
    }

    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        use std::io::Read;
        let _ = stdout.read_to_string(&mut output);
    }
    parse_probe_output(&output)
}

fn parse_probe_output(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 6 {
                return None;
            }
            Some(DeviceInfo {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                memory_total_mb: fields[2].parse().ok()?,
                memory_used_mb: fields[3].parse().ok()?,
                memory_free_mb: fields[4].parse().ok()?,
                utilization: fields[5].parse().ok()?,
            })
        })
        .collect()
}

/// Assigns devices to concurrent jobs from a probe snapshot.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    available: Vec<DeviceInfo>,
}

impl DeviceAllocator {
    /// Filter to usable devices and rank them most-free first, breaking
    /// ties on lower utilization.
    pub fn new(devices: Vec<DeviceInfo>, min_free_gb: Option<f64>, max_utilization: Option<u32>) -> Self {
        let max_util = max_utilization.unwrap_or(DEFAULT_MAX_UTILIZATION);
        let mut available: Vec<DeviceInfo> = devices
            .into_iter()
            .filter(|d| {
                let free_ok = min_free_gb.map_or(true, |min| d.memory_free_gb() >= min);
                free_ok && d.utilization <= max_util
            })
            .collect();
        available.sort_by(|a, b| {
            b.memory_free_mb
                .cmp(&a.memory_free_mb)
                .then(a.utilization.cmp(&b.utilization))
        });
        Self { available }
    }

    pub fn available(&self) -> &[DeviceInfo] {
        &self.available
    }

    /// One device index per job. With fewer devices than jobs, assignment
    /// wraps round-robin; with no devices, every job gets `None`.
    pub fn assign(&self, job_count: usize) -> Vec<Option<u32>> {
        if self.available.is_empty() {
            return vec![None; job_count];
        }
        (0..job_count)
            .map(|i| Some(self.available[i % self.available.len()].index))
            .collect()
    }

    /// Value for `CUDA_VISIBLE_DEVICES`, when a device was assigned.
    pub fn visibility_env(assignment: Option<u32>) -> Option<String> {
        assignment.map(|index| index.to_string())
    }
}
