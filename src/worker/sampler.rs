//! Self-reported resource samples.

use sysinfo::{get_current_pid, Pid, System};

use crate::scheduler::{MemorySample, ResourceUsage};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Samples cpu and memory of the current process with `sysinfo`.
pub struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
    limit_mb: f64,
}

impl ResourceSampler {
    /// Creates a sampler. Without an explicit limit the host's total memory
    /// is reported as the limit.
    pub fn new(limit_mb: Option<u64>) -> Self {
        let mut system = System::new();
        let limit_mb = match limit_mb {
            Some(limit) => limit as f64,
            None => {
                system.refresh_memory();
                system.total_memory() as f64 / BYTES_PER_MB
            }
        };
        Self {
            system,
            pid: get_current_pid().ok(),
            limit_mb,
        }
    }

    /// Memory limit reported with every sample, in MB.
    pub fn limit_mb(&self) -> f64 {
        self.limit_mb
    }

    /// CPU percent since the previous sample and current memory.
    pub fn sample(&mut self) -> (f64, MemorySample) {
        let Some(pid) = self.pid else {
            return (0.0, MemorySample::new(0.0, self.limit_mb));
        };
        self.system.refresh_process(pid);
        match self.system.process(pid) {
            Some(process) => (
                f64::from(process.cpu_usage()),
                MemorySample::new(process.memory() as f64 / BYTES_PER_MB, self.limit_mb),
            ),
            None => (0.0, MemorySample::new(0.0, self.limit_mb)),
        }
    }

    /// Current sample as a usage record.
    pub fn usage(&mut self) -> ResourceUsage {
        let (cpu, memory) = self.sample();
        ResourceUsage {
            cpu,
            memory: memory.used_mb,
        }
    }
}
