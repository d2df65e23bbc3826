// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Host hardware probe behind a trait so the metrics service can be tested
//! with canned snapshots. The production probe reads CPU and memory from
//! the host; GPU metrics are reported unavailable unless a GPU-capable
//! probe is wired in by the embedding application.

use parking_lot::Mutex;
use sysinfo::System;

use krai_pipeline_domain::HardwareStatus;

/// Samples the host's resource usage.
pub trait HardwareProbe: Send + Sync {
    fn sample(&self) -> HardwareStatus;
}

/// Probe backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for SysinfoProbe {
    fn sample(&self) -> HardwareStatus {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage() as f64;
        let total = system.total_memory() as f64;
        let available = system.available_memory() as f64;
        let ram_percent = if total > 0.0 {
            (total - available) / total * 100.0
        } else {
            0.0
        };

        HardwareStatus {
            cpu_percent: round2(cpu_percent),
            ram_percent: round2(ram_percent),
            ram_available_gb: round2(available / (1024.0 * 1024.0 * 1024.0)),
            gpu_available: false,
            gpu_percent: None,
            gpu_memory_used_gb: None,
            gpu_memory_total_gb: None,
        }
    }
}

/// Probe returning a fixed snapshot. Used by tests and by deployments
/// without host access.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub status: HardwareStatus,
}

impl StaticProbe {
    pub fn new(status: HardwareStatus) -> Self {
        Self { status }
    }
}

impl HardwareProbe for StaticProbe {
    fn sample(&self) -> HardwareStatus {
        self.status.clone()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_probe_reports_sane_ranges() {
        let probe = SysinfoProbe::new();
        let status = probe.sample();
        assert!(status.cpu_percent >= 0.0);
        assert!(status.ram_percent >= 0.0 && status.ram_percent <= 100.0);
        assert!(status.ram_available_gb >= 0.0);
        assert!(!status.gpu_available);
    }
}
