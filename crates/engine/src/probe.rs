//! Memory sensing behind one small capability: host RAM, one GPU's VRAM,
//! or nothing at all.
//!
//! The variant is picked once at construction and is sticky for the process
//! lifetime. Sensor failures are absorbed and reported as zero usage, so a
//! degraded probe simply never triggers the watchdog.

use std::sync::Mutex;

use nvml_wrapper::Nvml;
use sysinfo::System;

const MIB: u64 = 1024 * 1024;

/// One memory sample, for log lines.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MemoryInfo {
    pub(crate) used_mib: u64,
    pub(crate) total_mib: u64,
    pub(crate) fraction: f64,
}

pub(crate) struct MemoryProbe {
    inner: ProbeInner,
}

enum ProbeInner {
    Host(Mutex<System>),
    Gpu { nvml: Nvml, index: u32 },
    Disabled,
    #[cfg(test)]
    Manual(std::sync::Arc<Mutex<f64>>),
}

impl MemoryProbe {
    /// Probe process-wide host RAM.
    pub(crate) fn host() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        if sys.total_memory() == 0 {
            return Self::disabled();
        }
        Self {
            inner: ProbeInner::Host(Mutex::new(sys)),
        }
    }

    /// Probe a single GPU device's VRAM via NVML.
    ///
    /// Falls back to a disabled probe when the NVML library or the device is
    /// unavailable.
    pub(crate) fn gpu(index: u32) -> Self {
        let Ok(nvml) = Nvml::init() else {
            return Self::disabled();
        };
        let functional = nvml
            .device_by_index(index)
            .and_then(|device| device.memory_info())
            .is_ok();
        if !functional {
            return Self::disabled();
        }
        Self {
            inner: ProbeInner::Gpu { nvml, index },
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            inner: ProbeInner::Disabled,
        }
    }

    /// Pick the probe for a batch: disabled when asked, the GPU device when
    /// one is configured, host RAM otherwise.
    pub(crate) fn for_config(gpu_id: Option<u32>, disable: bool) -> Self {
        if disable {
            return Self::disabled();
        }
        match gpu_id {
            Some(index) => Self::gpu(index),
            None => Self::host(),
        }
    }

    #[cfg(test)]
    pub(crate) fn manual(fraction: std::sync::Arc<Mutex<f64>>) -> Self {
        Self {
            inner: ProbeInner::Manual(fraction),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !matches!(self.inner, ProbeInner::Disabled)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self.inner {
            ProbeInner::Host(_) => "RAM",
            ProbeInner::Gpu { .. } => "VRAM",
            ProbeInner::Disabled => "NONE",
            #[cfg(test)]
            ProbeInner::Manual(_) => "TEST",
        }
    }

    /// Current usage fraction in `[0, 1]`. Hot path; failures read as zero.
    pub(crate) fn usage(&self) -> f64 {
        self.info().fraction
    }

    /// Current usage with absolute numbers, for log lines.
    pub(crate) fn info(&self) -> MemoryInfo {
        match &self.inner {
            ProbeInner::Host(sys) => {
                let mut sys = match sys.lock() {
                    Ok(sys) => sys,
                    Err(_) => return MemoryInfo::default(),
                };
                sys.refresh_memory();
                let total = sys.total_memory();
                if total == 0 {
                    return MemoryInfo::default();
                }
                let used = sys.used_memory();
                MemoryInfo {
                    used_mib: used / MIB,
                    total_mib: total / MIB,
                    fraction: used as f64 / total as f64,
                }
            }
            ProbeInner::Gpu { nvml, index } => nvml
                .device_by_index(*index)
                .and_then(|device| device.memory_info())
                .map(|mem| MemoryInfo {
                    used_mib: mem.used / MIB,
                    total_mib: mem.total / MIB,
                    fraction: if mem.total == 0 {
                        0.0
                    } else {
                        mem.used as f64 / mem.total as f64
                    },
                })
                .unwrap_or_default(),
            ProbeInner::Disabled => MemoryInfo::default(),
            #[cfg(test)]
            ProbeInner::Manual(fraction) => {
                let fraction = *fraction.lock().unwrap();
                MemoryInfo {
                    used_mib: (fraction * 1000.0) as u64,
                    total_mib: 1000,
                    fraction,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_probe_reads_zero() {
        let probe = MemoryProbe::disabled();
        assert!(!probe.is_enabled());
        assert_eq!(probe.label(), "NONE");
        assert_eq!(probe.usage(), 0.0);
        assert_eq!(probe.info().total_mib, 0);
    }

    #[test]
    fn disable_flag_wins_over_gpu_selection() {
        let probe = MemoryProbe::for_config(Some(0), true);
        assert!(!probe.is_enabled());
    }

    #[test]
    fn host_probe_reports_plausible_numbers() {
        let probe = MemoryProbe::host();
        if !probe.is_enabled() {
            return; // no memory sensing in this environment
        }
        let info = probe.info();
        assert!(info.total_mib > 0);
        assert!(info.fraction >= 0.0 && info.fraction <= 1.0);
    }
}
