//! Host topology, computed once at startup and passed by reference.

use crate::error::EmulError;
use crate::events::ModelEvents;
use crate::util::HostEnv;
use crate::util::cpuid::CpuInfo;

/// Counts and identification data for the host.
#[derive(Clone, Debug)]
pub struct Topology {
    /// Number of online CPUs.
    pub online_cpus: usize,

    /// Number of uncore cache agents (CBo/CHA units).
    pub cbo_count: usize,

    /// Core frequency used to convert stall cycles into time.
    pub cpu_mhz: f64,

    pub cpu: CpuInfo,

    /// Event encodings for the detected model.
    pub events: &'static ModelEvents,
}

impl Topology {
    /// Probe the host. `cpu_mhz` overrides the frequency from `/proc/cpuinfo`.
    pub fn detect(cpu_mhz: Option<f64>) -> Result<Self, EmulError> {
        let cpu = CpuInfo::detect()?;
        cpu.check_supported()?;
        let events = ModelEvents::for_model(cpu.model).ok_or_else(|| {
            EmulError::UnsupportedCpu(format!("model {} has no event table", cpu.model))
        })?;

        let online_cpus = HostEnv::online_cpus()?;
        let cbo_count = HostEnv::sysfs_uncore_count()?;
        let cpu_mhz = match cpu_mhz {
            Some(mhz) => mhz,
            None => HostEnv::procfs_cpu_mhz()?,
        };
        let cpu_mhz = check_cpu_mhz(cpu_mhz)?;

        tracing::debug!(online_cpus, cbo_count, cpu_mhz, model = cpu.model,
            "detected topology");
        Ok(Self { online_cpus, cbo_count, cpu_mhz, cpu, events })
    }
}

/// Stall cycles are divided by the frequency, so it has to be a positive
/// finite number.
fn check_cpu_mhz(mhz: f64) -> Result<f64, EmulError> {
    if mhz.is_finite() && mhz > 0.0 {
        Ok(mhz)
    } else {
        Err(EmulError::ProbeFormat {
            path: HostEnv::CPUINFO_PATH.to_string(),
            reason: format!("cpu MHz {} is not a positive frequency", mhz),
        })
    }
}
