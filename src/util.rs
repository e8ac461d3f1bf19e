pub mod cpuid;

use std::io::Read;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::EmulError;

fn read_to_string(path: &str) -> Result<String, EmulError> {
    let mut f = std::fs::File::open(path).map_err(|source| {
        EmulError::Probe { path: path.to_string(), source }
    })?;
    let mut res = String::new();
    f.read_to_string(&mut res).map_err(|source| {
        EmulError::Probe { path: path.to_string(), source }
    })?;
    Ok(res)
}

/// Utilities for inspecting the host and controlling target threads.
pub struct HostEnv;
impl HostEnv {
    const EVENT_SOURCE_PATH: &'static str =
        "/sys/bus/event_source/devices";
    pub const CPUINFO_PATH: &'static str =
        "/proc/cpuinfo";
    const PARANOID_PATH: &'static str =
        "/proc/sys/kernel/perf_event_paranoid";
    const WATCHDOG_PATH: &'static str =
        "/proc/sys/kernel/nmi_watchdog";

    /// Return the number of online CPUs.
    pub fn online_cpus() -> Result<usize, EmulError> {
        let n = nix::unistd::sysconf(nix::unistd::SysconfVar::_NPROCESSORS_ONLN)
            .map_err(|errno| EmulError::Probe {
                path: "sysconf(_NPROCESSORS_ONLN)".to_string(),
                source: errno.into(),
            })?;
        match n {
            Some(n) if n > 0 => Ok(n as usize),
            _ => Err(EmulError::ProbeFormat {
                path: "sysconf(_NPROCESSORS_ONLN)".to_string(),
                reason: format!("{:?}", n),
            }),
        }
    }

    /// Return the number of uncore cache-agent PMUs exposed by perf.
    pub fn sysfs_uncore_count() -> Result<usize, EmulError> {
        let dir = std::fs::read_dir(Self::EVENT_SOURCE_PATH).map_err(|source| {
            EmulError::Probe { path: Self::EVENT_SOURCE_PATH.to_string(), source }
        })?;
        let names = dir.filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned());
        match count_uncore_units(names) {
            0 => Err(EmulError::ProbeFormat {
                path: Self::EVENT_SOURCE_PATH.to_string(),
                reason: "no uncore_cbox_N/uncore_cha_N PMUs".to_string(),
            }),
            n => Ok(n),
        }
    }

    /// Return the dynamic PMU type of a particular uncore unit.
    pub fn sysfs_uncore_type(prefix: &str, idx: usize) -> Result<u32, EmulError> {
        let path = format!("{}/{}{}/type", Self::EVENT_SOURCE_PATH, prefix, idx);
        let res = read_to_string(&path)?;
        res.trim().parse().map_err(|_| EmulError::ProbeFormat {
            path, reason: format!("{:?}", res.trim()),
        })
    }

    /// Return the frequency (in MHz) reported for the first CPU.
    pub fn procfs_cpu_mhz() -> Result<f64, EmulError> {
        let res = read_to_string(Self::CPUINFO_PATH)?;
        parse_cpu_mhz(&res).ok_or_else(|| EmulError::ProbeFormat {
            path: Self::CPUINFO_PATH.to_string(),
            reason: "no 'cpu MHz' line".to_string(),
        })
    }

    /// Return the value of `kernel.perf_event_paranoid`.
    pub fn procfs_perf_paranoid() -> Result<i32, EmulError> {
        let res = read_to_string(Self::PARANOID_PATH)?;
        res.trim().parse().map_err(|_| EmulError::ProbeFormat {
            path: Self::PARANOID_PATH.to_string(),
            reason: format!("{:?}", res.trim()),
        })
    }

    /// Returns true if the NMI watchdog is holding a counter.
    pub fn procfs_nmi_watchdog_enabled() -> Result<bool, EmulError> {
        let res = read_to_string(Self::WATCHDOG_PATH)?;
        Ok(res.trim() != "0")
    }
}

impl HostEnv {
    /// Pin a thread to a particular core.
    pub fn pin_to_core(tid: i32, core: usize) -> Result<(), Errno> {
        let pid = nix::unistd::Pid::from_raw(tid);
        let mut cpuset = nix::sched::CpuSet::new();
        cpuset.set(core)?;
        nix::sched::sched_setaffinity(pid, &cpuset)
    }

    /// Sleep for the whole duration, resuming with the remaining time when
    /// interrupted by a signal.
    pub fn sleep_full(dur: Duration) -> Result<(), Errno> {
        Self::sleep_timespec(libc::timespec {
            tv_sec: dur.as_secs() as libc::time_t,
            tv_nsec: dur.subsec_nanos() as libc::c_long,
        })
    }

    fn sleep_timespec(mut req: libc::timespec) -> Result<(), Errno> {
        let mut rem = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        loop {
            let ret = unsafe { libc::nanosleep(&req, &mut rem) };
            if ret == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => req = rem,
                errno => {
                    tracing::error!(%errno, "nanosleep failed");
                    return Err(errno);
                },
            }
        }
    }
}

/// Count the directory entries that look like `uncore_cbox_N`/`uncore_cha_N`.
pub fn count_uncore_units<I, S>(names: I) -> usize
    where I: IntoIterator<Item = S>, S: AsRef<str>
{
    names.into_iter().filter(|name| {
        let name = name.as_ref();
        ["uncore_cbox_", "uncore_cha_"].iter().any(|prefix| {
            name.strip_prefix(prefix)
                .and_then(|rest| rest.chars().next())
                .map_or(false, |c| c.is_ascii_digit())
        })
    }).count()
}

/// Find the first `cpu MHz : <value>` line in `/proc/cpuinfo` text.
pub fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    cpuinfo.lines().find_map(|line| {
        let (key, val) = line.split_once(':')?;
        if key.trim() != "cpu MHz" {
            return None;
        }
        val.trim().parse().ok()
    })
}

/// Parse a hexadecimal CPU mask (ie. `0xf0`) into a list of core indices.
pub fn parse_core_mask(mask: &str) -> Option<Vec<usize>> {
    let digits = mask.trim();
    let digits = digits.strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() {
        return None;
    }
    let mut cores = Vec::new();
    for (nibble_idx, c) in digits.chars().rev().enumerate() {
        let v = c.to_digit(16)? as usize;
        for bit in 0..4 {
            if v & (1 << bit) != 0 {
                cores.push(nibble_idx * 4 + bit);
            }
        }
    }
    Some(cores)
}
