//! Raw hardware counters opened through `perf_event_open()`.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;

use perf_event::hooks::sys;
use perf_event::hooks::sys::bindings::{self, perf_event_attr};

use crate::error::EmulError;
use crate::events::EventDesc;
use crate::snapshot::{CoreCounts, Snapshot};
use crate::topology::Topology;
use crate::util::HostEnv;

/// Something that can fill a [`Snapshot`] with current counter values.
pub trait CounterSource {
    fn read_into(&mut self, snap: &mut Snapshot) -> Result<(), EmulError>;
}

/// A single counter file descriptor.
pub struct RawCounter {
    file: File,
    name: String,
}

impl RawCounter {
    /// Open a counter with the given attributes.
    pub fn open(attrs: &mut perf_event_attr, pid: i32, cpu: i32,
        name: String) -> Result<Self, EmulError>
    {
        attrs.size = std::mem::size_of::<perf_event_attr>() as u32;
        let fd = unsafe {
            sys::perf_event_open(attrs, pid, cpu, -1,
                bindings::PERF_FLAG_FD_CLOEXEC as libc::c_ulong)
        };
        if fd < 0 {
            return Err(EmulError::PerfOpen {
                name, source: std::io::Error::last_os_error(),
            });
        }
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self { file, name })
    }

    pub fn name(&self) -> &str { &self.name }

    fn check(&self, ret: libc::c_int) -> Result<(), EmulError> {
        if ret < 0 {
            return Err(EmulError::Counter {
                name: self.name.clone(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn enable(&mut self) -> Result<(), EmulError> {
        let ret = unsafe { sys::ioctls::ENABLE(self.file.as_raw_fd(), 0) };
        self.check(ret)
    }

    pub fn disable(&mut self) -> Result<(), EmulError> {
        let ret = unsafe { sys::ioctls::DISABLE(self.file.as_raw_fd(), 0) };
        self.check(ret)
    }

    pub fn reset(&mut self) -> Result<(), EmulError> {
        let ret = unsafe { sys::ioctls::RESET(self.file.as_raw_fd(), 0) };
        self.check(ret)
    }

    /// Read the current 64-bit count.
    pub fn read(&mut self) -> Result<u64, EmulError> {
        // NOTE: Back-to-back reads sometimes return a stale value unless
        // we yield first.
        HostEnv::sleep_full(Duration::ZERO).map_err(|errno| {
            EmulError::Counter { name: self.name.clone(), source: errno.into() }
        })?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf).map_err(|source| {
            EmulError::Counter { name: self.name.clone(), source }
        })?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub(crate) fn file(&self) -> &File { &self.file }
}

/// Attributes for a raw in-core event.
fn raw_attrs(ev: &EventDesc) -> perf_event_attr {
    let mut attrs = perf_event_attr {
        type_: bindings::PERF_TYPE_RAW,
        config: ev.config(),
        ..Default::default()
    };
    attrs.__bindgen_anon_3.config1 = ev.config1();
    attrs.set_disabled(1);
    attrs.set_inherit(1);
    attrs
}

/// The four in-core counters opened on one CPU.
pub struct CoreCounters {
    pub cpu: usize,
    dram_reads: RawCounter,
    l2_stall: RawCounter,
    llc_hits: RawCounter,
    llc_miss: RawCounter,
}

impl CoreCounters {
    pub fn open(topo: &Topology, cpu: usize) -> Result<Self, EmulError> {
        let ev = topo.events;
        let open = |desc: &EventDesc| {
            RawCounter::open(&mut raw_attrs(desc), -1, cpu as i32,
                format!("cpu{}/{}", cpu, desc.name()))
        };
        Ok(Self {
            cpu,
            dram_reads: open(&ev.dram_reads)?,
            l2_stall: open(&ev.l2_stall)?,
            llc_hits: open(&ev.llc_hits)?,
            llc_miss: open(&ev.llc_miss)?,
        })
    }

    fn all_mut(&mut self) -> [&mut RawCounter; 4] {
        [&mut self.dram_reads, &mut self.l2_stall, &mut self.llc_hits,
            &mut self.llc_miss]
    }

    pub fn read(&mut self) -> Result<CoreCounts, EmulError> {
        Ok(CoreCounts {
            dram_reads: self.dram_reads.read()?,
            l2_stall: self.l2_stall.read()?,
            llc_hits: self.llc_hits.read()?,
            llc_miss: self.llc_miss.read()?,
        })
    }
}

/// Every counter needed by the delay model: one writeback counter per
/// cache agent, and [`CoreCounters`] for every online CPU.
pub struct Pmu {
    cbos: Vec<RawCounter>,
    cores: Vec<CoreCounters>,
}

impl Pmu {
    pub fn open(topo: &Topology) -> Result<Self, EmulError> {
        let ev = topo.events;
        let mut cbos = Vec::with_capacity(topo.cbo_count);
        for idx in 0..topo.cbo_count {
            let pmu_type = HostEnv::sysfs_uncore_type(ev.uncore_prefix, idx)?;
            let mut attrs = perf_event_attr {
                type_: pmu_type,
                config: ev.cbo_writeback.config(),
                ..Default::default()
            };
            attrs.set_disabled(1);
            attrs.set_inherit(1);
            attrs.set_enable_on_exec(1);
            // Uncore events must be opened with pid -1.
            cbos.push(RawCounter::open(&mut attrs, -1, idx as i32,
                format!("{}{}/{}", ev.uncore_prefix, idx, ev.cbo_writeback.name()))?);
        }

        let cores = (0..topo.online_cpus)
            .map(|cpu| CoreCounters::open(topo, cpu))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(cbos = cbos.len(), cpus = cores.len(), "opened counters");
        Ok(Self { cbos, cores })
    }

    /// Reset and start every counter.
    pub fn enable(&mut self) -> Result<(), EmulError> {
        for ctr in self.cbos.iter_mut() {
            ctr.enable()?;
        }
        for core in self.cores.iter_mut() {
            for ctr in core.all_mut() {
                ctr.reset()?;
                ctr.enable()?;
            }
        }
        Ok(())
    }

    /// Stop every counter.
    pub fn disable(&mut self) -> Result<(), EmulError> {
        for ctr in self.cbos.iter_mut() {
            ctr.disable()?;
        }
        for core in self.cores.iter_mut() {
            for ctr in core.all_mut() {
                ctr.disable()?;
            }
        }
        Ok(())
    }
}

impl CounterSource for Pmu {
    fn read_into(&mut self, snap: &mut Snapshot) -> Result<(), EmulError> {
        for (ctr, val) in self.cbos.iter_mut().zip(snap.writeback.iter_mut()) {
            *val = ctr.read()?;
        }
        for (core, val) in self.cores.iter_mut().zip(snap.cores.iter_mut()) {
            *val = core.read()?;
        }
        Ok(())
    }
}
