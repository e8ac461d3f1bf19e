//! Fixed-capacity table of monitor slots, one per usable core.

use std::fmt;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::error::{EmulError, RegistryError};
use crate::monitor::{Monitor, MonitorStatus, Region, SignalOutcome, TargetOps};

/// Printed when a target is detached.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetSummary {
    pub slot: usize,
    pub tgid: i32,
    pub tid: i32,
    pub emulated: Duration,
    pub total_delay: f64,
    pub samples: Vec<u64>,
}

impl fmt::Display for TargetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[*] ({}:{}) detached from slot {}", self.tgid, self.tid, self.slot)?;
        writeln!(f, "  {:<40}: {:.6}s", "emulated time", self.emulated.as_secs_f64())?;
        write!(f, "  {:<40}: {:.6}s", "total delay", self.total_delay)?;
        for (j, n) in self.samples.iter().enumerate() {
            write!(f, "\n  {:<40}: {}", format!("region {} samples", j), n)?;
        }
        Ok(())
    }
}

pub struct MonitorRegistry<O: TargetOps> {
    ops: O,
    slots: Vec<Monitor<O::Ring>>,
    pebs_period: u64,
}

impl<O: TargetOps> MonitorRegistry<O> {
    /// Create one slot per entry in `cores`.
    pub fn new(ops: O, cores: &[usize], cbo_count: usize, cpu_count: usize,
        pebs_period: u64) -> Self
    {
        let slots = cores.iter()
            .map(|&core| Monitor::new(core, cbo_count, cpu_count))
            .collect();
        Self { ops, slots, pebs_period }
    }

    pub fn capacity(&self) -> usize { self.slots.len() }
    pub fn slots(&self) -> &[Monitor<O::Ring>] { &self.slots }
    pub fn ops(&self) -> &O { &self.ops }
    pub fn ops_mut(&mut self) -> &mut O { &mut self.ops }

    pub fn slot(&self, idx: usize) -> Result<&Monitor<O::Ring>, RegistryError> {
        self.slots.get(idx).ok_or(RegistryError::InvalidSlot { slot: idx })
    }

    pub fn slot_mut(&mut self, idx: usize) -> Result<&mut Monitor<O::Ring>, RegistryError> {
        self.slots.get_mut(idx).ok_or(RegistryError::InvalidSlot { slot: idx })
    }

    pub fn find(&self, tgid: i32, tid: i32) -> Option<usize> {
        self.slots.iter().position(|m| m.matches(tgid, tid))
    }

    /// Number of slots in [`MonitorStatus::On`] or [`MonitorStatus::Off`].
    pub fn running(&self) -> usize {
        self.slots.iter().filter(|m| m.status.is_running()).count()
    }
}

impl<O: TargetOps> MonitorRegistry<O> {
    /// Bind a target to a free slot and pin it to that slot's core.
    pub fn attach(&mut self, tgid: i32, tid: i32, is_process: bool, region_count: u32)
        -> Result<usize, RegistryError>
    {
        if let Some(slot) = self.find(tgid, tid) {
            return Err(RegistryError::AlreadyAttached { tgid, tid, slot });
        }
        let idx = self.slots.iter()
            .position(|m| m.status == MonitorStatus::Disable)
            .ok_or(RegistryError::NoFreeSlot)?;

        let core = self.slots[idx].cpu_core;
        match self.ops.pin(tid, core) {
            Ok(()) => {},
            Err(Errno::ESRCH) => return Err(RegistryError::TargetGone { tid }),
            Err(errno) => {
                return Err(EmulError::Affinity { tid, core, errno }.into());
            },
        }

        let ring = if region_count >= 2 {
            Some(self.ops.open_ring(tid, self.pebs_period)?)
        } else {
            None
        };

        let mon = &mut self.slots[idx];
        mon.reset();
        mon.tgid = tgid;
        mon.tid = tid;
        mon.is_process = is_process;
        mon.status = MonitorStatus::On;
        mon.region_count = region_count;
        mon.snapshots.reset(if region_count >= 2 { region_count as usize } else { 0 });
        mon.ring = ring;

        tracing::info!(slot = idx, tgid, tid, core, is_process, region_count,
            "attached target");
        Ok(idx)
    }

    /// Record the address regions of a hybrid-memory target.
    pub fn set_regions(&mut self, idx: usize, regions: &[Region])
        -> Result<(), RegistryError>
    {
        let mon = self.slot_mut(idx)?;
        if mon.status != MonitorStatus::On {
            return Err(RegistryError::NotActive { slot: idx });
        }
        if regions.len() != mon.region_count as usize {
            return Err(RegistryError::RegionMismatch {
                slot: idx, expected: mon.region_count, got: regions.len(),
            });
        }
        mon.regions = regions.to_vec();
        for (j, r) in regions.iter().enumerate() {
            tracing::debug!(slot = idx, region = j, addr = r.addr, size = r.size,
                "set region");
        }
        Ok(())
    }

    /// Detach a target by (tgid, tid).
    pub fn detach(&mut self, tgid: i32, tid: i32) -> Result<TargetSummary, RegistryError> {
        let idx = self.find(tgid, tid).ok_or(RegistryError::NotFound { tgid, tid })?;
        self.detach_slot(idx)
    }

    /// Tear down a slot, print its summary and return it to
    /// [`MonitorStatus::Disable`].
    pub fn detach_slot(&mut self, idx: usize) -> Result<TargetSummary, RegistryError> {
        let mon = self.slot_mut(idx)?;
        if mon.status == MonitorStatus::Disable {
            return Err(RegistryError::NotActive { slot: idx });
        }
        mon.ring = None;
        if mon.end.is_none() {
            mon.end = Some(Instant::now());
        }
        let summary = TargetSummary {
            slot: idx,
            tgid: mon.tgid,
            tid: mon.tid,
            emulated: mon.elapsed(),
            total_delay: mon.total_delay,
            samples: mon.snapshots.after().samples.per_region.clone(),
        };
        tracing::info!(slot = idx, tgid = mon.tgid, tid = mon.tid,
            status = ?mon.status, total_delay = mon.total_delay, "detached target");
        println!("{}", summary);
        mon.reset();
        Ok(summary)
    }

    /// Detach every slot in a terminal state. Returns true if no target is
    /// left running afterwards.
    pub fn sweep_terminated(&mut self) -> bool {
        for idx in 0..self.slots.len() {
            if self.slots[idx].status.is_terminal() {
                // Terminal slots are never Disable.
                let _ = self.detach_slot(idx);
            }
        }
        self.running() == 0
    }
}

impl<O: TargetOps> MonitorRegistry<O> {
    fn apply_outcome(&mut self, idx: usize, outcome: SignalOutcome,
        delivered: MonitorStatus, what: &str)
    {
        let mon = &mut self.slots[idx];
        match outcome {
            SignalOutcome::Delivered => mon.status = delivered,
            SignalOutcome::AlreadyGone => {
                tracing::debug!(slot = idx, tgid = mon.tgid, tid = mon.tid, "{} target is gone", what);
                mon.status = MonitorStatus::Terminated;
                mon.end.get_or_insert_with(Instant::now);
            },
            SignalOutcome::PermissionDenied => {
                tracing::error!(slot = idx, tgid = mon.tgid, tid = mon.tid,
                    "no permission to {} target", what);
                mon.status = MonitorStatus::NoPermission;
            },
            SignalOutcome::OtherFailure(errno) => {
                tracing::warn!(slot = idx, tgid = mon.tgid, tid = mon.tid, %errno,
                    "couldn't {} target", what);
            },
        }
    }

    /// Stop the target in a slot.
    pub fn pause(&mut self, idx: usize) -> Result<SignalOutcome, RegistryError> {
        let mon = self.slot(idx)?;
        let (tgid, tid, is_process) = (mon.tgid, mon.tid, mon.is_process);
        let outcome = self.ops.stop(tgid, tid, is_process);
        self.apply_outcome(idx, outcome, MonitorStatus::Off, "stop");
        Ok(outcome)
    }

    /// Continue the target in a slot.
    pub fn resume(&mut self, idx: usize) -> Result<SignalOutcome, RegistryError> {
        let mon = self.slot(idx)?;
        let (tgid, tid) = (mon.tgid, mon.tid);
        let outcome = self.ops.resume(tgid, tid);
        self.apply_outcome(idx, outcome, MonitorStatus::On, "resume");
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::pebs::DecodeStatus;
    use crate::pebs::SampleRing;
    use crate::snapshot::SampleCounts;
    use std::collections::{BTreeMap, BTreeSet};

    /// A ring that attributes one sample to region 0 per pass.
    #[derive(Default)]
    pub(crate) struct FakeRing;
    impl SampleRing for FakeRing {
        fn drain(&mut self, _tid: i32, _regions: &[Region], counts: &mut SampleCounts)
            -> DecodeStatus
        {
            counts.per_region[0] += 1;
            counts.llc_miss += 10;
            counts.total = counts.per_region.iter().sum();
            DecodeStatus::Complete
        }
    }

    /// Records every operation; tids in `gone`/`denied` fail accordingly.
    #[derive(Default)]
    pub(crate) struct FakeOps {
        pub gone: BTreeSet<i32>,
        pub denied: BTreeSet<i32>,
        pub pinned: BTreeMap<i32, usize>,
        pub stops: Vec<i32>,
        pub resumes: Vec<i32>,
        pub rings: usize,
    }

    impl FakeOps {
        fn outcome(&self, tid: i32) -> SignalOutcome {
            if self.gone.contains(&tid) {
                SignalOutcome::AlreadyGone
            } else if self.denied.contains(&tid) {
                SignalOutcome::PermissionDenied
            } else {
                SignalOutcome::Delivered
            }
        }
    }

    impl TargetOps for FakeOps {
        type Ring = FakeRing;
        fn pin(&mut self, tid: i32, core: usize) -> Result<(), Errno> {
            if self.gone.contains(&tid) {
                return Err(Errno::ESRCH);
            }
            self.pinned.insert(tid, core);
            Ok(())
        }
        fn stop(&mut self, _tgid: i32, tid: i32, _is_process: bool) -> SignalOutcome {
            self.stops.push(tid);
            self.outcome(tid)
        }
        fn resume(&mut self, _tgid: i32, tid: i32) -> SignalOutcome {
            self.resumes.push(tid);
            self.outcome(tid)
        }
        fn open_ring(&mut self, _tid: i32, _period: u64) -> Result<FakeRing, EmulError> {
            self.rings += 1;
            Ok(FakeRing)
        }
    }

    fn registry(cores: &[usize]) -> MonitorRegistry<FakeOps> {
        MonitorRegistry::new(FakeOps::default(), cores, 2, 4, 1)
    }

    #[test]
    fn attach_pins_to_slot_core() {
        let mut reg = registry(&[2, 3]);
        assert_eq!(reg.attach(100, 100, true, 0).unwrap(), 0);
        assert_eq!(reg.attach(100, 101, false, 0).unwrap(), 1);
        assert_eq!(reg.ops().pinned[&100], 2);
        assert_eq!(reg.ops().pinned[&101], 3);
        assert_eq!(reg.running(), 2);
        assert!(!reg.slot(1).unwrap().is_process);
    }

    #[test]
    fn duplicate_attach_rejected() {
        let mut reg = registry(&[0, 1]);
        reg.attach(10, 11, false, 0).unwrap();
        assert!(matches!(reg.attach(10, 11, false, 0),
            Err(RegistryError::AlreadyAttached { slot: 0, .. })));
        assert_eq!(reg.running(), 1);
    }

    #[test]
    fn no_free_slot() {
        let mut reg = registry(&[0]);
        reg.attach(1, 1, true, 0).unwrap();
        assert!(matches!(reg.attach(2, 2, true, 0), Err(RegistryError::NoFreeSlot)));
    }

    #[test]
    fn attach_gone_target() {
        let mut reg = registry(&[0]);
        reg.ops_mut().gone.insert(5);
        assert!(matches!(reg.attach(5, 5, true, 0),
            Err(RegistryError::TargetGone { tid: 5 })));
        assert_eq!(reg.running(), 0);
    }

    #[test]
    fn cores_never_shared() {
        let mut reg = registry(&[4, 5, 6]);
        for tid in 1..=3 {
            reg.attach(1, tid, false, 0).unwrap();
        }
        reg.detach(1, 2).unwrap();
        reg.attach(1, 9, false, 0).unwrap();
        let cores: BTreeSet<usize> = reg.slots().iter()
            .filter(|m| m.status.is_running())
            .map(|m| m.cpu_core)
            .collect();
        assert_eq!(cores.len(), reg.running());
        assert_eq!(reg.ops().pinned[&9], 5);
    }

    #[test]
    fn detach_unknown() {
        let mut reg = registry(&[0, 1]);
        reg.attach(1, 1, true, 0).unwrap();
        assert!(matches!(reg.detach(1, 2), Err(RegistryError::NotFound { tgid: 1, tid: 2 })));
        assert_eq!(reg.running(), 1);
        assert!(reg.find(1, 1).is_some());
    }

    #[test]
    fn detach_reports_summary() {
        let mut reg = registry(&[0]);
        reg.attach(7, 8, false, 2).unwrap();
        reg.slot_mut(0).unwrap().total_delay = 0.25;
        reg.slot_mut(0).unwrap().snapshots.after_mut().samples.per_region[1] = 3;
        let s = reg.detach(7, 8).unwrap();
        assert_eq!(s.total_delay, 0.25);
        assert_eq!(s.samples, vec![0, 3]);
        assert_eq!(reg.slot(0).unwrap().status, MonitorStatus::Disable);
        assert!(reg.slot(0).unwrap().ring.is_none());
    }

    #[test]
    fn hybrid_attach_opens_ring() {
        let mut reg = registry(&[0, 1]);
        reg.attach(1, 1, true, 0).unwrap();
        assert_eq!(reg.ops().rings, 0);
        let idx = reg.attach(2, 2, true, 2).unwrap();
        assert_eq!(reg.ops().rings, 1);
        assert!(reg.slot(idx).unwrap().is_hybrid());
        assert_eq!(reg.slot(idx).unwrap().snapshots.after().samples.per_region.len(), 2);
    }

    #[test]
    fn set_regions_checks_count() {
        let mut reg = registry(&[0]);
        let idx = reg.attach(1, 1, true, 2).unwrap();
        let r = [Region::new(0, 0x1000), Region::new(0x1000, 0x1000)];
        assert!(matches!(reg.set_regions(idx, &r[..1]),
            Err(RegistryError::RegionMismatch { expected: 2, got: 1, .. })));
        reg.set_regions(idx, &r).unwrap();
        assert_eq!(reg.slot(idx).unwrap().regions, r.to_vec());

        reg.pause(idx).unwrap();
        assert!(matches!(reg.set_regions(idx, &r), Err(RegistryError::NotActive { .. })));
    }

    #[test]
    fn pause_and_resume_outcomes() {
        let mut reg = registry(&[0, 1, 2]);
        reg.attach(1, 1, true, 0).unwrap();
        reg.attach(2, 2, true, 0).unwrap();
        reg.attach(3, 3, true, 0).unwrap();

        assert_eq!(reg.pause(0).unwrap(), SignalOutcome::Delivered);
        assert_eq!(reg.slot(0).unwrap().status, MonitorStatus::Off);
        assert_eq!(reg.resume(0).unwrap(), SignalOutcome::Delivered);
        assert_eq!(reg.slot(0).unwrap().status, MonitorStatus::On);

        reg.ops_mut().gone.insert(2);
        assert_eq!(reg.pause(1).unwrap(), SignalOutcome::AlreadyGone);
        assert_eq!(reg.slot(1).unwrap().status, MonitorStatus::Terminated);

        reg.ops_mut().denied.insert(3);
        assert_eq!(reg.pause(2).unwrap(), SignalOutcome::PermissionDenied);
        assert_eq!(reg.slot(2).unwrap().status, MonitorStatus::NoPermission);
    }

    #[test]
    fn sweep_reaps_terminal_slots() {
        let mut reg = registry(&[0, 1]);
        reg.attach(1, 1, true, 0).unwrap();
        reg.attach(2, 2, true, 0).unwrap();
        reg.slot_mut(0).unwrap().status = MonitorStatus::Terminated;
        assert!(!reg.sweep_terminated());
        assert_eq!(reg.slot(0).unwrap().status, MonitorStatus::Disable);
        reg.slot_mut(1).unwrap().status = MonitorStatus::NoPermission;
        assert!(reg.sweep_terminated());
        assert_eq!(reg.running(), 0);
    }

    #[test]
    fn invalid_slot() {
        let mut reg = registry(&[0]);
        assert!(matches!(reg.pause(3), Err(RegistryError::InvalidSlot { slot: 3 })));
        assert!(matches!(reg.detach_slot(0), Err(RegistryError::NotActive { slot: 0 })));
    }
}
