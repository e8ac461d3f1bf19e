//! The epoch loop.
//!
//! Every epoch each running target is stopped, its counters are sampled
//! and the delay it would have suffered on the emulated memory is turned
//! into time it must stay stopped. Targets are resumed once they have been
//! held for at least that long.

pub mod config;

pub use config::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::delay::{calibrate, DelayModel};
use crate::error::{EmulError, RegistryError};
use crate::monitor::{MonitorRegistry, MonitorStatus, Region, SignalOutcome, Squabble,
    TargetOps};
use crate::pebs::{DecodeStatus, SampleRing};
use crate::pmu::CounterSource;
use crate::protocol::{max_message_len, LifecycleMsg, Opcode, Recv, Transport};
use crate::topology::Topology;
use crate::util::HostEnv;

pub struct Emulator<O: TargetOps, C: CounterSource, T: Transport> {
    cfg: EmulatorConfig,
    model: DelayModel,
    registry: MonitorRegistry<O>,
    counters: C,
    transport: T,

    /// Time spent stopping, measuring and signalling since the last delay
    /// was charged. Subtracted from the next delay.
    overhead: Duration,

    recv_buf: Vec<u8>,
    shutdown: Arc<AtomicBool>,
}

impl<O: TargetOps, C: CounterSource, T: Transport> Emulator<O, C, T> {
    pub fn new(cfg: EmulatorConfig, topo: &Topology, ops: O, counters: C, transport: T)
        -> Result<Self, EmulError>
    {
        cfg.validate()?;
        let cores = cfg.select_cores(topo.online_cpus)?;
        tracing::info!(slots = cores.len(), ?cores, "monitor slots");
        let registry = MonitorRegistry::new(ops, &cores, topo.cbo_count,
            topo.online_cpus, cfg.pebs_period);
        let model = cfg.delay_model(topo.cpu_mhz);
        // One spare byte so that oversized datagrams aren't silently
        // truncated to a valid length.
        let recv_buf = vec![0u8; max_message_len(cfg.tiers.len()) + 1];
        Ok(Self {
            cfg,
            model,
            registry,
            counters,
            transport,
            overhead: Duration::ZERO,
            recv_buf,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &EmulatorConfig { &self.cfg }
    pub fn model(&self) -> &DelayModel { &self.model }
    pub fn registry(&self) -> &MonitorRegistry<O> { &self.registry }
    pub fn registry_mut(&mut self) -> &mut MonitorRegistry<O> { &mut self.registry }
    pub fn counters_mut(&mut self) -> &mut C { &mut self.counters }

    /// Raising this flag makes [`Emulator::run`] return after the current
    /// epoch.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }
}

impl<O: TargetOps, C: CounterSource, T: Transport> Emulator<O, C, T> {
    /// Start monitoring a target and take its first snapshot.
    ///
    /// Returns `None` if the target was skipped: it's already attached or
    /// it exited before it could be pinned.
    pub fn attach_target(&mut self, tgid: i32, tid: i32, is_process: bool,
        region_count: u32, regions: &[Region]) -> Result<Option<usize>, EmulError>
    {
        let idx = match self.registry.attach(tgid, tid, is_process, region_count) {
            Ok(idx) => idx,
            Err(e @ RegistryError::AlreadyAttached { .. }) => {
                tracing::warn!("{}", e);
                return Ok(None);
            },
            Err(RegistryError::TargetGone { tid }) => {
                tracing::debug!(tgid, tid, "target exited before attach");
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };
        if region_count >= 2 {
            self.registry.set_regions(idx, regions)?;
        }
        self.baseline(idx)?;
        Ok(Some(idx))
    }

    /// Take the "before" snapshot of a freshly attached slot.
    fn baseline(&mut self, idx: usize) -> Result<(), EmulError> {
        self.registry.pause(idx)?;
        let mon = self.registry.slot_mut(idx)?;
        if let Err(e) = self.counters.read_into(mon.snapshots.before_mut()) {
            tracing::warn!(slot = idx, error = %e, "couldn't read initial counters");
        }
        mon.start = Some(Instant::now());
        if mon.status == MonitorStatus::Off {
            self.registry.resume(idx)?;
        }
        Ok(())
    }

    /// Act on a single lifecycle notification.
    pub fn handle(&mut self, msg: LifecycleMsg) -> Result<(), EmulError> {
        match msg.opcode {
            Opcode::ProcessCreate | Opcode::ThreadCreate => {
                let is_process = msg.opcode == Opcode::ProcessCreate;
                self.attach_target(msg.tgid, msg.tid, is_process, msg.region_count,
                    &msg.regions)?;
            },
            Opcode::ThreadExit => {
                if let Err(e) = self.registry.detach(msg.tgid, msg.tid) {
                    tracing::debug!("exit notification: {}", e);
                }
            },
            Opcode::Unknown(op) => {
                tracing::warn!(tgid = msg.tgid, tid = msg.tid, op, "unknown opcode");
            },
        }
        Ok(())
    }

    /// Handle every pending notification. Returns how many were handled.
    pub fn drain_notifications(&mut self) -> Result<usize, EmulError> {
        let tiers = self.cfg.tiers.len();
        let mut handled = 0;
        loop {
            let n = match self.transport.recv(&mut self.recv_buf)? {
                Recv::Empty => break,
                Recv::Datagram(n) => n,
            };
            let msg = LifecycleMsg::decode(&self.recv_buf[..n], tiers)?;
            tracing::debug!(tgid = msg.tgid, tid = msg.tid, opcode = ?msg.opcode,
                regions = msg.region_count, "notification");
            self.handle(msg)?;
            handled += 1;
        }
        Ok(handled)
    }
}

impl<O: TargetOps, C: CounterSource, T: Transport> Emulator<O, C, T> {
    /// Measure a running target and charge it the delay for this epoch.
    fn step_on(&mut self, idx: usize) -> Result<(), RegistryError> {
        let started = Instant::now();
        if self.registry.pause(idx)? != SignalOutcome::Delivered {
            return Ok(());
        }

        let mon = self.registry.slot_mut(idx)?;
        if let Err(e) = self.counters.read_into(mon.snapshots.after_mut()) {
            tracing::warn!(slot = idx, error = %e, "couldn't read counters");
            self.overhead += started.elapsed();
            self.registry.resume(idx)?;
            return Ok(());
        }

        let hybrid = mon.is_hybrid();
        if hybrid {
            if let Some(ring) = mon.ring.as_mut() {
                let status = ring.drain(mon.tid, &mon.regions,
                    &mut mon.snapshots.after_mut().samples);
                if status != DecodeStatus::Complete {
                    tracing::warn!(slot = idx, tid = mon.tid, ?status, "partial sample pass");
                }
            }
        }

        let est = self.model.compute(&mon.snapshots, mon.cpu_core, hybrid);
        self.overhead += started.elapsed();
        let delay = calibrate(est.delay_ns, self.overhead);
        tracing::trace!(slot = idx, delay_ns = est.delay_ns, overhead = ?self.overhead,
            calibrated = delay, miss = est.counters.miss, stall = est.counters.stall,
            "epoch");
        self.overhead = Duration::ZERO;

        mon.total_delay += delay as f64 / 1e9;
        mon.injected += Duration::from_nanos(delay);
        if hybrid {
            mon.snapshots.carry_samples();
        }
        mon.snapshots.swap();

        if delay == 0 {
            mon.clear_wait();
            self.registry.resume(idx)?;
        }
        Ok(())
    }

    /// Account the last sleep to a stopped target; resume it once it has
    /// been held for its whole delay.
    fn step_off(&mut self, idx: usize, slept: Duration) -> Result<(), RegistryError> {
        let started = Instant::now();
        if self.registry.slot_mut(idx)?.accrue_wait(slept) {
            self.registry.resume(idx)?;
        }
        self.overhead += started.elapsed();
        Ok(())
    }

    /// Advance every attached slot by one epoch. `slept` is the time that
    /// passed since the previous epoch started.
    pub fn step_slots(&mut self, slept: Duration) -> Result<(), RegistryError> {
        let epoch = self.cfg.interval;
        let limit = self.cfg.squabble_limit();
        for idx in 0..self.registry.capacity() {
            match self.registry.slot(idx)?.status {
                MonitorStatus::On => self.step_on(idx)?,
                MonitorStatus::Off => self.step_off(idx, slept)?,
                _ => continue,
            }
            match self.registry.slot_mut(idx)?.settle_squabble(epoch, limit) {
                Squabble::Keep => {},
                Squabble::Forgive => {
                    self.registry.resume(idx)?;
                },
                Squabble::Extend => {
                    tracing::trace!(slot = idx, "residual delay carried into the wait");
                },
            }
        }
        Ok(())
    }

    /// Step all slots and reap the ones that ended. Returns true if no
    /// target is left.
    pub fn step(&mut self, slept: Duration) -> Result<bool, EmulError> {
        self.step_slots(slept)?;
        Ok(self.registry.sweep_terminated())
    }

    /// Run epochs until the shutdown flag is raised, or (in oneshot mode)
    /// until every target has terminated. Targets are released before
    /// returning, also on error.
    pub fn run(&mut self) -> Result<(), EmulError> {
        let res = self.run_epochs();
        self.shutdown();
        res
    }

    fn run_epochs(&mut self) -> Result<(), EmulError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested");
                return Ok(());
            }
            let epoch_start = Instant::now();
            self.drain_notifications()?;
            HostEnv::sleep_full(self.cfg.interval).map_err(EmulError::Sleep)?;
            let idle = self.step(epoch_start.elapsed())?;
            if idle && self.cfg.oneshot {
                tracing::info!("all targets terminated");
                return Ok(());
            }
        }
    }

    /// Resume every stopped target and detach all slots.
    pub fn shutdown(&mut self) {
        for idx in 0..self.registry.capacity() {
            let status = match self.registry.slot(idx) {
                Ok(mon) => mon.status,
                Err(_) => continue,
            };
            if status == MonitorStatus::Off {
                let _ = self.registry.resume(idx);
            }
            if status != MonitorStatus::Disable {
                let _ = self.registry.detach_slot(idx);
            }
        }
    }
}
