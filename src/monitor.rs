//! Per-target monitoring state.

pub mod registry;
pub mod signal;

pub use registry::*;
pub use signal::*;

use std::time::{Duration, Instant};

use crate::snapshot::SnapshotPair;

/// Lifecycle state of a [`Monitor`] slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Free.
    #[default]
    Disable,

    /// Target is running.
    On,

    /// Target is paused while delay is being injected.
    Off,

    /// Target no longer exists.
    Terminated,

    /// We aren't allowed to signal the target.
    NoPermission,
}

impl MonitorStatus {
    /// Slots in these states are reaped by the terminal-state sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::NoPermission)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::On | Self::Off)
    }
}

/// A memory region (base address, size) of a hybrid-memory target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub size: u64,
}

impl Region {
    pub const fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }
}

/// What to do with the residue of a wait that is shorter than an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Squabble {
    /// Nothing to do; keep waiting.
    Keep,

    /// The residue was added to the squabble accumulator and forgiven;
    /// the target should be resumed now.
    Forgive,

    /// The accumulated residue was folded back into the injected delay.
    Extend,
}

/// One monitored target, bound to a dedicated core.
pub struct Monitor<R> {
    pub tgid: i32,
    pub tid: i32,
    pub is_process: bool,

    /// Core the target is pinned to. Fixed for the lifetime of the slot.
    pub cpu_core: usize,

    pub status: MonitorStatus,
    pub snapshots: SnapshotPair,

    /// Delay to inject before the target may run again.
    pub injected: Duration,

    /// Time spent paused so far.
    pub wasted: Duration,

    /// Residue of waits shorter than an epoch.
    pub squabble: Duration,

    /// Total injected delay, in seconds.
    pub total_delay: f64,

    pub start: Option<Instant>,
    pub end: Option<Instant>,

    /// Number of regions declared at attach time.
    pub region_count: u32,
    pub regions: Vec<Region>,
    pub ring: Option<R>,
}

impl<R> Monitor<R> {
    pub fn new(cpu_core: usize, cbo_count: usize, cpu_count: usize) -> Self {
        Self {
            tgid: 0,
            tid: 0,
            is_process: false,
            cpu_core,
            status: MonitorStatus::Disable,
            snapshots: SnapshotPair::new(cbo_count, cpu_count),
            injected: Duration::ZERO,
            wasted: Duration::ZERO,
            squabble: Duration::ZERO,
            total_delay: 0.0,
            start: None,
            end: None,
            region_count: 0,
            regions: Vec::new(),
            ring: None,
        }
    }

    /// Return the slot to [`MonitorStatus::Disable`], keeping its core.
    pub fn reset(&mut self) {
        self.tgid = 0;
        self.tid = 0;
        self.is_process = false;
        self.status = MonitorStatus::Disable;
        self.snapshots.reset(0);
        self.injected = Duration::ZERO;
        self.wasted = Duration::ZERO;
        self.squabble = Duration::ZERO;
        self.total_delay = 0.0;
        self.start = None;
        self.end = None;
        self.region_count = 0;
        self.regions.clear();
        self.ring = None;
    }

    pub fn is_hybrid(&self) -> bool {
        self.region_count >= 2
    }

    pub fn matches(&self, tgid: i32, tid: i32) -> bool {
        self.status != MonitorStatus::Disable && self.tgid == tgid && self.tid == tid
    }

    pub fn clear_wait(&mut self) {
        self.injected = Duration::ZERO;
        self.wasted = Duration::ZERO;
    }

    /// Wall time between attach and detach (or now, if still attached).
    pub fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(s), Some(e)) => e.saturating_duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

impl<R> Monitor<R> {
    /// Account `slept` as time spent paused. Returns true (and clears the
    /// accumulators) once the paused time has caught up with the delay.
    ///
    /// `Duration` is normalized, so this is the seconds-then-nanoseconds
    /// comparison; a wait can overshoot by up to one epoch.
    pub fn accrue_wait(&mut self, slept: Duration) -> bool {
        self.wasted += slept;
        if self.wasted >= self.injected {
            self.clear_wait();
            return true;
        }
        false
    }

    /// Deal with a remaining wait shorter than one `epoch`.
    ///
    /// The remainder is moved into the squabble accumulator. While the
    /// accumulator stays under `limit` the remainder is forgiven and the
    /// target can resume; once it reaches `limit` it is added back onto the
    /// injected delay.
    pub fn settle_squabble(&mut self, epoch: Duration, limit: Duration) -> Squabble {
        if self.status != MonitorStatus::Off || self.injected.is_zero() {
            return Squabble::Keep;
        }
        let remaining = self.injected.saturating_sub(self.wasted);
        if self.wasted.as_secs() < epoch.as_secs() || remaining >= epoch {
            return Squabble::Keep;
        }
        self.squabble += remaining;
        if self.squabble < limit {
            self.clear_wait();
            Squabble::Forgive
        } else {
            self.injected += self.squabble;
            self.squabble = Duration::ZERO;
            Squabble::Extend
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ms(n: u64) -> Duration { Duration::from_millis(n) }

    fn paused(injected: Duration) -> Monitor<()> {
        let mut m = Monitor::new(0, 1, 1);
        m.status = MonitorStatus::Off;
        m.injected = injected;
        m
    }

    #[test]
    fn catch_up_overshoots_to_epoch() {
        let mut m = paused(ms(45));
        assert!(!m.accrue_wait(ms(20)));
        assert!(!m.accrue_wait(ms(20)));
        assert_eq!(m.wasted, ms(40));
        assert!(m.accrue_wait(ms(20)));
        assert_eq!(m.injected, Duration::ZERO);
        assert_eq!(m.wasted, Duration::ZERO);
    }

    #[test]
    fn catch_up_exact() {
        let mut m = paused(ms(40));
        assert!(!m.accrue_wait(ms(20)));
        assert!(m.accrue_wait(ms(20)));
    }

    #[test]
    fn catch_up_across_seconds() {
        let mut m = paused(Duration::new(1, 10_000_000));
        m.wasted = Duration::new(0, 999_000_000);
        assert!(!m.accrue_wait(ms(5)));
        assert!(m.accrue_wait(ms(10)));
    }

    #[test]
    fn squabble_keeps_long_waits() {
        let mut m = paused(ms(45));
        assert_eq!(m.settle_squabble(ms(20), ms(20)), Squabble::Keep);
        m.wasted = ms(20);
        assert_eq!(m.settle_squabble(ms(20), ms(20)), Squabble::Keep);
        assert_eq!(m.squabble, Duration::ZERO);
    }

    #[test]
    fn squabble_forgives_short_residue() {
        let mut m = paused(ms(45));
        m.wasted = ms(40);
        assert_eq!(m.settle_squabble(ms(20), ms(20)), Squabble::Forgive);
        assert_eq!(m.squabble, ms(5));
        assert!(m.injected.is_zero());
        assert!(m.wasted.is_zero());
    }

    #[test]
    fn squabble_extends_once_over_limit() {
        let mut m = paused(ms(45));
        m.squabble = ms(18);
        m.wasted = ms(40);
        assert_eq!(m.settle_squabble(ms(20), ms(20)), Squabble::Extend);
        assert_eq!(m.injected, ms(45) + ms(23));
        assert_eq!(m.wasted, ms(40));
        assert!(m.squabble.is_zero());
    }

    #[test]
    fn squabble_ignores_running_slots() {
        let mut m = paused(ms(5));
        m.status = MonitorStatus::On;
        assert_eq!(m.settle_squabble(ms(20), ms(20)), Squabble::Keep);
    }

    #[test]
    fn region_bounds() {
        let r = Region::new(0x1000, 0x100);
        assert!(r.contains(0x1000));
        assert!(r.contains(0x10ff));
        assert!(!r.contains(0x1100));
        assert!(!r.contains(0xfff));
        assert!(Region::new(u64::MAX - 1, 16).contains(u64::MAX));
    }

    #[test]
    fn reset_keeps_core() {
        let mut m: Monitor<()> = Monitor::new(3, 2, 4);
        m.tgid = 10;
        m.tid = 11;
        m.status = MonitorStatus::Terminated;
        m.region_count = 2;
        m.total_delay = 1.5;
        m.reset();
        assert_eq!(m.cpu_core, 3);
        assert_eq!(m.status, MonitorStatus::Disable);
        assert!(!m.matches(10, 11));
        assert_eq!(m.total_delay, 0.0);
        assert_eq!(m.snapshots.after().cores.len(), 4);
    }
}
