//! Pausing, resuming and pinning target threads.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::EmulError;
use crate::pebs::{PebsRing, RingDecoder, SampleRing};
use crate::util::HostEnv;

/// Result of delivering a control signal to a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,

    /// ESRCH
    AlreadyGone,

    /// EPERM
    PermissionDenied,

    OtherFailure(Errno),
}

impl From<Result<(), Errno>> for SignalOutcome {
    fn from(res: Result<(), Errno>) -> Self {
        match res {
            Ok(()) => Self::Delivered,
            Err(Errno::ESRCH) => Self::AlreadyGone,
            Err(Errno::EPERM) => Self::PermissionDenied,
            Err(e) => Self::OtherFailure(e),
        }
    }
}

/// Operations performed on monitored targets.
pub trait TargetOps {
    type Ring: SampleRing;

    /// Bind `tid` to `core`.
    fn pin(&mut self, tid: i32, core: usize) -> Result<(), Errno>;

    /// Stop a whole process, or only the thread `tid`.
    fn stop(&mut self, tgid: i32, tid: i32, is_process: bool) -> SignalOutcome;

    fn resume(&mut self, tgid: i32, tid: i32) -> SignalOutcome;

    /// Start sampling LLC misses of `tid`.
    fn open_ring(&mut self, tid: i32, period: u64) -> Result<Self::Ring, EmulError>;
}

fn tgkill(tgid: i32, tid: i32, sig: Signal) -> Result<(), Errno> {
    let ret = unsafe {
        libc::syscall(libc::SYS_tgkill, tgid, tid, sig as libc::c_int)
    };
    Errno::result(ret).map(drop)
}

/// [`TargetOps`] backed by real signals, affinity and sampling counters.
#[derive(Default)]
pub struct OsOps;

impl TargetOps for OsOps {
    type Ring = RingDecoder<PebsRing>;

    fn pin(&mut self, tid: i32, core: usize) -> Result<(), Errno> {
        HostEnv::pin_to_core(tid, core)
    }

    fn stop(&mut self, tgid: i32, tid: i32, is_process: bool) -> SignalOutcome {
        if is_process {
            kill(Pid::from_raw(tid), Signal::SIGSTOP).into()
        } else {
            // NOTE: SIGSTOP always stops the whole thread group, so single
            // threads are parked with SIGUSR1 instead.
            tgkill(tgid, tid, Signal::SIGUSR1).into()
        }
    }

    fn resume(&mut self, tgid: i32, tid: i32) -> SignalOutcome {
        tgkill(tgid, tid, Signal::SIGCONT).into()
    }

    fn open_ring(&mut self, tid: i32, period: u64) -> Result<Self::Ring, EmulError> {
        Ok(RingDecoder::new(PebsRing::open(tid, period)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outcome_from_errno() {
        assert_eq!(SignalOutcome::from(Ok(())), SignalOutcome::Delivered);
        assert_eq!(SignalOutcome::from(Err(Errno::ESRCH)), SignalOutcome::AlreadyGone);
        assert_eq!(SignalOutcome::from(Err(Errno::EPERM)), SignalOutcome::PermissionDenied);
        assert_eq!(SignalOutcome::from(Err(Errno::EINVAL)),
            SignalOutcome::OtherFailure(Errno::EINVAL));
    }

    #[test]
    fn signal_missing_thread() {
        // Our own tgid with a tid that can't exist.
        let tgid = std::process::id() as i32;
        assert_eq!(OsOps.resume(tgid, i32::MAX), SignalOutcome::AlreadyGone);
    }
}
