//! Launching the initial target program.

use std::path::Path;
use std::process::Command;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::EmulError;

extern "C" fn ignore_child(_: libc::c_int) {}

/// Have the kernel reap our children so that exited targets never linger
/// as zombies (a zombie still accepts signals, and would look alive).
pub fn reap_children_automatically() -> Result<(), EmulError> {
    let action = SigAction::new(
        SigHandler::Handler(ignore_child),
        SaFlags::SA_NOCLDWAIT | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }
        .map(drop)
        .map_err(EmulError::Signal)
}

/// Start `program` with `args` and return its pid.
pub fn spawn_target(program: &Path, args: &[String]) -> Result<i32, EmulError> {
    let child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|source| EmulError::Launch {
            program: program.display().to_string(),
            source,
        })?;
    let pid = child.id() as i32;
    tracing::info!(pid, program = %program.display(), "launched target");
    Ok(pid)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spawn_missing_program() {
        let res = spawn_target(Path::new("/nonexistent/mesmeric-target"), &[]);
        assert!(matches!(res, Err(EmulError::Launch { .. })));
    }

    #[test]
    fn spawn_reports_pid() {
        let pid = spawn_target(Path::new("/bin/sh"), &["-c".to_string(), "exit 0".to_string()])
            .unwrap();
        assert!(pid > 0);
    }
}
