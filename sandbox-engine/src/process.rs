use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

/// Kill the entire process group led by `pid` via `killpg(SIGKILL)`.
///
/// Requires the leader to have been spawned with `process_group(0)` so that
/// its PGID equals its PID. No-op if the group is already gone or the PID
/// cannot be represented as `i32`.
pub(crate) fn kill_process_group(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Shell-style exit code: the status code, or `128 + signal` when killed.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

pub(crate) fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
