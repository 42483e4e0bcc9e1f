// Stage processes get SIGKILL when the server dies, so a crashed server does not
// leave pipelines running. Linux only; elsewhere this is a no-op.

use tokio::process::Command;

#[cfg(target_os = "linux")]
pub(crate) fn kill_on_parent_death(command: &mut Command) {
    let parent_pid = unsafe { libc::getpid() };
    // SAFETY: the hook runs between fork and exec and only makes
    // async-signal-safe calls.
    unsafe {
        command.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // The parent may have died between fork and prctl.
            if libc::getppid() != parent_pid {
                libc::_exit(1);
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn kill_on_parent_death(_command: &mut Command) {}
