//! Descriptor plumbing shared by the executor and the registries.

use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

/// Create an anonymous pipe, returning `(read_end, write_end)`. Both ends are
/// close-on-exec so only the stage they are handed to ever sees them.
pub(crate) fn anon_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(&read)?;
        set_cloexec(&write)?;
    }

    Ok((read, write))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Errors worth retrying: the kernel is temporarily out of processes,
/// descriptors or memory, or the call was interrupted.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE)
            | Some(libc::EINTR)
    )
}

/// Run `op` up to `attempts` times, sleeping `delay` between transient
/// failures. Non-transient errors are returned immediately.
pub(crate) async fn with_retries<T>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                warn!(what, attempt, error = %err, "transient OS failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read `reader` to EOF on the blocking pool and throw the bytes away, so a
/// writer on the other end finishes instead of blocking on a full pipe.
pub(crate) fn discard_in_background(reader: OwnedFd) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        // No runtime to drain on; closing the read end still unblocks the
        // writer (it gets EPIPE).
        drop(reader);
        return;
    };
    handle.spawn_blocking(move || {
        let mut file = File::from(reader);
        match io::copy(&mut file, &mut io::sink()) {
            Ok(bytes) => debug!(bytes, "discarded unread pipe contents"),
            Err(err) => debug!(error = %err, "failed to drain pipe"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Write;

    #[test]
    fn anon_pipe_carries_bytes_and_reports_eof() {
        let (read, write) = anon_pipe().expect("pipe");
        let mut writer = File::from(write);
        writer.write_all(b"hello").expect("write");
        drop(writer);

        let mut out = String::new();
        File::from(read).read_to_string(&mut out).expect("read");
        assert_eq!(out, "hello");
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn anon_pipe_ends_are_close_on_exec() {
        use std::os::fd::AsRawFd;

        let (read, write) = anon_pipe().expect("pipe");
        for fd in [&read, &write] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[tokio::test]
    async fn with_retries_gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let result: io::Result<()> = with_retries("test", 3, Duration::from_millis(1), || {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn with_retries_does_not_retry_permanent_errors() {
        let mut calls = 0;
        let result: io::Result<()> = with_retries("test", 3, Duration::from_millis(1), || {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
