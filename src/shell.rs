//! Sandboxed shell execution.
//!
//! Forks `/bin/sh -c <cmdline>`, captures combined stdout+stderr over a
//! tethered `socketpair`, and bounds the whole thing by wall-clock time
//! two ways: `SO_RCVTIMEO` on the parent's read, and `alarm()` in the
//! child so a wedged shell still dies even if nothing is reading from it.
//! If the parent ever goes away, the child's copy of the socket is armed
//! to deliver `SIGKILL` to itself on that event, so an orphaned shell
//! can't outlive its supervisor. Mirrors `worker.c`'s `handle_shell`.

use crate::codec;
use crate::signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{close, dup2, fork, ForkResult};
use std::ffi::CString;
use std::os::fd::{IntoRawFd, RawFd};
use std::time::Duration;
use thiserror::Error;

const SHELL_BUFSIZ: usize = 1024 * 1024;
const SHELL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("socketpair failed: {0}")]
    Socket(nix::Error),
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("timed out waiting for shell output")]
    Timeout,
    #[error("failed to configure capture socket: {0}")]
    Setup(std::io::Error),
}

pub struct ShellOutcome {
    pub b64_deflated_output: String,
}

/// Run `cmdline` through `/bin/sh -c`, returning its combined stdout and
/// stderr, deflated then base64 encoded.
pub fn run_shell(cmdline: &str) -> Result<ShellOutcome, ShellError> {
    let (ours, theirs) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .map_err(ShellError::Socket)?;
    let ours: RawFd = ours.into_raw_fd();
    let theirs: RawFd = theirs.into_raw_fd();

    if let Err(e) = set_recv_timeout(ours, SHELL_TIMEOUT) {
        let _ = close(ours);
        let _ = close(theirs);
        return Err(e);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            run_in_child(ours, theirs, cmdline);
            // run_in_child only returns on setup failure; execv never does.
            unsafe { libc::_exit(1) };
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = close(theirs);
            let outcome = read_output(ours, child);
            let _ = close(ours);
            outcome
        }
        Err(e) => {
            let _ = close(ours);
            let _ = close(theirs);
            Err(ShellError::Fork(e))
        }
    }
}

fn set_recv_timeout(fd: RawFd, timeout: Duration) -> Result<(), ShellError> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            std::ptr::addr_of!(tv).cast(),
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ShellError::Setup(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn read_output(fd: RawFd, child: nix::unistd::Pid) -> Result<ShellOutcome, ShellError> {
    let mut buf = vec![0u8; SHELL_BUFSIZ];
    let mut len = 0usize;
    let mut timed_out = false;

    loop {
        let n = unsafe {
            libc::recv(
                fd,
                buf[len..].as_mut_ptr().cast(),
                SHELL_BUFSIZ - len,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) {
                timed_out = true;
            }
            break;
        }
        if n == 0 {
            break;
        }
        len += n as usize;
        if len >= SHELL_BUFSIZ {
            break;
        }
    }

    // The supervisor's signal loop owns the authoritative reap; this is
    // just best-effort cleanup of an already-exited child.
    let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));

    if timed_out {
        return Err(ShellError::Timeout);
    }

    buf.truncate(len);
    let packed = codec::deflate(&buf);
    Ok(ShellOutcome { b64_deflated_output: codec::b64_encode(&packed) })
}

/// Runs in the forked child. Returns only on setup failure; on success it
/// `exec`s and never returns.
fn run_in_child(ours: RawFd, theirs: RawFd, cmdline: &str) {
    let _ = close(ours);
    if dup2(theirs, libc::STDOUT_FILENO).is_err() {
        return;
    }
    if theirs != libc::STDOUT_FILENO {
        let _ = close(theirs);
    }
    if dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO).is_err() {
        return;
    }

    // Tethered liveness: if the parent closes its end, this socket
    // becomes readable-at-EOF, and the signal handler below is SIGKILL —
    // there is no handler to run, the kernel just kills us.
    if signal::set_async_signal(libc::STDOUT_FILENO, libc::SIGKILL).is_err() {
        return;
    }

    unsafe {
        libc::signal(libc::SIGALRM, libc::SIG_DFL);
        libc::alarm(SHELL_TIMEOUT.as_secs() as libc::c_uint);
    }

    let Ok(shell) = CString::new("/bin/sh") else { return };
    let Ok(dash_c) = CString::new("-c") else { return };
    let Ok(cmd) = CString::new(cmdline) else { return };
    let _ = nix::unistd::execv(&shell, &[&shell, &dash_c, &cmd]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_simple_command() {
        let outcome = run_shell("echo hi").unwrap();
        let packed = codec::b64_decode(&outcome.b64_deflated_output).unwrap();
        let output = codec::inflate(&packed).unwrap();
        assert_eq!(output, b"hi\n");
    }

    #[test]
    fn captures_stderr_too() {
        let outcome = run_shell("echo err 1>&2").unwrap();
        let packed = codec::b64_decode(&outcome.b64_deflated_output).unwrap();
        let output = codec::inflate(&packed).unwrap();
        assert_eq!(output, b"err\n");
    }

    #[test]
    fn nonexistent_binary_still_returns_a_result() {
        let outcome = run_shell("/does/not/exist 2>/dev/null").unwrap();
        let packed = codec::b64_decode(&outcome.b64_deflated_output).unwrap();
        assert!(codec::inflate(&packed).is_ok());
    }
}
