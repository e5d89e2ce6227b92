//! Realtime-signal helpers.
//!
//! Two things live here that `nix` doesn't give us cleanly: the Linux
//! `F_SETFL(O_ASYNC)` + `F_SETSIG` + `F_SETOWN` combo that turns socket
//! activity into a queued, numbered realtime signal, and a `sigset_t`
//! wrapper sized for arbitrary realtime signal numbers (`nix::sys::signal::
//! Signal` only enumerates the fixed, non-realtime set). Grounded in
//! `client/signal.c`'s `yodi_setsig` and the sigset bootstrapping repeated
//! at the top of `client.c`, `worker.c`, and `watchdog.c` in the original
//! source.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal setup failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SignalError>;

fn last_err() -> SignalError {
    SignalError::Io(io::Error::last_os_error())
}

/// Configure `fd` for signal-driven I/O: activity on it raises realtime
/// signal `sig`, delivered with queued `siginfo` to the calling process.
/// Linux-only.
pub fn set_async_signal(fd: RawFd, sig: libc::c_int) -> Result<()> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 {
            return Err(last_err());
        }
        if libc::fcntl(fd, libc::F_SETFL, fl | libc::O_ASYNC) < 0 {
            return Err(last_err());
        }
        if libc::fcntl(fd, libc::F_SETSIG, sig) < 0 {
            return Err(last_err());
        }
        if libc::fcntl(fd, libc::F_SETOWN, libc::getpid()) < 0 {
            return Err(last_err());
        }
    }
    Ok(())
}

/// The first realtime signal usable by the application (glibc reserves a
/// few for itself, so `SIGRTMIN` is a function, not a compile-time
/// constant).
pub fn rtmin() -> libc::c_int {
    unsafe { libc::SIGRTMIN() }
}

/// The last realtime signal usable by the application.
pub fn rtmax() -> libc::c_int {
    unsafe { libc::SIGRTMAX() }
}

/// A `libc::sigset_t` wrapper that can hold arbitrary realtime signal
/// numbers.
#[derive(Clone, Copy)]
pub struct SigSet(libc::sigset_t);

impl SigSet {
    pub fn empty() -> Result<Self> {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigemptyset(&mut set) } < 0 {
            return Err(last_err());
        }
        Ok(SigSet(set))
    }

    pub fn add(&mut self, sig: libc::c_int) -> Result<()> {
        if unsafe { libc::sigaddset(&mut self.0, sig) } < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Block this set in the calling thread's signal mask, replacing
    /// whatever was blocked before (`SIG_SETMASK`). All roles call this
    /// once at startup on their single control thread, the way the
    /// original blocks `SIGTERM`/`SIGMQTT`/the restart signals before
    /// entering its run loop.
    pub fn block(&self) -> Result<()> {
        if unsafe { libc::sigprocmask(libc::SIG_SETMASK, &self.0, std::ptr::null_mut()) } < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Block until one of this set's signals is pending, or `timeout`
    /// elapses (`None` on timeout).
    pub fn timed_wait(&self, timeout: Duration) -> Result<Option<libc::siginfo_t>> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos()),
        };
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::sigtimedwait(&self.0, &mut info, &ts) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(SignalError::Io(err));
        }
        Ok(Some(info))
    }

    /// Block indefinitely until one of this set's signals is pending.
    pub fn wait(&self) -> Result<libc::siginfo_t> {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::sigwaitinfo(&self.0, &mut info) };
        if ret < 0 {
            return Err(last_err());
        }
        Ok(info)
    }
}

/// Drain every already-queued instance of a single pending signal without
/// blocking. Used after handling a `SIGRESTART+i` edge to flush any
/// duplicate restart signals queued while the service was being reaped,
/// mirroring `watchdog.c`'s `unqueue_signal`.
pub fn drain_one(sig: libc::c_int) -> Result<()> {
    let mut set = SigSet::empty()?;
    set.add(sig)?;
    let zero = Duration::ZERO;
    while set.timed_wait(zero)?.is_some() {}
    Ok(())
}
