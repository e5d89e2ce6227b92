//! The supervisor: forks the client and worker roles, multiplexes their
//! signals, restarts whichever one dies, and salvages what it can before
//! reaping.
//!
//! Grounded in `watchdog.c`'s `main`/`start_service`/`reap_service`/
//! `save_backtrace`/`save_log`/`wait_for_signal`, generalized from "one
//! supervised child" to "N named roles, each wired to its own realtime
//! signal number" (`SIGRESTART + i`, `SIGRESTART` being the first
//! available realtime signal).
//!
//! One divergence from the original, noted here rather than silently
//! replicated: the original never blocks `SIGCHLD` via `sigprocmask`
//! before trying to `sigtimedwait` on it inside `reap_service`, which
//! would make that wait a no-op (an unblocked signal with the default,
//! ignoring disposition never becomes "pending" for `sigtimedwait` to
//! observe) and leaves the final unconditional `waitpid` to do all the
//! actual work. `SIGCHLD` is blocked here alongside the rest of the set,
//! so the same opportunistic-reap code path is actually live.

use crate::client;
use crate::config::Config;
use crate::cpu::CpuLimit;
use crate::signal::{self, SigSet};
use crate::store::{ItemKind, Store};
use crate::worker;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, ForkResult, Pid};
use nix::sys::signal::{kill, Signal};

use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const BACKTRACE_SIZE: usize = 4096;
const RESTART_DELAY: Duration = Duration::from_secs(1);
const REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
enum Role {
    Client,
    Worker,
}

struct Service {
    name: &'static str,
    role: Role,
    pid: Option<Pid>,
    kill_fd: RawFd,
}

pub fn run(cfg: Config) -> anyhow::Result<()> {
    set_scheduling_class()?;
    redirect_stderr_to_log(&cfg.log_path)?;
    cfg.export_to_env();

    let store = Store::open(&cfg.db_path)?;

    let mut services = vec![
        Service { name: "client", role: Role::Client, pid: None, kill_fd: -1 },
        Service { name: "worker", role: Role::Worker, pid: None, kill_fd: -1 },
    ];
    let n = services.len();

    let rtmin = signal::rtmin();
    if rtmin + n as i32 >= signal::rtmax() {
        anyhow::bail!("not enough realtime signals available for {n} services");
    }
    let siglog = signal::rtmax();

    let mut mask = SigSet::empty()?;
    mask.add(libc::SIGTERM)?;
    mask.add(libc::SIGINT)?;
    mask.add(libc::SIGCHLD)?;
    mask.add(siglog)?;
    for i in 0..n as i32 {
        mask.add(rtmin + i)?;
    }
    mask.block()?;

    let mut chld_only = SigSet::empty()?;
    chld_only.add(libc::SIGCHLD)?;

    let (log_r, log_w) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty())?;
    let log_r: RawFd = log_r.into_raw_fd();
    let log_w: RawFd = log_w.into_raw_fd();
    signal::set_async_signal(log_r, siglog)?;

    let cfg = Arc::new(cfg);

    for i in 0..n {
        start_service(&mut services, i, rtmin, log_r, log_w, Duration::ZERO, &cfg)?;
    }

    let clean_shutdown = loop {
        let info = match mask.wait() {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "sigwaitinfo failed");
                break false;
            }
        };
        let sig = info.si_signo;

        if sig == siglog {
            save_log(log_r, &store);
            continue;
        }

        if sig == libc::SIGINT || sig == libc::SIGTERM {
            info!(sig, "received termination signal");
            break true;
        }

        if sig == libc::SIGCHLD {
            reap_stray_children(&chld_only);
            continue;
        }

        let idx = (sig - rtmin) as usize;
        if idx >= n {
            continue;
        }

        warn!(name = services[idx].name, "service tether closed, restarting");
        reap_service(&mut services[idx], &chld_only, &store);
        let _ = signal::drain_one(sig);

        if let Err(e) = start_service(&mut services, idx, rtmin, log_r, log_w, RESTART_DELAY, &cfg) {
            warn!(error = %e, "failed to restart service");
            break false;
        }
    };

    for svc in &mut services {
        if svc.pid.is_some() {
            info!(name = svc.name, "stopping service");
            reap_service(svc, &chld_only, &store);
        }
    }

    let _ = close(log_r);
    let _ = close(log_w);

    let mut store = store;
    let _ = store.close();
    if clean_shutdown {
        // sled stores its database as a directory, not a single file.
        let _ = std::fs::remove_dir_all(&cfg.db_path);
    }

    if clean_shutdown {
        Ok(())
    } else {
        anyhow::bail!("supervisor exited abnormally")
    }
}

#[allow(clippy::too_many_arguments)]
fn start_service(
    services: &mut [Service],
    i: usize,
    rtmin: i32,
    log_r: RawFd,
    log_w: RawFd,
    launch_delay: Duration,
    cfg: &Arc<Config>,
) -> anyhow::Result<()> {
    let (sup_end, child_end) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())?;
    let sup_end: RawFd = sup_end.into_raw_fd();
    let child_end: RawFd = child_end.into_raw_fd();

    signal::set_async_signal(sup_end, rtmin + i as i32)?;

    let role = services[i].role;
    let name = services[i].name;
    let other_kill_fds: Vec<RawFd> = services
        .iter()
        .enumerate()
        .filter(|(j, svc)| *j != i && svc.kill_fd >= 0)
        .map(|(_, svc)| svc.kill_fd)
        .collect();

    match unsafe { fork() }? {
        ForkResult::Child => {
            let _ = close(sup_end);
            for fd in other_kill_fds {
                let _ = close(fd);
            }
            run_service_child(child_end, log_r, log_w, name, role, launch_delay, cfg);
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => {
            let _ = close(child_end);
            services[i].pid = Some(child);
            services[i].kill_fd = sup_end;
            Ok(())
        }
    }
}

/// Runs entirely inside the forked child; never returns.
fn run_service_child(
    child_end: RawFd,
    log_r: RawFd,
    log_w: RawFd,
    name: &'static str,
    role: Role,
    launch_delay: Duration,
    cfg: &Config,
) -> ! {
    let setup = (|| -> anyhow::Result<()> {
        const KILLFD: RawFd = 127;
        dup2(child_end, KILLFD)?;
        if child_end != KILLFD {
            close(child_end)?;
        }
        close(log_r)?;
        signal::set_async_signal(KILLFD, libc::SIGKILL)?;
        dup2(log_w, libc::STDERR_FILENO)?;
        if log_w != libc::STDERR_FILENO {
            close(log_w)?;
        }
        Ok(())
    })();
    if let Err(e) = setup {
        warn!(name, error = %e, "service child setup failed");
        unsafe { libc::_exit(1) };
    }

    if let Ok(cname) = std::ffi::CString::new(name) {
        unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr()) };
    }

    if !launch_delay.is_zero() {
        std::thread::sleep(launch_delay);
    }

    let code = run_role_body(role, cfg);
    unsafe { libc::_exit(code) };
}

fn run_role_body(role: Role, cfg: &Config) -> i32 {
    let term = match block_role_signals(role) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to set up role signal mask");
            return 1;
        }
    };

    let store = match Store::open(&cfg.db_path) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "role failed to open store");
            return 1;
        }
    };

    let _cpu = CpuLimit::arm();

    let result = match role {
        Role::Worker => worker::run(&store, &term),
        Role::Client => match client::connect_with_retry(&cfg.mqtt, &term) {
            Ok(transport) => client::run(transport, &store, &cfg.mqtt.client_id, &term),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "role exited with an error");
            1
        }
    }
}

/// Replaces whatever signal mask the fork inherited from the supervisor
/// with exactly what this role needs: `SIGTERM` always, plus the client
/// role's MQTT signal so `MqttTransport` can wait on it too. A role
/// process has a single control thread; termination and transport
/// readiness are multiplexed on it by sequential `sigtimedwait` calls
/// rather than by a second thread flipping a shared flag. Returns a
/// `SigSet` selecting just `SIGTERM`, for the role's own run loop.
fn block_role_signals(role: Role) -> signal::Result<SigSet> {
    let mut blocked = SigSet::empty()?;
    blocked.add(libc::SIGTERM)?;
    if matches!(role, Role::Client) {
        blocked.add(signal::rtmin())?;
    }
    blocked.block()?;

    let mut term = SigSet::empty()?;
    term.add(libc::SIGTERM)?;
    Ok(term)
}

/// Terminates a service, gives it up to [`REAP_GRACE`] to exit on its own
/// (reaping any other stray children observed in the meantime), salvages
/// whatever it wrote to its tether socket as a crash backtrace, and then
/// unconditionally blocks for its exit status.
fn reap_service(svc: &mut Service, chld: &SigSet, store: &Store) {
    let Some(pid) = svc.pid else { return };

    if kill(pid, Signal::SIGTERM).is_ok() {
        let deadline = Instant::now() + REAP_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match chld.timed_wait(remaining) {
                Ok(Some(info)) => {
                    let exited = Pid::from_raw(info.si_pid());
                    let _ = waitpid(exited, Some(WaitPidFlag::WNOHANG));
                    if exited == pid {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    save_backtrace(svc.kill_fd, store);
    if svc.kill_fd >= 0 {
        let _ = close(svc.kill_fd);
    }
    svc.kill_fd = -1;

    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, 0)) => info!(name = svc.name, "service exited cleanly"),
        Ok(WaitStatus::Exited(_, code)) => warn!(name = svc.name, code, "service exited with an error"),
        Ok(WaitStatus::Signaled(_, Signal::SIGXCPU, _)) => {
            warn!(name = svc.name, "service exceeded its CPU budget");
        }
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            warn!(name = svc.name, ?sig, "service was terminated by a signal");
        }
        _ => warn!(name = svc.name, "service terminated for an unrecognized reason"),
    }
    svc.pid = None;
}

fn reap_stray_children(chld: &SigSet) {
    while let Ok(Some(info)) = chld.timed_wait(Duration::ZERO) {
        let pid = Pid::from_raw(info.si_pid());
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Drains whatever a dying service wrote to its tether socket (typically
/// nothing, occasionally a panic backtrace written just before exit) and
/// saves it as a crash report if non-empty.
fn save_backtrace(fd: RawFd, store: &Store) {
    if fd < 0 {
        return;
    }
    let mut buf = vec![0u8; BACKTRACE_SIZE];
    let mut total = 0usize;
    loop {
        let n = unsafe {
            libc::recv(fd, buf[total..].as_mut_ptr().cast(), BACKTRACE_SIZE - total, libc::MSG_DONTWAIT)
        };
        if n <= 0 {
            break;
        }
        total += n as usize;
        if total >= BACKTRACE_SIZE {
            break;
        }
    }
    if total > 0 {
        let _ = store.add(ItemKind::Backtrace, &buf[..total]);
    }
}

/// Drains everything currently pending on the log fan-in socket, echoing
/// it to (the now-redirected) stderr and saving each datagram as a log
/// item.
fn save_log(fd: RawFd, store: &Store) {
    let mut buf = [0u8; 512];
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT) };
        if n <= 0 {
            break;
        }
        let n = n as usize;
        let _ = store.add(ItemKind::Log, &buf[..n]);
        let _ = std::io::Write::write_all(&mut std::io::stderr(), &buf[..n]);
    }
}

fn set_scheduling_class() -> anyhow::Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_OTHER, &param) } != 0 {
        anyhow::bail!("sched_setscheduler failed: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 0) } < 0 {
        anyhow::bail!("setpriority failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn redirect_stderr_to_log(log_path: &std::path::Path) -> anyhow::Result<()> {
    let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } != 0;
    if cfg!(debug_assertions) && is_tty {
        // Leave stderr on the terminal for local runs under `cargo run`.
        return Ok(());
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    dup2(file.as_raw_fd(), libc::STDERR_FILENO)?;
    Ok(())
}
