//! End-to-end tests for the `yodi` supervisor binary.
//!
//! These spawn the compiled binary against an isolated store/log path and
//! inspect its process tree via `/proc` — the supervisor has no IPC
//! surface for introspection by design, so "is the worker still alive,
//! and is it the same process" is answered the same way `ps` would
//! answer it.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("yodi");
    p
}

struct Supervisor {
    child: Child,
    _tmp: tempfile::TempDir,
}

impl Supervisor {
    /// Spawns the supervisor against an unreachable broker (port 1 is
    /// never a listening MQTT broker) so the test doesn't depend on
    /// network access; the client role will simply sit in its restart
    /// loop while the worker role runs unaffected.
    fn spawn() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db_path = tmp.path().join("db");
        let log_path = tmp.path().join("yodi.log");

        let child = Command::new(binary())
            .args([
                "--host", "127.0.0.1",
                "--uri", "/",
                "--port", "1",
                "--id", "integration-test",
                "--user", "u",
                "--password", "p",
                "--db-path", db_path.to_str().unwrap(),
                "--log-path", log_path.to_str().unwrap(),
            ])
            .spawn()
            .expect("spawn yodi");

        Supervisor { child, _tmp: tmp }
    }

    fn pid(&self) -> i32 {
        self.child.id() as i32
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        unsafe {
            libc::kill(self.pid(), libc::SIGTERM);
        }
        let _ = self.child.wait();
    }
}

/// Returns the pid of the child of `ppid` whose `/proc/[pid]/comm` equals
/// `name`, if any — set via `prctl(PR_SET_NAME, ...)` at role startup.
fn find_child_by_name(ppid: i32, name: &str) -> Option<i32> {
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let after_comm = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let this_ppid: i32 = fields.first()?.parse().ok()?;
        if this_ppid != ppid {
            continue;
        }
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
        if comm.trim() == name {
            return Some(pid);
        }
    }
    None
}

fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = probe() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn worker_restarts_with_a_new_pid_after_being_killed() {
    let sup = Supervisor::spawn();

    let worker_pid = wait_for(Duration::from_secs(3), || find_child_by_name(sup.pid(), "worker"))
        .expect("worker never started");

    unsafe {
        libc::kill(worker_pid, libc::SIGKILL);
    }

    let new_pid = wait_for(Duration::from_secs(2), || {
        find_child_by_name(sup.pid(), "worker").filter(|p| *p != worker_pid)
    });

    assert!(new_pid.is_some(), "worker was not restarted within 2s");
}

#[test]
fn supervisor_exits_cleanly_on_sigterm() {
    let sup = Supervisor::spawn();
    wait_for(Duration::from_secs(3), || find_child_by_name(sup.pid(), "worker"))
        .expect("worker never started");

    unsafe {
        libc::kill(sup.pid(), libc::SIGTERM);
    }

    let exited = wait_for(Duration::from_secs(3), || {
        let mut status = 0;
        let ret = unsafe { libc::waitpid(sup.pid(), &mut status, libc::WNOHANG) };
        (ret == sup.pid()).then_some(())
    });
    assert!(exited.is_some(), "supervisor did not exit after SIGTERM");
}
