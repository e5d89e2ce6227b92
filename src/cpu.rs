//! Soft CPU-time budget enforcement via `RLIMIT_CPU`.
//!
//! A role process pins its own soft CPU limit to "time consumed so far
//! plus `CPU_SEC`", re-pinning it every `REARM_INTERVAL` so ordinary
//! accumulated usage never trips it — only a burst that outruns the
//! rearm cadence does. `SIGXCPU` is left at its default disposition, so a
//! runaway process is killed and reaped by the supervisor rather than
//! caught and handled in-process. Grounded in `client/cpu.c` (`parse_times`,
//! `cpu_now`, `yodi_cpu_limit_arm`/`_rearm`).

use std::time::{Duration, Instant};
use thiserror::Error;

/// Seconds of additional CPU time granted on each (re)arm.
pub const CPU_SEC: u64 = 110;
/// How often the limit is re-pinned.
pub const REARM_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("failed to read /proc/self/stat: {0}")]
    Read(#[from] std::io::Error),
    #[error("unexpected /proc/[pid]/stat format")]
    Parse,
    #[error("cpu time accounting overflowed")]
    Overflow,
}

fn clk_tck() -> Option<i64> {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        None
    } else {
        Some(ticks)
    }
}

/// Parse total CPU seconds (`utime + stime`, fields 14 and 15) out of a
/// `/proc/[pid]/stat` line. Assumes `comm` (field 2) has no embedded
/// whitespace, as the original's `sscanf`-based parser does.
pub fn parse_times(stat: &str, ticks: i64) -> Result<u64, CpuError> {
    let fields: Vec<&str> = stat.split_whitespace().collect();
    if fields.len() < 15 {
        return Err(CpuError::Parse);
    }
    let utime: u64 = fields[13].parse().map_err(|_| CpuError::Parse)?;
    let stime: u64 = fields[14].parse().map_err(|_| CpuError::Parse)?;
    let total = utime.checked_add(stime).ok_or(CpuError::Overflow)?;
    Ok(total / (ticks as u64))
}

pub fn cpu_now() -> Result<u64, CpuError> {
    let ticks = clk_tck().ok_or(CpuError::Parse)?;
    let stat = std::fs::read_to_string("/proc/self/stat")?;
    parse_times(&stat, ticks)
}

/// Owns the rearm countdown for one process. Created once per role at
/// startup via [`CpuLimit::arm`]; [`CpuLimit::rearm`] is called on every
/// loop iteration and is a no-op until the countdown elapses.
pub struct CpuLimit {
    next_rearm: Instant,
}

impl CpuLimit {
    pub fn arm() -> Self {
        unsafe {
            libc::signal(libc::SIGXCPU, libc::SIG_DFL);
        }
        pin_limit();
        CpuLimit {
            next_rearm: Instant::now() + REARM_INTERVAL,
        }
    }

    pub fn rearm(&mut self) {
        if Instant::now() >= self.next_rearm {
            pin_limit();
            self.next_rearm = Instant::now() + REARM_INTERVAL;
        }
    }
}

fn pin_limit() {
    let Ok(now) = cpu_now() else { return };
    let Some(limit) = now.checked_add(CPU_SEC) else { return };
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: libc::RLIM_INFINITY,
    };
    unsafe {
        libc::setrlimit(libc::RLIMIT_CPU, &rlim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_lines() {
        let line = (0..13).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        assert!(matches!(parse_times(&line, 100), Err(CpuError::Parse)));
    }

    #[test]
    fn sums_utime_and_stime() {
        let mut fields: Vec<String> = (0..15).map(|i| i.to_string()).collect();
        fields[13] = "700".to_string();
        fields[14] = "500".to_string();
        let line = fields.join(" ");
        assert_eq!(parse_times(&line, 100).unwrap(), 12);
    }
}
