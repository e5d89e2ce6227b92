//! Worker role: pops queued commands, runs them, pushes results.
//!
//! Mirrors `worker.c`'s `yodi_worker` main loop, with one deliberate
//! change from the original: the original deletes a popped command
//! before running it, so a crash mid-command (most plausibly, a wedged
//! shell) loses the command outright. Here the delete happens only after
//! the result (if any) has been durably queued, so the same crash instead
//! leaves the command to be retried on restart — at-least-once execution,
//! at the cost of a possible duplicate result if the command already
//! produced one before the crash.

use crate::command;
use crate::cpu::CpuLimit;
use crate::signal::SigSet;
use crate::store::{ItemKind, Store};
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `term` selects only `SIGTERM`; the signal must already be blocked
/// process-wide by the caller. Single-threaded: an idle tick's "sleep" is
/// itself a wait on `term`, so a pending `SIGTERM` interrupts it instead of
/// requiring a second thread to notice and flip a flag.
pub fn run(store: &Store, term: &SigSet) -> anyhow::Result<()> {
    let mut cpu = CpuLimit::arm();

    loop {
        if term.timed_wait(Duration::ZERO)?.is_some() {
            return Ok(());
        }
        match store.one(ItemKind::Command)? {
            Some(item) => {
                let outcome = command::run_command(&item.payload);
                if let Some(result) = outcome {
                    debug!(id = item.id, "saving command result");
                    store.add(ItemKind::Result, result.as_bytes())?;
                }
                store.delete(item.id)?;
            }
            None => {
                if term.timed_wait(POLL_INTERVAL)?.is_some() {
                    return Ok(());
                }
            }
        }
        cpu.rearm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_one_command_and_queues_its_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        store
            .add(ItemKind::Command, br#"{"type":"echo","id":"u","data":"hi"}"#)
            .unwrap();

        let item = store.one(ItemKind::Command).unwrap().unwrap();
        let result = command::run_command(&item.payload).unwrap();
        store.add(ItemKind::Result, result.as_bytes()).unwrap();
        store.delete(item.id).unwrap();

        assert!(store.one(ItemKind::Command).unwrap().is_none());
        let saved = store.one(ItemKind::Result).unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&saved.payload).unwrap();
        assert_eq!(parsed["result"], "hi");
    }

    #[test]
    fn unparseable_command_is_dropped_without_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        store.add(ItemKind::Command, b"not json").unwrap();

        let item = store.one(ItemKind::Command).unwrap().unwrap();
        assert!(command::run_command(&item.payload).is_none());
        store.delete(item.id).unwrap();

        assert!(store.one(ItemKind::Command).unwrap().is_none());
        assert!(store.one(ItemKind::Result).unwrap().is_none());
    }
}
