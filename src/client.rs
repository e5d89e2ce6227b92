//! Client role: bridges the durable store and the MQTT transport.
//!
//! Subscribes to `/<id>/commands`, queues anything received there, and on
//! every tick drains queued results, log lines, and crash reports out to
//! their respective topics — in that order, matching `client.c`'s
//! `publish_results`/`publish_logs`/`report_crashes` sequence inside
//! `yodi_client`'s main loop. Generic over [`Transport`] so the drain/
//! dispatch logic can be tested against an in-memory fake instead of a
//! broker.

use crate::signal::SigSet;
use crate::store::{ItemKind, Store};
use crate::transport::{Inbound, MqttConfig, MqttTransport, Qos, Transport};
use std::time::Duration;
use tracing::{debug, warn};

pub const CONNECT_TRIES: u32 = 5;
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts to connect up to [`CONNECT_TRIES`] times, sleeping
/// [`CONNECT_INTERVAL`] between attempts. A termination request arriving
/// during a retry wait aborts immediately rather than completing the
/// countdown. `term` selects only `SIGTERM`; the signal must already be
/// blocked process-wide by the caller.
pub fn connect_with_retry(cfg: &MqttConfig, term: &SigSet) -> anyhow::Result<MqttTransport> {
    for attempt in 1..=CONNECT_TRIES {
        if term.timed_wait(Duration::ZERO)?.is_some() {
            anyhow::bail!("terminated while connecting");
        }
        match MqttTransport::connect(cfg) {
            Ok(t) => return Ok(t),
            Err(e) => {
                warn!(attempt, error = %e, "mqtt connect failed");
                if term.timed_wait(CONNECT_INTERVAL)?.is_some() {
                    anyhow::bail!("terminated while connecting");
                }
            }
        }
    }
    anyhow::bail!("exhausted {CONNECT_TRIES} connection attempts")
}

/// Runs the client role's main loop until `term`'s signal is pending or the
/// transport fails outright. Single-threaded: termination and transport
/// activity are both multiplexed on this one control thread, `term` via a
/// zero-timeout check and the transport's own signal via `yield_now`'s
/// internal wait.
pub fn run<T: Transport>(mut transport: T, store: &Store, client_id: &str, term: &SigSet) -> anyhow::Result<()> {
    let commands_topic = format!("/{client_id}/commands");
    let results_topic = format!("/{client_id}/results");
    let log_topic = format!("/{client_id}/log");
    let crashes_topic = format!("/{client_id}/crashes");

    transport
        .subscribe(&commands_topic, Qos::AtLeastOnce)
        .map_err(|e| anyhow::anyhow!("subscribe to {commands_topic} failed: {e}"))?;

    while term.timed_wait(Duration::ZERO)?.is_none() {
        match transport.yield_now(RESULT_POLL_INTERVAL) {
            Ok(Inbound::Message { topic, payload }) if topic == commands_topic => {
                debug!(bytes = payload.len(), "received command");
                store.add(ItemKind::Command, &payload)?;
            }
            Ok(Inbound::Message { topic, .. }) => {
                warn!(%topic, "message on an unexpected topic");
            }
            Ok(Inbound::Idle) => {}
            Err(e) => {
                warn!(error = %e, "transport yield failed");
                break;
            }
        }

        if let Err(e) = drain(&mut transport, store, &results_topic, ItemKind::Result, Qos::AtLeastOnce) {
            warn!(error = %e, "publishing results failed");
            break;
        }
        if let Err(e) = drain(&mut transport, store, &log_topic, ItemKind::Log, Qos::AtMostOnce) {
            warn!(error = %e, "publishing log lines failed");
            break;
        }
        if let Err(e) = drain(&mut transport, store, &crashes_topic, ItemKind::Backtrace, Qos::AtLeastOnce) {
            warn!(error = %e, "publishing crash reports failed");
            break;
        }
    }

    let _ = transport.unsubscribe(&commands_topic);
    let _ = transport.disconnect();
    Ok(())
}

/// Publishes every queued item of `kind`, deleting each only after its
/// publish call returns `Ok` — a crash between publish and delete means a
/// duplicate send next time, which is the intended at-least-once
/// behavior for results, logs, and crash reports.
fn drain<T: Transport>(
    transport: &mut T,
    store: &Store,
    topic: &str,
    kind: ItemKind,
    qos: Qos,
) -> anyhow::Result<()> {
    while let Some(item) = store.one(kind)? {
        transport
            .publish(topic, qos, &item.payload)
            .map_err(|e| anyhow::anyhow!("publish to {topic} failed: {e}"))?;
        store.delete(item.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    fn open_tmp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn drains_queued_results_in_fifo_order() {
        let (_dir, store) = open_tmp_store();
        store.add(ItemKind::Result, b"first").unwrap();
        store.add(ItemKind::Result, b"second").unwrap();

        let mut transport = FakeTransport::default();
        drain(&mut transport, &store, "/a/results", ItemKind::Result, Qos::AtLeastOnce).unwrap();

        assert_eq!(transport.published.len(), 2);
        assert_eq!(transport.published[0].2, b"first");
        assert_eq!(transport.published[1].2, b"second");
        assert!(store.one(ItemKind::Result).unwrap().is_none());
    }

    #[test]
    fn incoming_command_is_queued_then_loop_exits_on_terminate() {
        let (_dir, store) = open_tmp_store();
        let mut transport = FakeTransport::default();
        transport.inbound.push_back(Inbound::Message {
            topic: "/agent-1/commands".to_string(),
            payload: br#"{"type":"echo","id":"u","data":"hi"}"#.to_vec(),
        });

        // FakeTransport::yield_now drains its queue then returns Idle
        // forever; exercise one manual iteration of what `run`'s loop body
        // does instead of driving the full loop against a real signal.
        let commands_topic = "/agent-1/commands".to_string();
        transport.subscribe(&commands_topic, Qos::AtLeastOnce).unwrap();
        match transport.yield_now(Duration::from_millis(0)).unwrap() {
            Inbound::Message { topic, payload } if topic == commands_topic => {
                store.add(ItemKind::Command, &payload).unwrap();
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(store.one(ItemKind::Command).unwrap().is_some());
    }
}
