//! Command envelope parsing, schema validation, and handler dispatch.
//!
//! Mirrors `worker.c`'s `run_command` and its four-entry `cmds[]` table
//! (`echo`, `stop`, `log`, `shell`). Malformed envelopes and unknown
//! `type`s are silently dropped rather than surfaced as errors — there is
//! no one to report a parse failure to.

use crate::config::{DEFAULT_LOG_PATH, LOG_PATH_ENV};
use crate::shell;
use memmap2::Mmap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::getppid;
use serde_json::{Map, Value};
use std::fs::File;

/// A validated envelope: `type` and `id` plus everything else, passed
/// through to the matched handler.
pub struct CommandEnvelope {
    pub kind: String,
    pub id: String,
    pub extra: Map<String, Value>,
}

enum HandlerOutcome {
    Result(String),
    Error(String),
    /// Neither `result` nor `error` is emitted (the `stop` handler's
    /// success path: the process is about to be signalled to death and
    /// has nothing useful to report back).
    None,
}

type Handler = fn(&CommandEnvelope) -> HandlerOutcome;

const HANDLERS: &[(&str, Handler)] = &[
    ("echo", handle_echo),
    ("stop", handle_stop),
    ("log", handle_log),
    ("shell", handle_shell),
];

/// Parse, validate, dispatch, and serialize a command envelope into its
/// result envelope. Returns `None` for anything that isn't valid JSON, an
/// object, or carrying both `type` and `id` as strings, and for unknown
/// `type`s — there's no result to save in any of those cases.
pub fn run_command(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let obj = value.as_object()?;
    let kind = obj.get("type")?.as_str()?.to_string();
    let id = obj.get("id")?.as_str()?.to_string();

    let mut extra = obj.clone();
    extra.remove("type");
    extra.remove("id");
    let envelope = CommandEnvelope { kind: kind.clone(), id: id.clone(), extra };

    let (_, handler) = HANDLERS.iter().find(|(name, _)| *name == kind)?;
    let outcome = handler(&envelope);

    let mut out = Map::new();
    out.insert("type".to_string(), Value::String(kind));
    out.insert("id".to_string(), Value::String(id));
    match outcome {
        HandlerOutcome::Result(s) => {
            out.insert("result".to_string(), Value::String(s));
        }
        HandlerOutcome::Error(s) => {
            out.insert("error".to_string(), Value::String(s));
        }
        HandlerOutcome::None => {}
    }
    serde_json::to_string(&Value::Object(out)).ok()
}

fn handle_echo(env: &CommandEnvelope) -> HandlerOutcome {
    match env.extra.get("data").and_then(Value::as_str) {
        Some(s) => HandlerOutcome::Result(s.to_string()),
        None => HandlerOutcome::Error("no data specified".to_string()),
    }
}

/// Signals the parent process (the supervisor) to terminate. Reports an
/// error only on failure; success leaves both `result` and `error` unset,
/// matching `handle_stop` in `command.c`.
fn handle_stop(_env: &CommandEnvelope) -> HandlerOutcome {
    stop_pid(getppid())
}

fn stop_pid(ppid: nix::unistd::Pid) -> HandlerOutcome {
    if ppid.as_raw() <= 1 {
        return HandlerOutcome::Error("cannot kill init".to_string());
    }
    match kill(ppid, Signal::SIGTERM) {
        Ok(()) => HandlerOutcome::None,
        Err(e) => HandlerOutcome::Error(e.to_string()),
    }
}

fn handle_log(_env: &CommandEnvelope) -> HandlerOutcome {
    let path = std::env::var(LOG_PATH_ENV).unwrap_or_else(|_| DEFAULT_LOG_PATH.to_string());
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => return HandlerOutcome::Error(e.to_string()),
    };
    let len = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => return HandlerOutcome::Error(e.to_string()),
    };
    if len == 0 {
        return HandlerOutcome::Result(String::new());
    }
    // SAFETY: the log file is append-only and owned by this agent; no
    // other process truncates it out from under a live mapping.
    let mmap = match unsafe { Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => return HandlerOutcome::Error(e.to_string()),
    };
    HandlerOutcome::Result(String::from_utf8_lossy(&mmap).into_owned())
}

fn handle_shell(env: &CommandEnvelope) -> HandlerOutcome {
    let Some(cmdline) = env.extra.get("cmd").and_then(Value::as_str) else {
        return HandlerOutcome::Error("no command specified".to_string());
    };
    match shell::run_shell(cmdline) {
        Ok(outcome) => HandlerOutcome::Result(outcome.b64_deflated_output),
        Err(e) => HandlerOutcome::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_handler_name_repeats() {
        let mut seen = std::collections::HashSet::new();
        for (name, _) in HANDLERS {
            assert!(seen.insert(*name), "duplicate handler name {name}");
        }
    }

    #[test]
    fn missing_type_produces_no_output() {
        assert!(run_command(br#"{"id":"u"}"#).is_none());
    }

    #[test]
    fn unknown_type_produces_no_output() {
        assert!(run_command(br#"{"type":"bogus","id":"u"}"#).is_none());
    }

    #[test]
    fn shell_without_cmd_reports_error() {
        let out = run_command(br#"{"type":"shell","id":"u"}"#).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"], "no command specified");
        assert!(parsed.get("result").is_none());
    }

    #[test]
    fn echo_reflects_data() {
        let out = run_command(br#"{"type":"echo","id":"u","data":"hi"}"#).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["result"], "hi");
    }

    #[test]
    fn echo_without_data_reports_error() {
        let out = run_command(br#"{"type":"echo","id":"u"}"#).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"], "no data specified");
    }

    #[test]
    fn stop_refuses_to_signal_init() {
        let outcome = stop_pid(nix::unistd::Pid::from_raw(1));
        match outcome {
            HandlerOutcome::Error(msg) => assert_eq!(msg, "cannot kill init"),
            _ => panic!("expected an error outcome"),
        }
    }
}
