//! yodi — a signal-driven supervisor agent.
//!
//! A supervisor process forks two long-lived roles, a client that bridges
//! an MQTT broker and a worker that executes queued commands, and
//! restarts either one if it dies. The two roles never share memory or
//! talk to each other directly; everything that crosses the boundary —
//! commands, results, log lines, crash reports — goes through a durable
//! on-disk queue.

pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod cpu;
pub mod shell;
pub mod signal;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::Config;
