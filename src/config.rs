//! Runtime configuration: CLI flags layered over environment defaults.

use crate::cli::Cli;
use crate::transport::MqttConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "/tmp/boydem";
pub const DEFAULT_LOG_PATH: &str = "/tmp/yodi.log";
pub const DB_PATH_ENV: &str = "YODI_DB_PATH";
pub const LOG_PATH_ENV: &str = "YODI_LOG_PATH";

pub struct Config {
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    pub mqtt: MqttConfig,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let db_path = cli
            .db_path
            .clone()
            .or_else(|| std::env::var(DB_PATH_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let log_path = cli
            .log_path
            .clone()
            .or_else(|| std::env::var(LOG_PATH_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));

        Ok(Config {
            db_path,
            log_path,
            mqtt: MqttConfig {
                host: cli.host.clone(),
                port: cli.port,
                broker_uri: cli.uri.clone(),
                client_id: cli.client_id.clone(),
                username: cli.user.clone(),
                password: cli.password.clone(),
                keepalive: Duration::from_secs(20),
            },
        })
    }

    /// Publish `db_path`/`log_path` into the process environment so that
    /// forked role children — which inherit it without a fresh `exec` —
    /// see the same paths the supervisor resolved at startup.
    pub fn export_to_env(&self) {
        // SAFETY: called once, single-threaded, before any service fork.
        unsafe {
            std::env::set_var(DB_PATH_ENV, &self.db_path);
            std::env::set_var(LOG_PATH_ENV, &self.log_path);
        }
    }
}
