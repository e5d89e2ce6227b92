//! Command-line surface.

use clap::Parser;

/// Signal-driven supervisor agent: durable command queue, sandboxed shell
/// execution, MQTT transport.
#[derive(Parser, Debug)]
#[command(name = "yodi", version, about)]
pub struct Cli {
    /// MQTT broker host.
    #[arg(short = 'h', long)]
    pub host: String,

    /// MQTT broker URI path component, carried through for transports that
    /// need it (e.g. a websocket path). Required like every other
    /// connection flag; the plain-TCP transport does not consume it today.
    #[arg(short = 'u', long)]
    pub uri: String,

    /// MQTT broker port.
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..=65535))]
    pub port: u16,

    /// MQTT client id; also the topic namespace root (`/<id>/commands`,
    /// `/<id>/results`, `/<id>/log`, `/<id>/crashes`).
    #[arg(short = 'i', long = "id")]
    pub client_id: String,

    /// MQTT username.
    #[arg(short = 'U', long)]
    pub user: String,

    /// MQTT password.
    #[arg(short = 'P', long)]
    pub password: String,

    /// Override the durable store path (default: `$YODI_DB_PATH` or
    /// `/tmp/boydem`).
    #[arg(long)]
    pub db_path: Option<String>,

    /// Override the log file path (default: `$YODI_LOG_PATH` or
    /// `/tmp/yodi.log`).
    #[arg(long)]
    pub log_path: Option<String>,
}
