//! Logger setup for the daemon and the CLI.
//!
//! Records go to stderr as one JSON object per line, tagged with the process
//! id so several boot-time daemons can share one console capture.

use env_logger::{Builder, Env};
use log::Record;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::OnceLock;

static INSTALLED: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "REMOTE_UNLOCK_LOG_FORMAT";
const LEVEL_ENV: &str = "REMOTE_UNLOCK_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("plain") || v.eq_ignore_ascii_case("text") => {
                LogFormat::Plain
            }
            _ => LogFormat::Json,
        }
    }
}

/// Install the global logger; later calls do nothing.
///
/// Filter precedence is `RUST_LOG`, then `REMOTE_UNLOCK_LOG_LEVEL`, then
/// `default_level`.
pub fn init(default_level: &str) {
    INSTALLED.get_or_init(|| {
        let level = std::env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_owned());
        let format = LogFormat::parse(std::env::var(FORMAT_ENV).ok().as_deref());
        let mut builder = Builder::from_env(Env::default().default_filter_or(level));

        match format {
            LogFormat::Json => builder.format(|buf, record| {
                let line = json_record(&buf.timestamp().to_string(), record);
                writeln!(buf, "{line}")
            }),
            LogFormat::Plain => builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    buf.timestamp(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            }),
        };

        if let Err(err) = builder.try_init() {
            eprintln!("remote-unlock: logger already installed: {err}");
        }
    });
}

fn json_record(timestamp: &str, record: &Record<'_>) -> Value {
    json!({
        "ts": timestamp,
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "pid": std::process::id(),
        "msg": record.args().to_string(),
    })
}
