use env_logger::{Builder, Env};
use log::{Level, Record};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LogLevel::ERROR,
            Level::Warn => LogLevel::WARN,
            Level::Info => LogLevel::INFO,
            Level::Debug => LogLevel::DEBUG,
            Level::Trace => LogLevel::TRACE,
        }
    }
}

/// One structured log line.
#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    timestamp: String,
    level: LogLevel,
    target: &'a str,
    thread: Option<String>,
    file: Option<&'a str>,
    line: Option<u32>,
    message: String,
}

impl<'a> LogEntry<'a> {
    pub fn from_record(record: &'a Record<'_>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().into(),
            target: record.target(),
            thread: std::thread::current().name().map(str::to_string),
            file: record.file(),
            line: record.line(),
            message: record.args().to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}

fn builder() -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| writeln!(buf, "{}", LogEntry::from_record(record).to_json()));
    builder
}

/// Installs the JSON line logger. `RUST_LOG` selects the level; the default
/// is `info`.
pub fn init() {
    if let Err(e) = builder().try_init() {
        log::debug!("Logger already installed: {}", e);
    }
}

/// Like [`init`] but surfaces the installation error.
pub fn try_init() -> Result<(), log::SetLoggerError> {
    builder().try_init()
}
