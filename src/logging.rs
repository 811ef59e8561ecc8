//! Logging module
//!
//! env_logger with a one-line JSON format shared by ordinary log records
//! and supervisor event records. Bus events are logged under an
//! `event:<type>` target so the failover/primary-change history is
//! queryable from the log by its `event` field, not just as free text.
//!
//! Foreground runs log to stdout; daemon runs append to ~/.tunl/tunl.log.

use anyhow::Result;
use log::LevelFilter;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;

use crate::constants::get_log_file_path;
use crate::events::EventType;

/// Target prefix that routes a record through the event classifier.
const EVENT_TARGET_PREFIX: &str = "event:";

/// Log target for one bus event type. Records logged under this target
/// carry the event kind in the JSON `event` field.
pub fn event_target(event_type: EventType) -> String {
    format!("{}{}", EVENT_TARGET_PREFIX, event_type)
}

/// Split a record into its `module` and `event` payload fields.
///
/// Event-tagged records are attributed to the event machinery; everything
/// else is an ordinary `log` record from its originating module.
fn classify<'a>(target: &'a str, module_path: Option<&'a str>) -> (&'a str, &'a str) {
    match target.strip_prefix(EVENT_TARGET_PREFIX) {
        Some(kind) => ("tunl::events", kind),
        None => (module_path.unwrap_or(target), "log"),
    }
}

fn json_line(level: &str, message: &str, module: &str, event: &str, fields: Value) -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": level,
        "message": message,
        "module": module,
        "event": event,
        "fields": fields
    })
}

fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Initialize the logging system
///
/// - foreground mode: logs to stdout
/// - daemon mode: logs to file
pub fn init_logging(log_level_str: &str, daemon_mode: bool) -> Result<()> {
    let mut builder = env_logger::Builder::new();

    builder
        .format(|buf, record| {
            let (module, event) = classify(record.target(), record.module_path());
            let line = json_line(
                &record.level().to_string(),
                &record.args().to_string(),
                module,
                event,
                json!({}),
            );
            writeln!(buf, "{}", line)
        })
        .filter_level(parse_log_level(log_level_str));

    if daemon_mode {
        let log_path = get_log_file_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
