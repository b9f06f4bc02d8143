//! Structured logging for the server process.
//!
//! Everything goes to `<data_dir>/logs/server.log` through a non-blocking
//! writer; stderr mirroring is opt-in. Settings come from the environment:
//!
//! - `FOLIOCHAT_LOG_FILTER` (falls back to `RUST_LOG`)
//! - `FOLIOCHAT_LOG_FORMAT` = `json` (default) | `pretty`
//! - `FOLIOCHAT_LOG_STDERR=1`
//! - `FOLIOCHAT_TRUNCATE_LOG_ON_START=1`
//! - `FOLIOCHAT_RUN_ID` to correlate a run with external tooling

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogSettings {
    filter: String,
    format: LogFormat,
    mirror_stderr: bool,
    truncate: bool,
    run_id: Option<String>,
}

impl LogSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).as_deref() == Some("1");
        let format = match lookup("FOLIOCHAT_LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            filter: lookup("FOLIOCHAT_LOG_FILTER")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format,
            mirror_stderr: flag("FOLIOCHAT_LOG_STDERR"),
            truncate: flag("FOLIOCHAT_TRUNCATE_LOG_ON_START"),
            run_id: lookup("FOLIOCHAT_RUN_ID"),
        }
    }
}

/// Keeps the file writer flushing; drop it only at process exit.
pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    let settings = LogSettings::from_lookup(|name| std::env::var(name).ok());

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    if settings.truncate {
        std::fs::File::create(&log_path)?;
    }

    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let stderr_layer = settings
        .mirror_stderr
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    let subscriber = tracing_subscriber::registry().with(filter).with(stderr_layer);
    match settings.format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    let run_id = settings.run_id.clone().unwrap_or_else(generated_run_id);
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = ?settings.format,
        stderr = settings.mirror_stderr,
        filter = %settings.filter,
    );

    Ok(LoggingHandle { run_id, guard })
}

fn generated_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("pid-{}-{millis}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_json_file_only() {
        let s = settings(&[]);
        assert_eq!(s.filter, DEFAULT_FILTER);
        assert_eq!(s.format, LogFormat::Json);
        assert!(!s.mirror_stderr);
        assert!(!s.truncate);
        assert_eq!(s.run_id, None);
    }

    #[test]
    fn own_filter_wins_over_rust_log() {
        let s = settings(&[("RUST_LOG", "debug"), ("FOLIOCHAT_LOG_FILTER", "foliochat=trace")]);
        assert_eq!(s.filter, "foliochat=trace");
        assert_eq!(settings(&[("RUST_LOG", "debug")]).filter, "debug");
    }

    #[test]
    fn flags_need_exactly_one() {
        let s = settings(&[
            ("FOLIOCHAT_LOG_FORMAT", "Pretty"),
            ("FOLIOCHAT_LOG_STDERR", "1"),
            ("FOLIOCHAT_TRUNCATE_LOG_ON_START", "yes"),
        ]);
        assert_eq!(s.format, LogFormat::Pretty);
        assert!(s.mirror_stderr);
        assert!(!s.truncate);
    }
}
