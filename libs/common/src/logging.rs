//! Unified logging module for VoltageEMS channel access
//!
//! Console output plus an optional daily rolling log file, both filtered by a
//! reloadable `EnvFilter` so the level can be changed at runtime.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// `timestamp [LEVEL] message`, e.g. `2025-12-02T00:50:44.809000Z [INFO] Ch3 created`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(writer, "{} {}[{}]\x1b[0m ", stamp, level_color(level), level)?;
        } else {
            write!(writer, "{} [{}] ", stamp, level)?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

// Flushes the file writer when dropped, so it lives as long as the process
static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// Directory for log files
///
/// `VOLTAGE_LOG_DIR` when set, a temp directory for test binaries, else `logs`.
pub fn get_log_root() -> PathBuf {
    if let Ok(dir) = std::env::var("VOLTAGE_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if std::env::var("CARGO_TARGET_TMPDIR").is_ok() || running_from_deps_dir() {
        std::env::temp_dir().join("voltage-test-logs")
    } else {
        PathBuf::from("logs")
    }
}

fn running_from_deps_dir() -> bool {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.ends_with("deps")))
        .unwrap_or(false)
}

// Dynamic log level reload support
type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and default filter target
    pub service_name: String,
    /// Base directory for logs
    pub log_dir: PathBuf,
    /// Default level when `RUST_LOG` is not set
    pub console_level: Level,
    /// Write a daily rolling log file in addition to the console
    pub enable_file: bool,
    /// Emit JSON lines to the file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "voltage_channels".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            enable_file: true,
            enable_json: false,
        }
    }
}

/// Initialize logging system with configuration
///
/// Respects `RUST_LOG` when set. Returns an error if a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = match std::env::var("RUST_LOG") {
        Ok(env_str) => env_str,
        Err(_) => format!(
            "{},{}=debug",
            config.console_level.as_str().to_lowercase(),
            config.service_name
        ),
    };
    let env_filter = EnvFilter::try_new(&filter_str)?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let slot = FILE_GUARD.get_or_init(|| Mutex::new(None));
        match slot.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => *poisoned.into_inner() = Some(guard),
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let current = CURRENT_LOG_LEVEL.get_or_init(|| Mutex::new(String::new()));
    if let Ok(mut guard) = current.lock() {
        *guard = filter_str;
    }

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Console-only initialization at the given level
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = LogConfig {
        console_level: level.parse().unwrap_or(Level::INFO),
        enable_file: false,
        ..Default::default()
    };
    init_with_config(config)
}

/// Dynamically set log filter level at runtime
///
/// Accepts a level (`"debug"`) or a full filter spec (`"info,voltage_channels=trace"`).
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_level_colors_differ() {
        assert_ne!(level_color(Level::WARN), level_color(Level::ERROR));
    }

    #[test]
    fn test_log_root_in_tests() {
        if std::env::var("VOLTAGE_LOG_DIR").is_err() {
            assert!(get_log_root().ends_with("voltage-test-logs"));
        }
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "voltage_channels");
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.enable_file);
    }

    #[test]
    #[serial]
    fn test_init_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            log_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        init_with_config(config).unwrap();

        // A second global subscriber is refused
        assert!(init("debug").is_err());

        set_log_level("debug").unwrap();
        assert_eq!(get_log_level(), "debug");
        assert!(set_log_level("info,voltage=bogus").is_err());
        assert_eq!(get_log_level(), "debug");
    }
}
