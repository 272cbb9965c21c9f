use std::path::Path;
use tracing::Level;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shared_config::LoggingConfig;

/// Initialize the tracing subscriber from configuration (§9.1): stdout
/// always, plus an optional daily-rotating file layer.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let _level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.file {
        Some(file_path) => {
            let path = Path::new(file_path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let filename = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("fleet-scheduler.log"));

            let file_appender = rolling::daily(directory, filename);
            let (file_writer, guard) = non_blocking(file_appender);
            // Leaked deliberately: the guard must outlive the process for
            // buffered file writes to flush, and this runs once at startup.
            std::mem::forget(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(file_writer))
                .with(fmt::layer())
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    }

    tracing::info!(
        level = %config.level,
        file = ?config.file,
        "logging initialized"
    );

    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level, Box<dyn std::error::Error>> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!("invalid log level: {level}").into()),
    }
}

/// Structured logging with device context, matching the call-site shape the
/// rest of the crate uses for per-device events.
#[macro_export]
macro_rules! log_device_event {
    ($level:ident, serial = $serial:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::$level!(
            serial = %$serial,
            $($key = $value),*
        );
    };
    ($level:ident, serial = $serial:expr, $message:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::$level!(
            serial = %$serial,
            $($key = $value),*,
            $message
        );
    };
}

/// Structured logging with Command context.
#[macro_export]
macro_rules! log_command_event {
    ($level:ident, command_id = $command_id:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::$level!(
            command_id = %$command_id,
            $($key = $value),*
        );
    };
}
