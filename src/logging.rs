//! Logging setup for Helios
//!
//! One `tracing` subscriber with an optional daily rotated log file and an
//! optional console writer, each with its own level. Components log through
//! a `StructuredLogger` that carries the device context.

mod level;
mod structured;

pub use level::parse_log_level;
pub use structured::{LogContext, StructuredLogger, get_logger, get_logger_with_context};

use crate::config::LoggingConfig;
use crate::error::{HeliosError, Result};
use level::min_level;
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Flushes the file writer when the process exits
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Outcome of the first `init_logging` call; later calls return it again
static INIT: OnceCell<std::result::Result<(), String>> = OnceCell::new();

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Install the global subscriber. Only the first call has an effect.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT.get_or_init(|| install(config).map_err(|e| e.to_string()))
        .clone()
        .map_err(HeliosError::config)
}

fn install(config: &LoggingConfig) -> Result<()> {
    let base = parse_log_level(&config.level)?;
    let override_or_base = |level: &Option<String>| {
        level
            .as_deref()
            .and_then(|s| parse_log_level(s).ok())
            .unwrap_or(base)
    };
    let console_level = override_or_base(&config.console_level);
    let file_level = override_or_base(&config.file_level);

    let file_layer = if file_logging_enabled(config) {
        let appender = rolling::Builder::new()
            .rotation(rolling::Rotation::DAILY)
            .filename_prefix("helios")
            .filename_suffix("log")
            .max_log_files(config.backup_count.max(1) as usize)
            .build(log_directory(&config.file))
            .map_err(|e| HeliosError::io(format!("Failed to create log file appender: {}", e)))?;
        let (writer, guard) = non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(output_layer(writer, config.json_format, file_level))
    } else {
        None
    };
    // Without a file there is nowhere else to log to
    let console_layer = (config.console_output || file_layer.is_none())
        .then(|| output_layer(std::io::stdout, config.json_format, console_level));

    let verbose = if file_layer.is_some() {
        min_level(console_level, file_level)
    } else {
        console_level
    };
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| HeliosError::config(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!(
        "Logging initialized - console: {:?}, file: {}",
        console_level,
        if config.file.is_empty() { "off" } else { config.file.as_str() }
    );
    Ok(())
}

/// `RUST_LOG` wins; otherwise our crate at `level` and chatty dependencies at warn
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("helios={},zbus=warn,reqwest=warn,hyper=warn", level).into()
    })
}

fn file_logging_enabled(config: &LoggingConfig) -> bool {
    !cfg!(test) && !config.file.is_empty() && std::env::var_os("HELIOS_DISABLE_FILE_LOG").is_none()
}

/// A path with an extension names a file; its directory holds the rotated logs
fn log_directory(file: &str) -> &Path {
    let path = Path::new(file);
    match path.parent() {
        Some(parent) if path.extension().is_some() => parent,
        _ => path,
    }
}

fn output_layer<S, W>(writer: W, json: bool, level: Level) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    let filter = LevelFilter::from_level(level);
    if json {
        layer.json().with_filter(filter).boxed()
    } else {
        layer.with_filter(filter).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_renders_in_fixed_order() {
        let logger = get_logger_with_context(
            LogContext::new("sunspec")
                .with_location("192.168.1.20:1".to_string())
                .with_device("abc")
                .with_field("unit", "126".to_string()),
        );
        assert_eq!(
            logger.fields(),
            "component=sunspec,device=abc,location=192.168.1.20:1,unit=126"
        );
        assert_eq!(get_logger("discovery").fields(), "component=discovery");
    }

    #[test]
    fn repeated_init_is_harmless() {
        let config = LoggingConfig::default();
        let first = init_logging(&config).is_ok();
        assert_eq!(init_logging(&config).is_ok(), first);

        let logger = get_logger("test_component");
        assert_eq!(logger.context.component, "test_component");
        logger.info("info");
        logger.trace("trace");
    }

    #[test]
    fn log_directory_of_file_path() {
        assert_eq!(log_directory("/data/log/helios.log"), Path::new("/data/log"));
        assert_eq!(log_directory("/data/log"), Path::new("/data/log"));
    }
}
