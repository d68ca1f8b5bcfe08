//! Process-wide tracing setup.

use std::{io::IsTerminal, sync::OnceLock};

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::LoggingConfig;

static INITIALISED: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("logging has already been initialised")]
    AlreadyInitialised,
    #[error("invalid log filter '{directive}': {source}")]
    Filter {
        directive: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(String),
}

/// Keeps the background log writer alive. Dropping it flushes the file.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber: an [`EnvFilter`] taken from `RUST_LOG` or
/// `config.level`, a console layer and a daily-rotated file layer under
/// `config.directory`.
///
/// A failed call installs nothing and may be retried.
///
/// # Errors
///
/// Fails once logging is set up, on an unparsable level, or when another
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    if INITIALISED.get().is_some() {
        return Err(LoggingError::AlreadyInitialised);
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|source| LoggingError::Filter {
            directive: config.level.clone(),
            source,
        })?,
    };

    let console = config.console.then(|| {
        fmt::layer()
            .with_target(true)
            .with_ansi(std::io::stdout().is_terminal())
    });

    let (file, guard) = match config.file_output() {
        Some((directory, file_name)) => {
            let appender = rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::Subscriber(e.to_string()))?;

    INITIALISED
        .set(())
        .map_err(|_| LoggingError::AlreadyInitialised)?;
    Ok(LoggingGuard { _file: guard })
}
