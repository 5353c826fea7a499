//! Logging and diagnostics for the storage and transform engines.
//!
//! Everything in the crate logs through the `log` facade. Hosts that do not
//! bring their own logger can call [`init_logging`] once at startup; the
//! `log_metric!` macro emits structured key/value lines at `debug` level so
//! chunking and fan-out decisions can be traced without a debugger.

use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Once;

use log::LevelFilter;

use crate::config::LoggingConfig;
use crate::error::TabularError;

/// Logs a structured key-value metric line at `debug` level.
///
/// # Example
/// ```
/// use tabulon::log_metric;
/// let rows = 1024;
/// log_metric!("event"="split", "rows"=&rows);
/// ```
#[macro_export]
macro_rules! log_metric {
    ($($key:literal = $value:expr),+ $(,)?) => {
        if $crate::__log::log_enabled!($crate::__log::Level::Debug) {
            let mut parts = Vec::new();
            $(
                parts.push(format!("\"{}\": \"{}\"", $key, $value));
            )+
            $crate::__log::debug!("TABULON_METRIC: {{ {} }}", parts.join(", "));
        }
    };
}

static INIT_LOGGER: Once = Once::new();

/// Installs an `env_logger` backend configured from `config`.
///
/// Only the first call has any effect. If another logger is already installed
/// the call is a silent no-op. An unknown level name is an `InvalidArgument`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TabularError> {
    let level = match &config.level {
        Some(name) => LevelFilter::from_str(name).map_err(|_| {
            TabularError::InvalidArgument(format!("unknown log level '{}'", name))
        })?,
        None => LevelFilter::Info,
    };

    let target = match &config.log_file {
        Some(path) => Some(OpenOptions::new().append(true).create(true).open(path)?),
        None => None,
    };

    INIT_LOGGER.call_once(move || {
        let mut builder = env_logger::Builder::new();

        builder.is_test(false);
        builder.filter_level(level);

        // Just the level and the message.
        builder.format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "[{}] {}", record.level(), record.args())?;
            buf.flush()?;
            Ok(())
        });

        if let Some(file) = target {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }

        let _ = builder.try_init();
    });
    Ok(())
}
