//! Logging setup shared by the fedisend binaries
//!
//! All output goes to stderr so that stdout stays free for response bodies and
//! journal listings.
//!
//! # Examples
//!
//! ```no_run
//! use libfedisend::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "debug".to_string(), false).init();
//!
//! // Or honour FEDISEND_LOG_FORMAT / FEDISEND_LOG_LEVEL
//! libfedisend::logging::init_default();
//! ```

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_ENV: &str = "FEDISEND_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "FEDISEND_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain lines, no colors
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    /// Forces `debug` unless `RUST_LOG` says otherwise
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Settings from `FEDISEND_LOG_FORMAT` and `FEDISEND_LOG_LEVEL`; text at `warn` otherwise
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "warn".to_string());

        Self::new(format, level, verbose)
    }

    /// Directive used when `RUST_LOG` is unset
    pub fn directive(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.level
        }
    }

    /// Install the global subscriber.
    ///
    /// Returns `false` if one was already installed; the existing one is kept.
    pub fn init(&self) -> bool {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive()));

        let installed = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .try_init(),
        };

        installed.is_ok()
    }
}

/// Initialize logging from the environment
pub fn init_default() -> bool {
    LoggingConfig::from_env(false).init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_parsing_is_case_insensitive() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);

        let error = "syslog".parse::<LogFormat>().unwrap_err();
        assert!(error.contains("Invalid log format: 'syslog'"));
    }

    #[test]
    fn test_log_format_display() {
        assert_eq!(LogFormat::Json.to_string(), "json");
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }

    #[test]
    fn test_verbose_overrides_level() {
        let config = LoggingConfig::new(LogFormat::Text, "error".to_string(), true);
        assert_eq!(config.directive(), "debug");

        let config = LoggingConfig::new(LogFormat::Text, "libfedisend=trace".to_string(), false);
        assert_eq!(config.directive(), "libfedisend=trace");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(LOG_FORMAT_ENV, "json");
        std::env::set_var(LOG_LEVEL_ENV, "info");
        let config = LoggingConfig::from_env(false);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");

        std::env::set_var(LOG_FORMAT_ENV, "bogus");
        std::env::remove_var(LOG_LEVEL_ENV);
        let config = LoggingConfig::from_env(false);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "warn");

        std::env::remove_var(LOG_FORMAT_ENV);
    }

    #[test]
    fn test_second_init_is_refused() {
        let config = LoggingConfig::new(LogFormat::Text, "off".to_string(), false);
        config.init();
        assert!(!config.init());
    }
}
