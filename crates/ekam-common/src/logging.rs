//! `tracing` subscriber setup for Ekam binaries.
//!
//! Filter precedence: an explicit [`LogConfig::filter`], then `RUST_LOG`, then
//! the configured level with HTTP client internals capped at `warn`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::EkamError;

/// Crates whose debug output drowns out the controller's own.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = EkamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(EkamError::InvalidArgument(format!(
                "unknown log format '{other}' (expected pretty, compact or json)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Print file and line of each event.
    pub include_location: bool,
    /// Log span enter/close, useful when following one request through the controller.
    pub include_span_events: bool,
    /// Full `EnvFilter` directive string, e.g. `"ekam_sw=trace,ekam_net=debug"`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Debug level with locations and span events.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Directives used when neither a custom filter nor `RUST_LOG` applies.
    pub fn default_directives(&self) -> String {
        let level = self.level.to_string().to_lowercase();
        let mut directives = vec![level];
        if self.level > Level::WARN {
            directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
        }
        directives.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, EkamError> {
        if let Some(ref directives) = self.filter {
            return EnvFilter::try_new(directives).map_err(|e| {
                EkamError::InvalidArgument(format!("bad log filter '{directives}': {e}"))
            });
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directives())))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(false)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(span_events)
                .boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Fails on a malformed custom filter or when a subscriber is already set.
pub fn init_logging(config: LogConfig) -> Result<(), EkamError> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(|e| EkamError::config(format!("failed to install log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse_is_case_insensitive() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(EkamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_default_directives_quiet_http_internals() {
        let directives = LogConfig::default().default_directives();
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.contains("hyper=warn"));
    }

    #[test]
    fn test_warn_level_needs_no_caps() {
        let directives = LogConfig::default().with_level(Level::WARN).default_directives();
        assert_eq!(directives, "warn");
    }

    #[test]
    fn test_bad_custom_filter_is_rejected() {
        let config = LogConfig::default().with_filter("ekam_sw=loud");
        assert!(matches!(
            config.env_filter(),
            Err(EkamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(LogConfig::verbose());
        assert!(init_logging(LogConfig::default().with_format(LogFormat::Json)).is_err());
    }
}
