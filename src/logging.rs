//! Subscriber setup for applications that do not bring their own.
//!
//! The engine only emits `tracing` events. [`init`] installs a global
//! subscriber scoped to the harvest crates: their events pass at the
//! configured level, everything else at `warn`. `RUST_LOG` overrides both.
//! Thread names are shown by default so events from an acquisition thread
//! (`harvest-acq-<device>`) can be told apart.
//!
//! ```no_run
//! use harvest::{config::EngineConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load()?;
//! logging::init_from_config(&config)?;
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use harvest_core::{HarvestError, HarvestResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Crates whose events follow the configured level.
const HARVEST_TARGETS: [&str; 4] = ["harvest", "harvest_core", "harvest_transport", "harvest_pool"];

/// Level for events from every other crate.
const FOREIGN_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, colored.
    #[default]
    Pretty,
    /// Single line per event, no colors.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Level for the harvest crates.
    pub level: Level,
    pub format: LogFormat,
    /// Log acquisition-thread spans opening and closing.
    pub span_events: bool,
    /// Prefix events with the emitting thread's name.
    pub thread_names: bool,
    /// Include file and line of each event.
    pub source_location: bool,
    /// Color output. Only used by [`LogFormat::Pretty`].
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            thread_names: true,
            source_location: false,
            ansi: true,
        }
    }
}

impl LogSettings {
    pub fn from_engine_config(config: &EngineConfig) -> HarvestResult<Self> {
        Ok(Self {
            level: parse_level(&config.log_level)?,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    #[must_use]
    pub fn ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    #[must_use]
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = vec![FOREIGN_LEVEL.to_string()];
        directives.extend(HARVEST_TARGETS.iter().map(|t| format!("{}={}", t, level)));
        directives.join(",")
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = tracing_subscriber::fmt::layer()
            .with_span_events(spans)
            .with_thread_names(self.thread_names)
            .with_file(self.source_location)
            .with_line_number(self.source_location);
        match self.format {
            LogFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            LogFormat::Compact => base.compact().with_ansi(false).boxed(),
            LogFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

pub fn init_from_config(config: &EngineConfig) -> HarvestResult<()> {
    init(&LogSettings::from_engine_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` if one is already installed, so tests can call it
/// freely.
pub fn init(settings: &LogSettings) -> HarvestResult<()> {
    let installed = tracing_subscriber::registry()
        .with(settings.layer().with_filter(settings.filter()))
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(HarvestError::Configuration(format!(
            "cannot install log subscriber: {}",
            e
        ))),
    }
}

fn parse_level(level: &str) -> HarvestResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        HarvestError::Configuration(format!(
            "unknown log level '{}' (expected trace, debug, info, warn or error)",
            level
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_directives_scope_configured_level_to_harvest() {
        let settings = LogSettings::default().level(Level::DEBUG);
        let directives = settings.directives();
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("harvest=debug"));
        assert!(directives.contains("harvest_transport=debug"));
    }

    #[test]
    fn test_settings_from_engine_config() {
        let config = EngineConfig {
            log_level: "error".into(),
            ..Default::default()
        };
        let settings = LogSettings::from_engine_config(&config).unwrap();
        assert_eq!(settings.level, Level::ERROR);
        assert!(settings.thread_names);

        let bad = EngineConfig {
            log_level: "chatty".into(),
            ..Default::default()
        };
        assert!(LogSettings::from_engine_config(&bad).is_err());
    }

    #[test]
    fn test_init_twice_is_ok() {
        let settings = LogSettings::default().format(LogFormat::Compact);
        assert!(init(&settings).is_ok());
        assert!(init(&settings.clone().format(LogFormat::Json)).is_ok());
    }
}
