//! `tracing` subscriber setup for the worker binaries and harnesses.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::SoulScrollError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = SoulScrollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(SoulScrollError::InvalidArgument(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Subscriber settings.
///
/// `RUST_LOG` wins over `level` unless an explicit `directives` string is set.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub directives: Option<String>,
    /// Emit file and line for each event.
    pub with_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            directives: None,
            with_location: false,
        }
    }
}

impl LogConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// e.g. `"soulscroll_sw=debug,reqwest=warn"`.
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    fn filter(&self) -> crate::Result<EnvFilter> {
        match self.directives {
            Some(ref directives) => EnvFilter::try_new(directives).map_err(|e| {
                SoulScrollError::config_with_source(format!("bad log directives '{}'", directives), e)
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> crate::Result<()> {
    let registry = tracing_subscriber::registry().with(config.filter()?);

    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_file(config.with_location)
                    .with_line_number(config.with_location),
            )
            .try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().flatten_event(true)).try_init(),
    };

    installed.map_err(|e| SoulScrollError::config_with_source("a global subscriber is already set", e))
}
