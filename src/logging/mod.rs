//! Tracing setup shared by the library and `qwenforge-chat`
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the binary (or to a test that wants to see the output). Console records go
//! to stderr so streamed tokens on stdout stay clean.
//!
//! Variables read by [`init_logging_from_env`], in order of precedence:
//!
//! - `RUST_LOG`: full filter directive, e.g. `qwenforge::model=trace,info`
//! - `QWENFORGE_LOG_LEVEL`: one of error, warn, info, debug, trace
//! - `QWENFORGE_LOG_FORMAT`: `human` or `json`
//! - `QWENFORGE_LOG_FILE`: append JSON records to this path as well

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INSTALLED: OnceCell<()> = OnceCell::new();

const ENV_LEVEL: &str = "QWENFORGE_LOG_LEVEL";
const ENV_FORMAT: &str = "QWENFORGE_LOG_FORMAT";
const ENV_FILE: &str = "QWENFORGE_LOG_FILE";

/// Dependencies that are chatty at debug level
const QUIET_TARGETS: &[&str] = &["tokenizers=warn"];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unrecognised log level '{0}'")]
    InvalidLogLevel(String),

    #[error("unrecognised log format '{0}'")]
    InvalidLogFormat(String),

    #[error("bad filter directive: {0}")]
    InvalidFilter(String),

    #[error("cannot open log file '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already set: {0}")]
    InstallFailed(String),
}

/// Verbosity applied to qwenforge's own targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }

    /// Filter directive for this level with noisy dependencies held back
    pub fn directive(self) -> String {
        let mut directive = self.to_string();
        if self >= LogLevel::Debug {
            for quiet in QUIET_TARGETS {
                directive.push(',');
                directive.push_str(quiet);
            }
        }
        directive
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return Err(LoggingError::InvalidLogLevel(s.to_string())),
        };
        Ok(level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact single-line records
    #[default]
    Human,
    /// One JSON object per record
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" | "pretty" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            _ => Err(LoggingError::InvalidLogFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub with_file_info: bool,
    /// Report span durations on close; `forward` and `generate` run in spans
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(self, level: LogLevel) -> Self {
        Self { level, ..self }
    }

    pub fn with_format(self, format: LogFormat) -> Self {
        Self { format, ..self }
    }

    pub fn with_file_info(self, with_file_info: bool) -> Self {
        Self {
            with_file_info,
            ..self
        }
    }

    pub fn with_span_events(self, with_span_events: bool) -> Self {
        Self {
            with_span_events,
            ..self
        }
    }

    pub fn with_log_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            log_file: Some(path.into()),
            ..self
        }
    }

    /// Read the `QWENFORGE_LOG_*` variables. Unparseable values are an error
    /// here; [`init_logging_default`] swallows them.
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        let mut config = Self::new();
        if let Some(level) = lookup(ENV_LEVEL) {
            config.level = level.parse()?;
        }
        if let Some(format) = lookup(ENV_FORMAT) {
            config.format = format.parse()?;
        }
        config.log_file = lookup(ENV_FILE).filter(|p| !p.is_empty()).map(PathBuf::from);
        Ok(config)
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match std::env::var("RUST_LOG") {
            Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(&directive)
                .map_err(|e| LoggingError::InvalidFilter(e.to_string())),
            _ => EnvFilter::try_new(self.level.directive())
                .map_err(|e| LoggingError::InvalidFilter(e.to_string())),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn console_layer(&self) -> BoxedLayer {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(self.with_file_info)
            .with_line_number(self.with_file_info)
            .with_span_events(self.span_events());
        match self.format {
            LogFormat::Human => layer.compact().boxed(),
            LogFormat::Json => layer.json().with_current_span(false).boxed(),
        }
    }

    fn file_layer(&self, path: &Path) -> Result<BoxedLayer, LoggingError> {
        let file = open_append(path)?;
        Ok(tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(self.span_events())
            .boxed())
    }

    fn install(&self) -> Result<(), LoggingError> {
        let mut layers = vec![self.console_layer()];
        if let Some(path) = &self.log_file {
            layers.push(self.file_layer(path)?);
        }
        tracing_subscriber::registry()
            .with(layers)
            .with(self.filter()?)
            .try_init()
            .map_err(|e| LoggingError::InstallFailed(e.to_string()))
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    let wrap = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(wrap)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(wrap)
}

/// Best-effort setup for binaries: falls back to defaults when the
/// environment is malformed and never fails.
pub fn init_logging_default() {
    if init_logging_from_env().is_err() {
        init_with_config(&LoggingConfig::default());
    }
}

/// Install a subscriber configured from the environment.
///
/// Only the first successful call has an effect.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    if is_initialized() {
        return Ok(());
    }
    let config = LoggingConfig::from_env()?;
    INSTALLED.get_or_try_init(|| config.install()).map(|_| ())
}

/// Install a subscriber for `config`, ignoring a subscriber set elsewhere.
pub fn init_with_config(config: &LoggingConfig) {
    let _ = INSTALLED.get_or_try_init(|| config.install());
}

pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}
