//! Logging setup for deploykit binaries
//!
//! Output goes to two places at once:
//! - the console, at the configured level, in the configured format
//! - optionally a log file, at debug level for deploykit crates, so a run can
//!   be followed with `tail -f` and reviewed afterwards
//!
//! `init` is called once at program start. The returned [`LogGuard`] must be
//! kept alive until exit; dropping it flushes the file writer.
//!
//! ```rust,no_run
//! use deploykit_core::logging::{self, LogOptions};
//!
//! let _guard = logging::init(&LogOptions::default())?;
//! let _span = logging::deployment_span("gcp-mig-20250101-120000").entered();
//! # Ok::<(), deploykit_core::error::LoggingError>(())
//! ```

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{Span, info_span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as layer_fmt};

use crate::config::Config;
use crate::error::LoggingError;

const CONSOLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const FILE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const OWN_CRATES: [&str; 4] = [
    "deploykit",
    "deploykit_core",
    "deploykit_exec",
    "deploykit_state",
];

/// Console output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
            LogFormat::Compact => "compact",
        };
        f.write_str(name)
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

/// Logging options
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    /// Console level filter, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
    /// Also write a detailed log here (truncated on start)
    pub log_file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl LogOptions {
    /// Options from configuration, with command-line overrides taking precedence
    #[must_use]
    pub fn from_config(
        config: &Config,
        level_override: Option<&str>,
        format_override: Option<LogFormat>,
    ) -> Self {
        Self {
            level: level_override.map_or_else(|| config.logging.level.clone(), str::to_string),
            format: format_override.unwrap_or(config.logging.format),
            log_file: None,
        }
    }

    /// Enable the file output
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Keeps the file writer alive; drop at exit to flush
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LogGuard {
    /// Path of the log file, when file output is enabled
    #[must_use]
    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

/// Install the global subscriber
///
/// # Errors
/// Returns error if the log file cannot be created or a subscriber is
/// already installed
pub fn init(options: &LogOptions) -> Result<LogGuard, LoggingError> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.level));
    let timer = ChronoLocal::new(CONSOLE_TIME_FORMAT.to_string());

    let console: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        LogFormat::Json => layer_fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(false)
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(console_filter)
            .boxed(),
        LogFormat::Pretty => layer_fmt::layer()
            .pretty()
            .with_timer(timer)
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .with_filter(console_filter)
            .boxed(),
        LogFormat::Compact => layer_fmt::layer()
            .compact()
            .with_timer(timer)
            .with_target(false)
            .with_filter(console_filter)
            .boxed(),
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![console];
    let mut worker_guard = None;

    if let Some(path) = &options.log_file {
        let file = create_log_file(path)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        worker_guard = Some(guard);

        layers.push(
            layer_fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(ChronoLocal::new(FILE_TIME_FORMAT.to_string()))
                .with_target(true)
                .with_filter(EnvFilter::new(file_directives(&options.level)))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if let Some(path) = &options.log_file {
        tracing::info!(path = %path.display(), "logging to file");
    }

    Ok(LogGuard {
        _file: worker_guard,
        log_file: options.log_file.clone(),
    })
}

fn create_log_file(path: &Path) -> Result<File, LoggingError> {
    let to_error = |source: std::io::Error| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(to_error)?;
    }

    File::create(path).map_err(to_error)
}

/// File filter: the console level for everything, debug for our own crates
fn file_directives(level: &str) -> String {
    let mut directives = vec![level.to_string()];
    directives.extend(OWN_CRATES.iter().map(|krate| format!("{krate}=debug")));
    directives.join(",")
}

/// Span for everything done on behalf of one deployment
pub fn deployment_span(deployment_id: &str) -> Span {
    info_span!("deployment", deployment_id = deployment_id)
}

/// Span for checks against one instance
pub fn host_span(role: &str, host: &str) -> Span {
    info_span!("host", role = role, host = host)
}
