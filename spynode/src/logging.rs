//! Log output for the spynode binary and embedding applications.
//!
//! Console output goes to stderr. File output is written to `spynode.log` in the configured
//! directory; the log of the previous run is archived next to it under a timestamped name.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

const ARCHIVE_PREFIX: &str = "spynode.";
const ACTIVE_LOG_NAME: &str = "spynode.log";

/// Keeps the non-blocking file writer alive. Buffered lines are flushed when dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter. `None` uses `RUST_LOG`, then INFO.
    pub level: Option<LevelFilter>,
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived logs beyond this count are deleted, oldest first.
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
            file: None,
        }
    }
}

/// Parses a level name as used by the `LOG_LEVEL` setting.
pub fn parse_level(level: &str) -> LoggingResult<LevelFilter> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::SubscriberInit(format!("unknown log level '{}'", level)))
}

/// Console only logging.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Installs the global subscriber.
///
/// With neither console nor file output the call succeeds without installing anything and
/// the tracing macros stay no-ops.
///
/// # Examples
///
/// ```no_run
/// use spynode::logging::{init_logging, LogFileConfig, LoggingConfig};
/// use tracing::level_filters::LevelFilter;
///
/// let _guard = init_logging(LoggingConfig {
///     level: Some(LevelFilter::DEBUG),
///     console: false,
///     file: Some(LogFileConfig {
///         log_dir: "./spynode-data/logs".into(),
///         max_files: 10,
///     }),
/// })
/// .unwrap();
/// ```
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, guard) = match config.file {
        Some(ref file_config) => {
            let (writer, guard) = open_log_file(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config
        .console
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: guard,
    })
}

fn open_log_file(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_previous_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(ACTIVE_LOG_NAME))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Renames the previous run's log to `spynode.YYYY-MM-DD.HHMMSS.log`, using its
/// modification time.
fn archive_previous_log(log_dir: &Path) -> LoggingResult<()> {
    let active = log_dir.join(ACTIVE_LOG_NAME);
    if !active.exists() {
        return Ok(());
    }

    let stamp =
        modified_time(&active).unwrap_or_else(Local::now).format("%Y-%m-%d.%H%M%S").to_string();
    let target = std::iter::once(format!("{}{}.log", ARCHIVE_PREFIX, stamp))
        .chain((1..=999).map(|i| format!("{}{}-{}.log", ARCHIVE_PREFIX, stamp, i)))
        .map(|name| log_dir.join(name))
        .find(|path| !path.exists())
        .ok_or_else(|| LoggingError::RotationFailed("too many logs with one timestamp".into()))?;

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn modified_time(path: &Path) -> Option<DateTime<Local>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::from(modified))
}

fn is_archive(name: &str) -> bool {
    name != ACTIVE_LOG_NAME && name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".log")
}

fn prune_archives(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<_> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("failed to read log dir: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_archive))
        .collect();

    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    let excess = archives.len() - max_files;
    for entry in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(entry.path()) {
            tracing::warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
        }
    }
    Ok(())
}
