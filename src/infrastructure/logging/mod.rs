use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static LOG_FILE_WRITER: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
static LOGGER_INITIALIZED: Mutex<bool> = Mutex::new(false);

const DEFAULT_RETENTION_HOURS: u64 = 72;
const SECONDS_PER_HOUR: u64 = 3_600;
const ENABLE_LOGS_ENV: &str = "PM_ENABLE_LOGS";
const RETENTION_ENV: &str = "PM_LOG_RETENTION_HOURS";

#[derive(Debug)]
struct LoggingConfig {
    file_logging_enabled: bool,
    retention: Duration,
    log_dir: PathBuf,
    deferred_warnings: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pm")
        .join("logs")
}

/// The file this process is logging to, if file logging is on.
pub fn current_log_path() -> Option<PathBuf> {
    lock(&LOG_PATH).clone()
}

fn log_file_name() -> String {
    format!("pm-{}.log", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Initialize logging to stderr and, when enabled, a timestamped file.
pub fn init_logging() {
    {
        let mut initialized = lock(&LOGGER_INITIALIZED);
        if *initialized {
            return;
        }
        *initialized = true;
    }
    let mut config = resolve_logging_config();

    if config.file_logging_enabled {
        if let Err(e) = fs::create_dir_all(&config.log_dir) {
            config.deferred_warnings.push(format!(
                "Failed to create log directory {}: {e}",
                config.log_dir.display()
            ));
        } else {
            let cleanup_warnings = cleanup_old_logs(&config.log_dir, config.retention);
            config.deferred_warnings.extend(cleanup_warnings);

            let candidate = config.log_dir.join(log_file_name());
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&candidate)
            {
                Ok(file) => {
                    *lock(&LOG_FILE_WRITER) = Some(BufWriter::new(file));
                    *lock(&LOG_PATH) = Some(candidate);
                }
                Err(e) => {
                    config.deferred_warnings.push(format!(
                        "Failed to open log file {}: {e}. Continuing with console logging only.",
                        candidate.display()
                    ));
                }
            }
        }
    }

    let mut builder = Builder::new();
    if cfg!(test) {
        builder.is_test(true);
    }

    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else if config.file_logging_enabled {
        builder.filter_module("pm_sessions", LevelFilter::Debug);
        builder.filter_module("pm", LevelFilter::Debug);
        builder.filter_level(LevelFilter::Warn);
    } else {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(move |buf, record| {
        let level_str = match record.level() {
            log::Level::Error => "ERROR",
            log::Level::Warn => "WARN ",
            log::Level::Info => "INFO ",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        let log_line = format!(
            "[{} {} {}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level_str,
            record.target(),
            record.args()
        );

        writeln!(buf, "{log_line}")?;

        if let Some(writer) = lock(&LOG_FILE_WRITER).as_mut() {
            let _ = writeln!(writer, "{log_line}");
            let _ = writer.flush();
        }

        Ok(())
    });

    // stdout is reserved for command output
    builder.target(env_logger::Target::Stderr);

    if let Err(e) = builder.try_init() {
        eprintln!("Logger already installed: {e}");
        return;
    }

    log::info!("pm v{} starting (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    match current_log_path() {
        Some(path) => log::info!("Log file: {}", path.display()),
        None => log::debug!("File logging disabled"),
    }

    for warning in config.deferred_warnings {
        log::warn!("{warning}");
    }
}

fn resolve_logging_config() -> LoggingConfig {
    let mut deferred_warnings = Vec::new();

    let retention = match env::var(RETENTION_ENV) {
        Ok(value) => match value.parse::<u64>() {
            Ok(hours) => Duration::from_secs(hours.saturating_mul(SECONDS_PER_HOUR)),
            Err(_) => {
                deferred_warnings.push(format!(
                    "Invalid {RETENTION_ENV} value '{value}'. Using default {DEFAULT_RETENTION_HOURS} hours."
                ));
                Duration::from_secs(DEFAULT_RETENTION_HOURS * SECONDS_PER_HOUR)
            }
        },
        Err(_) => Duration::from_secs(DEFAULT_RETENTION_HOURS * SECONDS_PER_HOUR),
    };

    let mut file_logging_enabled = cfg!(debug_assertions);
    if let Ok(value) = env::var(ENABLE_LOGS_ENV) {
        match parse_bool(&value) {
            Some(flag) => file_logging_enabled = flag,
            None => deferred_warnings.push(format!(
                "Invalid {ENABLE_LOGS_ENV} value '{value}'. Expected a boolean. Falling back to default ({file_logging_enabled})."
            )),
        }
    }

    LoggingConfig {
        file_logging_enabled,
        retention,
        log_dir: get_log_dir(),
        deferred_warnings,
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn cleanup_old_logs(log_dir: &Path, retention: Duration) -> Vec<String> {
    if retention.is_zero() {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return warnings;
    };
    let Ok(entries) = fs::read_dir(log_dir) else {
        return warnings;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }

        match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) if modified < cutoff => {
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!(
                        "Failed to delete old log file {}: {e}",
                        path.display()
                    ));
                }
            }
            Ok(_) => {}
            Err(_) => warnings.push(format!(
                "Unable to determine age for log file {}",
                path.display()
            )),
        }
    }

    warnings
}
