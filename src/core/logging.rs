//! Host and extension logging
//!
//! One `tracing` subscriber serves the host and every extension. Extension
//! output is emitted under the [`EXTENSION_TARGET`] target so it can be
//! filtered apart from host records, and every backend call runs inside a
//! [`call_span`] carrying the extension id. Records go through a
//! non-blocking writer to stdout or to a size-capped file with numbered
//! backups.

use crate::core::config::LoggingConfig;
use crate::plugin::{BackendType, Capability};
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target of records written by extensions through their log sink
pub const EXTENSION_TARGET: &str = "extension";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => bail!("Invalid format configuration: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
}

impl LogOutput {
    fn from_config(config: &LoggingConfig) -> Result<Self> {
        match config.output.as_str() {
            "stdout" => Ok(LogOutput::Stdout),
            "file" => config
                .log_file
                .clone()
                .map(LogOutput::File)
                .context("log_file must be specified when output is 'file'"),
            other => bail!("Invalid output configuration: {}", other),
        }
    }
}

/// Keeps the background writer alive; dropping it flushes pending records
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Install the global subscriber described by `config`
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let directives = filter_directives(config)?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
        let format: LogFormat = config.format.parse()?;

        let (writer, guard) = match LogOutput::from_config(config)? {
            LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogOutput::File(path) => {
                tracing_appender::non_blocking(CappedFile::open(&path, config.max_file_size, config.max_backups)?)
            }
        };

        let layer = match format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .boxed(),
            LogFormat::Text => fmt::layer().with_writer(writer).with_target(true).boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::info!(filter = %directives, format = %config.format, output = %config.output, "Logging initialized");
        Ok(Logger { _guard: guard })
    }
}

/// `EnvFilter` directives for the host level plus the optional extension level
pub fn filter_directives(config: &LoggingConfig) -> Result<String> {
    let host = level_name(&config.level)?;
    match config.extension_level.as_deref() {
        Some(level) => Ok(format!("{},{}={}", host, EXTENSION_TARGET, level_name(level)?)),
        None => Ok(host.to_string()),
    }
}

fn level_name(level: &str) -> Result<&'static str> {
    Ok(match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        "off" => "off",
        _ => bail!("Invalid log level: {}", level),
    })
}

/// Span wrapping one backend call
pub fn call_span(extension_id: &str, backend: BackendType, capability: Capability) -> Span {
    tracing::info_span!(
        "extension_call",
        extension_id = %extension_id,
        backend = %backend,
        capability = %capability,
    )
}

/// Log file capped at `max_bytes`; full files shift to `name.1` .. `name.N`
#[derive(Clone)]
pub struct CappedFile {
    inner: Arc<Mutex<CappedState>>,
}

struct CappedState {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl CappedFile {
    /// `backups` is at least one; the config layer rejects zero
    pub fn open(path: &Path, max_bytes: usize, backups: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let file = append(path).with_context(|| format!("Failed to open log file {:?}", path))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(CappedState {
                path: path.to_path_buf(),
                max_bytes: max_bytes as u64,
                backups: backups.max(1),
                file,
                written,
            })),
        })
    }
}

fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

impl CappedState {
    fn roll(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        let _ = std::fs::remove_file(numbered(&self.path, self.backups));
        for n in (1..self.backups).rev() {
            let from = numbered(&self.path, n);
            if from.exists() {
                std::fs::rename(&from, numbered(&self.path, n + 1))?;
            }
        }
        std::fs::rename(&self.path, numbered(&self.path, 1))?;
        self.file = append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if state.written > 0 && state.written + buf.len() as u64 > state.max_bytes {
            state.roll()?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).file.flush()
    }
}
