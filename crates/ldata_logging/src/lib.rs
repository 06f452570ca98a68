//! Logging setup shared by the LDATA binaries.
//!
//! One `tracing` subscriber with two layers: a size-rotated log file under
//! `$LDATA_HOME/logs` and human output on stderr.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "ldata_trigger=info,ldata_watch=info";
const VERBOSE_FILTER: &str = "ldata_trigger=debug,ldata_watch=debug";
const KEEP_ROTATED: usize = 4;
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Debug-level output for the LDATA crates on stderr
    pub verbose: bool,
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = logs_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    let file = RotatingLog::open(&dir, config.app_name, ROTATE_AT_BYTES, KEEP_ROTATED)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter = env_filter(DEFAULT_FILTER);
    let stderr_filter = if config.verbose {
        env_filter(VERBOSE_FILTER)
    } else {
        env_filter(DEFAULT_FILTER)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(stderr_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// `RUST_LOG` when set, otherwise `fallback`.
fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// LDATA home directory: `$LDATA_HOME`, else `~/.ldata`.
pub fn ldata_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("LDATA_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".ldata"))
        .ok_or_else(|| anyhow!("Could not determine home directory; set LDATA_HOME"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(ldata_home()?.join("logs"))
}

// ============================================================================
// Size-rotated log file
// ============================================================================

struct LogFile {
    dir: PathBuf,
    stem: String,
    rotate_at: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl LogFile {
    fn path(&self, generation: usize) -> PathBuf {
        log_path(&self.dir, &self.stem, generation)
    }

    /// `app.log` becomes `app.1.log`, `app.1.log` becomes `app.2.log` and so
    /// on; the oldest kept generation is dropped.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let oldest = self.path(self.keep);
        if oldest.exists() {
            fs::remove_file(oldest)?;
        }
        for generation in (0..self.keep).rev() {
            let from = self.path(generation);
            if from.exists() {
                fs::rename(&from, self.path(generation + 1))?;
            }
        }
        self.file = open_append(&self.path(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.keep > 0 && self.written > 0 && self.written + buf.len() as u64 > self.rotate_at {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn log_path(dir: &Path, stem: &str, generation: usize) -> PathBuf {
    match generation {
        0 => dir.join(format!("{}.log", stem)),
        n => dir.join(format!("{}.{}.log", stem, n)),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shareable handle used as a `tracing_subscriber` writer.
#[derive(Clone)]
pub struct RotatingLog {
    inner: Arc<Mutex<LogFile>>,
}

impl RotatingLog {
    pub fn open(dir: &Path, app_name: &str, rotate_at: u64, keep: usize) -> io::Result<Self> {
        let stem: String = app_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = log_path(dir, &stem, 0);
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(LogFile {
                dir: dir.to_path_buf(),
                stem,
                rotate_at,
                keep,
                file,
                written,
            })),
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut LogFile) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        f(&mut file)
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for RotatingLog {
    type Writer = RotatingLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
