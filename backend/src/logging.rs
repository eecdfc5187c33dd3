//! Logging init: one tracing pipeline writing to a log file under the data
//! directory, falling back to stderr when the file is unavailable.

use std::fs;
use std::io;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::AppError;

/// Writer that is either the log file or stderr (used when the file handle
/// cannot be cloned mid-run).
enum FileOrStderr {
    File(std::fs::File),
    Stderr,
}

impl io::Write for FileOrStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileOrStderr::File(f) => f.write(buf),
            FileOrStderr::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileOrStderr::File(f) => f.flush(),
            FileOrStderr::Stderr => io::stderr().lock().flush(),
        }
    }
}

struct FileMakeWriter(std::fs::File);

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileOrStderr;

    fn make_writer(&'a self) -> Self::Writer {
        self.0
            .try_clone()
            .map(FileOrStderr::File)
            .unwrap_or(FileOrStderr::Stderr)
    }
}

/// Initialize structured logging into `<data_dir>/logs/aster.log`, appending
/// across runs. Returns Err when the log directory is unwritable so the
/// caller can fall back to `init_stderr`.
pub fn init(config: &AppConfig) -> Result<(), AppError> {
    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let writer: BoxMakeWriter = BoxMakeWriter::new(FileMakeWriter(file));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .init();

    tracing::info!("Logging initialized at {}", log_path.display());
    Ok(())
}

/// Stderr-only logging, for tests, dev runs, and the file-init failure path.
pub fn init_stderr(config: &AppConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(true)
        .init();
}

fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()))
}
