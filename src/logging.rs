//! Tracing setup
//!
//! Stream Deck swallows plugin stdout, so besides the usual fmt layer a
//! second layer appends to `M365Deck/m365-deck.log` in the user data
//! directory. File output is off until [`set_file_logging`] turns it on.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_DIR_NAME: &str = "M365Deck";
const LOG_FILE_NAME: &str = "m365-deck.log";
const DEFAULT_DIRECTIVES: &str = "info,m365_deck_lib=debug";

static FILE_LOGGING_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_FILE: Lazy<Arc<Mutex<Option<std::fs::File>>>> = Lazy::new(|| {
    let file = open_log_file().or_else(|_| open_fallback_log_file()).ok();
    Arc::new(Mutex::new(file))
});

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging() {
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer()),
        )
        .try_init();
}

/// `RUST_LOG` when set, otherwise info plus debug for this crate
fn env_filter(rust_log: Option<String>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(tracing::Level::INFO.into());
    match rust_log.filter(|value| !value.trim().is_empty()) {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.parse_lossy(DEFAULT_DIRECTIVES),
    }
}

pub fn set_file_logging(enabled: bool) {
    FILE_LOGGING_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn file_logging_enabled() -> bool {
    FILE_LOGGING_ENABLED.load(Ordering::Relaxed)
}

pub fn log_file_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(LOG_DIR_NAME).join(LOG_FILE_NAME))
}

fn file_writer() -> PluginLogWriter {
    PluginLogWriter {
        file: LOG_FILE.clone(),
    }
}

fn open_log_file() -> io::Result<std::fs::File> {
    let path = log_file_path()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Missing data directory"))?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn open_fallback_log_file() -> io::Result<std::fs::File> {
    let path = std::env::temp_dir().join(LOG_FILE_NAME);
    OpenOptions::new().create(true).append(true).open(path)
}

#[derive(Clone)]
struct PluginLogWriter {
    file: Arc<Mutex<Option<std::fs::File>>>,
}

impl<'a> MakeWriter<'a> for PluginLogWriter {
    type Writer = PluginLogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        PluginLogWriterGuard {
            file: self.file.clone(),
            enabled: &FILE_LOGGING_ENABLED,
        }
    }
}

struct PluginLogWriterGuard {
    file: Arc<Mutex<Option<std::fs::File>>>,
    enabled: &'static AtomicBool,
}

impl PluginLogWriterGuard {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Write for PluginLogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.enabled() {
            return Ok(buf.len());
        }

        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        match self.file.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}
