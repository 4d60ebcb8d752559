use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Log lines go to stderr, and to an append-only file when one is given.
#[derive(Clone)]
pub struct LogMakeWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl<'a> MakeWriter<'a> for LogMakeWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
        }
    }
}

pub struct LogWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
        {
            f.write_all(buf)?;
        }
        std::io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
        {
            f.flush()?;
        }
        std::io::stderr().flush()
    }
}

impl LogMakeWriter {
    pub fn new(log_file: Option<&Path>) -> Result<Self> {
        let file = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                Some(Arc::new(Mutex::new(f)))
            }
            None => None,
        };
        Ok(Self { file })
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(level: Level, log_file: Option<&Path>) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(LogMakeWriter::new(log_file)?)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    Ok(())
}
