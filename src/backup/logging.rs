//! Log output: stderr plus the per-run log file.
//!
//! The subscriber is installed before the run directory exists, so the file
//! layer writes through a [`RunLog`] handle that starts out empty and gets its
//! file attached once the run context has been created.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Default)]
pub struct RunLog {
    file: Arc<Mutex<Option<File>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the log file at `path`; later log lines are appended to it.
    pub fn attach<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::from)
            .with_msg(format!("Open run log {:?} failed", path))?;
        *self.lock() = Some(file);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    /// Flushes and detaches the file so it can be uploaded as a whole.
    pub fn detach(&self) -> Option<File> {
        let mut guard = self.lock();
        if let Some(file) = guard.as_mut() {
            let _ = file.flush();
            let _ = file.sync_all();
        }
        guard.take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        // a panic while holding the lock leaves the file usable
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for RunLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs the global subscriber: `RUST_LOG` (default `info`) filtering an
/// ANSI stderr layer and a plain layer into `run_log`.
pub fn init_tracing(run_log: &RunLog) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(run_log.clone()),
        )
        .try_init()
        .map_err(|e| Error::config(format!("Install log subscriber failed: {e}")))
}
