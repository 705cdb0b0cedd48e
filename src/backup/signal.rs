//! SIGINT/SIGTERM handling.
//!
//! The handler only flips a shared flag. Running pipelines poll it and kill
//! their children, the orchestrator checks it between states, and the run then
//! fails through its normal finalization path.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a signal arrived.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Installs the process-wide handler. Must be called at most once.
    pub fn install_signal_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if !token.is_cancelled() {
                eprintln!("Received termination signal, aborting backup run...");
            }
            token.cancel();
        })
        .map_err(|e| Error::from(std::io::Error::other(e.to_string())))
    }
}
