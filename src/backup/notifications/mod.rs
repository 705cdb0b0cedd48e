//! Status messages and document uploads.
//!
//! Delivery is best-effort: a failed send is logged as a warning and the run
//! carries on. Without transport credentials the [`Notifier`] does nothing.

pub mod telegram;

use crate::backup::result_error::result::Result;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

pub trait Notification: Debug + Send + Sync {
    fn send_status(&self, text: &str) -> Result<()>;

    /// Uploads the file at `path`, streamed from disk.
    fn send_document(&self, path: &Path, caption: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct Notifier {
    transport: Option<Arc<dyn Notification>>,
}

impl Notifier {
    pub fn new<N: Notification + 'static>(transport: N) -> Self {
        Self {
            transport: Some(Arc::new(transport)),
        }
    }

    pub fn from_arc(transport: Arc<dyn Notification>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Returns whether the message was delivered.
    pub fn status(&self, text: &str) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        match transport.send_status(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Status notification failed: {e}");
                false
            }
        }
    }

    /// Returns whether the document was delivered.
    pub fn document(&self, path: &Path, caption: &str) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        tracing::info!("Uploading {:?}", path);
        match transport.send_document(path, caption) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Upload of {:?} failed: {e}", path);
                false
            }
        }
    }
}
