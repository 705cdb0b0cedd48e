//! Files produced by a run.
//!
//! An `Artifact` is owned by value: operations that replace the file on disk
//! (encryption, splitting) consume the old artifact and hand back the new one,
//! so a stale path can't be used after its file was removed.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use getset::{CopyGetters, Getters};
use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct Artifact {
    #[getset(get = "pub")]
    path: PathBuf,
    /// Name of the artifact as first written, kept across encryption/splitting.
    #[getset(get = "pub")]
    logical_name: String,
    #[getset(get_copy = "pub")]
    size_bytes: u64,
    #[getset(get = "pub")]
    checksum_manifest: Option<PathBuf>,
    /// Position within a split artifact.
    #[getset(get_copy = "pub")]
    part_index: Option<usize>,
}

impl Artifact {
    /// Wraps an existing file, reading its size from disk.
    pub fn open<P: Into<PathBuf>, S: Into<String>>(path: P, logical_name: S) -> Result<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)
            .map_err(Error::from)
            .with_msg(format!("Stat artifact {:?} failed", path))?
            .len();
        Ok(Self {
            path,
            logical_name: logical_name.into(),
            size_bytes,
            checksum_manifest: None,
            part_index: None,
        })
    }

    pub(crate) fn part<P: Into<PathBuf>>(
        path: P,
        logical_name: &str,
        size_bytes: u64,
        checksum_manifest: Option<PathBuf>,
        index: usize,
    ) -> Self {
        Self {
            path: path.into(),
            logical_name: logical_name.to_string(),
            size_bytes,
            checksum_manifest,
            part_index: Some(index),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn with_checksum_manifest<P: Into<PathBuf>>(mut self, manifest: P) -> Self {
        self.checksum_manifest = Some(manifest.into());
        self
    }

    /// Hands ownership of the logical artifact to the file at `successor`,
    /// deleting this artifact's file.
    pub fn replace_with<P: AsRef<Path>>(self, successor: P) -> Result<Artifact> {
        let successor = successor.as_ref();
        let next = Artifact::open(successor, self.logical_name.clone())?;
        if self.path != successor {
            std::fs::remove_file(&self.path)
                .map_err(Error::from)
                .with_msg(format!("Remove superseded artifact {:?} failed", self.path))?;
        }
        Ok(Artifact {
            checksum_manifest: self.checksum_manifest,
            ..next
        })
    }

    /// Deletes the artifact from disk.
    pub fn discard(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .map_err(Error::from)
            .with_msg(format!("Remove artifact {:?} failed", self.path))
    }
}
