//! SHA-256 manifests in `sha256sum` format.

use crate::backup::artifact::Artifact;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Hex SHA-256 of the file at `path`, read in chunks.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(Error::from)
        .with_msg(format!("Open {:?} for checksum failed", path))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Basename to digest, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: Vec<(String, String)>,
}

impl ChecksumManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes the artifact's current bytes and records them under its basename.
    pub fn add_artifact(&mut self, artifact: &Artifact) -> Result<&str> {
        let digest = sha256_file(artifact.path())?;
        tracing::debug!("sha256 {} {}", digest, artifact.file_name());
        self.entries.push((artifact.file_name(), digest));
        Ok(self.entries.last().map(|(_, d)| d.as_str()).unwrap_or_default())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(name, digest)| format!("{digest}  {name}\n"))
            .collect()
    }

    /// Writes the manifest next to its artifacts via a temporary file and rename.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<Artifact> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(dir)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| Error::from(e.error))
            .with_msg(format!("Write checksum manifest {:?} failed", path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Artifact::open(path, name)
    }
}
