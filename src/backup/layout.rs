//! On-disk layout of a single run.
//!
//! ```text
//! <BACKUP_DIR>/<PROJECT_NAME>/<timestamp>/
//!     project/<PROJECT_NAME>-project-<timestamp>.tar[.zst|.xz][.gpg]
//!     project/<...>.sha256
//!     db/<PROJECT_NAME>-db-<timestamp>.sql[.zst|.xz][.gpg]
//!     db/db-<timestamp>.sha256
//!     <PROJECT_NAME>-<timestamp>.log
//! ```

use crate::backup::file_ext::{append_ext, join_exts, FileExtProvider};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, Local, TimeZone};
use derive_more::{Deref, Display};
use getset::Getters;
use std::fmt::Display as FmtDisplay;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub static TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub static CHECKSUM_EXT: &str = "sha256";

/// Second-resolution identity of a run.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunTimestamp(String);

impl RunTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self
    where
        Tz::Offset: FmtDisplay,
    {
        Self(dt.format(TIME_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Paths of a run, derived purely from `(backup_dir, project, timestamp)`.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RunLayout {
    project_name: String,
    timestamp: RunTimestamp,
    project_root: PathBuf,
    run_dir: PathBuf,
    project_dir: PathBuf,
    db_dir: PathBuf,
    log_path: PathBuf,
}

impl RunLayout {
    pub fn new<P: AsRef<Path>, S: Into<String>>(
        backup_dir: P,
        project_name: S,
        timestamp: RunTimestamp,
    ) -> Self {
        let project_name = project_name.into();
        let project_root = backup_dir.as_ref().join(&project_name);
        let run_dir = project_root.join(timestamp.as_str());
        Self {
            project_dir: run_dir.join("project"),
            db_dir: run_dir.join("db"),
            log_path: run_dir.join(format!("{project_name}-{timestamp}.log")),
            project_name,
            timestamp,
            project_root,
            run_dir,
        }
    }

    fn artifact_name(&self, label: &str, base_ext: &str, exts: &[&dyn FileExtProvider]) -> String {
        format!(
            "{}-{}-{}.{}",
            self.project_name,
            label,
            self.timestamp,
            join_exts(base_ext, exts)
        )
    }

    /// `project/<project>-project-<ts>.tar[.<ext>...]`
    pub fn project_archive_path(&self, exts: &[&dyn FileExtProvider]) -> PathBuf {
        self.project_dir.join(self.artifact_name("project", "tar", exts))
    }

    /// `db/<project>-db-<ts>.sql[.<ext>...]`
    pub fn db_dump_path(&self, exts: &[&dyn FileExtProvider]) -> PathBuf {
        self.db_dir.join(self.artifact_name("db", "sql", exts))
    }

    /// `db/db-<ts>.sha256`, shared by all database artifacts of the run.
    pub fn db_manifest_path(&self) -> PathBuf {
        self.db_dir
            .join(format!("db-{}.{}", self.timestamp, CHECKSUM_EXT))
    }

    /// Sibling `.sha256` of a single artifact.
    pub fn checksum_path_for<P: AsRef<Path>>(artifact: P) -> PathBuf {
        append_ext(artifact, CHECKSUM_EXT)
    }
}

/// A layout whose directories have been created for exclusive use by one run.
#[derive(Debug, Deref)]
pub struct RunContext {
    layout: RunLayout,
}

impl RunContext {
    /// Creates the run directories. An existing run directory means another
    /// run with the same project and second already happened; it is rejected
    /// rather than overwritten.
    pub fn create(layout: RunLayout) -> Result<Self> {
        std::fs::create_dir_all(layout.project_root())
            .map_err(Error::from)
            .with_msg(format!("Create project root {:?} failed", layout.project_root()))?;

        std::fs::create_dir(layout.run_dir()).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => Error::RunCollision(layout.run_dir().clone()),
            _ => Error::from(e).with_msg(format!("Create run dir {:?} failed", layout.run_dir())),
        })?;

        for dir in [layout.project_dir(), layout.db_dir()] {
            std::fs::create_dir(dir)
                .map_err(Error::from)
                .with_msg(format!("Create {:?} failed", dir))?;
            ensure_writable(dir)?;
        }

        tracing::info!("Created run directory {:?}", layout.run_dir());
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }
}

fn ensure_writable(dir: &Path) -> Result<()> {
    tempfile::tempfile_in(dir)
        .map(drop)
        .map_err(Error::from)
        .with_msg(format!("Directory {:?} is not writable", dir))
}
