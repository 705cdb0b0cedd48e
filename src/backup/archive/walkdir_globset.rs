use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;

use dyn_iter::{DynIter, IntoDynIterator};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::{DirEntry, WalkDir};

use std::fs::FileType;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Compiled `EXCLUDES` patterns.
///
/// A pattern excludes an entry when it matches either the path relative to
/// the source directory or the entry's own file name, so `*.log` drops log
/// files at any depth while `cache/tmp` only drops that one directory.
#[derive(Clone, Debug)]
pub struct ExcludeSet {
    patterns: Vec<String>,
    globset: GlobSet,
}

impl ExcludeSet {
    pub fn new<I: IntoIterator<Item = S>, S: AsRef<str>>(patterns: I) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            patterns: kept,
            globset: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.globset.is_match(relative)
            || relative
                .file_name()
                .is_some_and(|name| self.globset.is_match(name))
    }
}

/// One filesystem entry to put in the archive.
#[derive(Debug)]
pub struct WalkedEntry {
    pub src: PathBuf,
    /// Path inside the archive, rooted at the source directory's name.
    pub dst: PathBuf,
    pub file_type: FileType,
}

/// Walks `src_dir` without following symlinks, in file-name order, pruning
/// excluded directories. Entries that disappear mid-walk are skipped.
pub fn walk_entries<'a>(
    src_dir: &Path,
    archive_root: &Path,
    excludes: &'a ExcludeSet,
) -> DynIter<'a, Result<WalkedEntry>> {
    let base = src_dir.to_path_buf();
    let prune_base = base.clone();
    let archive_root = archive_root.to_path_buf();

    WalkDir::new(&base)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |de| {
            let keep = de
                .path()
                .strip_prefix(&prune_base)
                .map(|rel| !excludes.is_excluded(rel))
                .unwrap_or(true);
            if !keep {
                tracing::debug!("Excluding {:?}", de.path());
            }
            keep
        })
        .filter_map(move |res| match res {
            Ok(de) => Some(to_walked_entry(de, &base, &archive_root)),
            Err(e) if vanished(&e) => {
                tracing::warn!("Skipping entry that vanished during the walk: {e}");
                None
            }
            Err(e) => Some(Err(Error::from(e))),
        })
        .into_dyn_iter()
}

fn to_walked_entry(de: DirEntry, base: &Path, archive_root: &Path) -> Result<WalkedEntry> {
    let file_type = de.file_type();
    let src = de.into_path();
    let relative = src.strip_prefix(base).map_err(|e| {
        Error::from(std::io::Error::other(format!(
            "Stripping {:?} from {:?} failed: {e}",
            base, src
        )))
    })?;
    let dst = archive_root.join(relative);
    tracing::trace!("Including {:?} -> {:?}", src, dst);
    Ok(WalkedEntry {
        src,
        dst,
        file_type,
    })
}

fn vanished(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == ErrorKind::NotFound)
}
