use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, Duration, Utc};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use std::path::{Path, PathBuf};

/// Age-based pruning of run directories under one project root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct RetentionPolicy {
    max_age_days: u32,
}

/// Outcome of a sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SweepReport {
    removed: Vec<PathBuf>,
    failed: Vec<PathBuf>,
    kept: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemWithDateTime<R> {
    pub item: R,
    pub date_time: DateTime<Utc>,
}

impl RetentionPolicy {
    /// `None` when `RETAIN_DAYS` is unset or zero.
    pub fn from_days(days: Option<u32>) -> Option<Self> {
        days.filter(|d| *d > 0)
            .map(|max_age_days| Self { max_age_days })
    }

    fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }

    /// Items strictly older than the retention window, oldest first.
    pub fn get_delete<R, I>(&self, iter: I, now: DateTime<Utc>) -> Vec<ItemWithDateTime<R>>
    where
        I: IntoIterator<Item = ItemWithDateTime<R>>,
    {
        let max_age = self.max_age();
        iter.into_iter()
            .filter(|r| now.signed_duration_since(r.date_time) > max_age)
            .sorted_by_key(|r| r.date_time)
            .collect()
    }

    /// Deletes run directories directly under `project_root` whose mtime is
    /// older than the window. `active_run` is never removed. Failures to
    /// delete are logged and reported, not raised.
    pub fn sweep<P: AsRef<Path>, A: AsRef<Path>>(
        &self,
        project_root: P,
        active_run: A,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let project_root = project_root.as_ref();
        let active = std::fs::canonicalize(active_run.as_ref())
            .unwrap_or_else(|_| active_run.as_ref().to_path_buf());
        tracing::info!(
            "Sweeping run directories older than {} days in {:?}",
            self.max_age_days,
            project_root
        );

        let mut report = SweepReport::default();
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(project_root)
            .map_err(Error::from)
            .with_msg(format!("List {:?} failed", project_root))?
        {
            let entry = entry?;
            let path = entry.path();
            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Skipping {:?}: {e}", path);
                    continue;
                }
            };
            if !metadata.is_dir() {
                continue;
            }
            if std::fs::canonicalize(&path).is_ok_and(|p| p == active) {
                tracing::debug!("Keeping active run {:?}", path);
                report.kept.push(path);
                continue;
            }
            match metadata.modified() {
                Ok(modified) => candidates.push(ItemWithDateTime {
                    item: path,
                    date_time: DateTime::<Utc>::from(modified),
                }),
                Err(e) => {
                    tracing::warn!("Skipping {:?}, no modification time: {e}", path);
                    report.kept.push(path);
                }
            }
        }

        let expired = self.get_delete(candidates.iter().cloned(), now);
        for path in candidates.into_iter().map(|c| c.item) {
            if !expired.iter().any(|e| e.item == path) {
                report.kept.push(path);
            }
        }
        for ItemWithDateTime { item: path, date_time } in expired {
            tracing::info!("Removing expired run {:?} (modified {})", path, date_time);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => {
                    tracing::warn!("Failed to remove {:?}: {e}", path);
                    report.failed.push(path);
                }
            }
        }
        report.kept.sort();
        Ok(report)
    }
}
