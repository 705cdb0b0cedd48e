//! Sequencing of one backup run.
//!
//! ```text
//! Init -> SourceValidated -> DbDumped? -> ProjectArchived -> Encrypted?
//!      -> Checksummed -> Uploaded? -> Retained -> Done
//! ```
//!
//! Any error moves the run to failed. Whatever the outcome, the
//! [`RunFinalizer`] uploads the run log and sends exactly one terminal
//! status message; if the run unwinds without reaching it (a panic), its
//! `Drop` does so instead.

use crate::backup::artifact::Artifact;
use crate::backup::backup_config::BackupConfig;
use crate::backup::checksum::ChecksumManifest;
use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::layout::{RunContext, RunLayout, RunTimestamp};
use crate::backup::logging::RunLog;
use crate::backup::notifications::Notifier;
use crate::backup::pipeline::Pipeline;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::retention::SweepReport;
use crate::backup::signal::CancelToken;
use crate::backup::split::split_if_oversize;
use crate::backup::validate::validate_source_dir;

use bon::Builder;
use chrono::Utc;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;

use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Init,
    SourceValidated,
    DbDumped,
    ProjectArchived,
    Encrypted,
    Checksummed,
    Uploaded,
    Retained,
    Done,
}

/// What a successful run left on disk.
#[derive(Debug, Getters, CopyGetters)]
pub struct RunReport {
    #[getset(get = "pub")]
    run_dir: PathBuf,
    #[getset(get = "pub")]
    db_parts: Vec<Artifact>,
    #[getset(get = "pub")]
    db_manifest: Option<Artifact>,
    #[getset(get = "pub")]
    project_parts: Vec<Artifact>,
    #[getset(get = "pub")]
    project_manifest: Option<Artifact>,
    #[getset(get = "pub")]
    sweep: Option<SweepReport>,
    #[getset(get_copy = "pub")]
    state: RunState,
}

impl RunReport {
    fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            db_parts: Vec::new(),
            db_manifest: None,
            project_parts: Vec::new(),
            project_manifest: None,
            sweep: None,
            state: RunState::Init,
        }
    }
}

#[derive(Builder)]
pub struct Orchestrator<'a> {
    config: &'a BackupConfig,
    #[builder(default)]
    notifier: Notifier,
    #[builder(default)]
    cancel: CancelToken,
    #[builder(default)]
    run_log: RunLog,
    #[builder(default = RunTimestamp::now())]
    timestamp: RunTimestamp,
}

impl Orchestrator<'_> {
    pub fn layout(&self) -> RunLayout {
        RunLayout::new(
            &self.config.backup_dir,
            &self.config.project_name,
            self.timestamp.clone(),
        )
    }

    /// Runs every state to completion and finalizes exactly once.
    pub fn run(&self) -> Result<RunReport> {
        let mut finalizer = RunFinalizer::new(
            self.notifier.clone(),
            self.run_log.clone(),
            self.config.project_name.clone(),
            self.timestamp.clone(),
        );
        tracing::info!(
            "Starting backup of {:?} ({}) at {}",
            self.config.project_name,
            self.config.source_dir.display(),
            self.timestamp
        );
        let result = self.run_states(&mut finalizer);
        finalizer.finish(&result);
        result
    }

    fn run_states(&self, finalizer: &mut RunFinalizer) -> Result<RunReport> {
        let compressor = self.config.compressor_config();
        let encryptor = self.config.encryptor_config()?;
        self.preflight(&compressor, &encryptor)?;
        finalizer.reach(RunState::SourceValidated);

        let context = RunContext::create(self.layout())?;
        self.run_log.attach(context.log_path())?;
        finalizer.log_path = Some(context.log_path().clone());
        tracing::info!("Logging to {:?}", context.log_path());

        let pipeline = Pipeline::builder()
            .priority(self.config.priority())
            .cancel(self.cancel.clone())
            .build();
        let mut report = RunReport::new(context.run_dir().clone());
        let compressed: [&dyn FileExtProvider; 1] = [&compressor];
        let finalized: [&dyn FileExtProvider; 2] = [&compressor, &encryptor];

        if let Some(stage) = self.config.database_stage() {
            self.cancel.check()?;
            let destination = context.db_dump_path(&finalized);
            let transforms = compressor
                .transform()
                .into_iter()
                .chain(encryptor.transform())
                .collect_vec();
            let dump = stage.execute(&pipeline, transforms, destination)?;

            let mut manifest = ChecksumManifest::new();
            manifest.add_artifact(&dump)?;
            let manifest = manifest.write_to(context.db_manifest_path())?;
            let dump = dump.with_checksum_manifest(manifest.path());
            report.db_parts = split_if_oversize(dump, self.config.split_size_mb)?;
            self.upload("database", &report.db_parts, &manifest);
            report.db_manifest = Some(manifest);
            finalizer.reach(RunState::DbDumped);
        }

        self.cancel.check()?;
        let archive = self.config.archive_stage().execute(
            &pipeline,
            compressor.transform().into_iter().collect(),
            context.project_archive_path(&compressed),
        )?;
        finalizer.reach(RunState::ProjectArchived);

        let archive = match encryptor.transform() {
            Some(encrypt) => {
                self.cancel.check()?;
                let encrypted = pipeline.transform_artifact(
                    archive,
                    vec![encrypt],
                    context.project_archive_path(&finalized),
                )?;
                finalizer.reach(RunState::Encrypted);
                encrypted
            }
            None => archive,
        };

        self.cancel.check()?;
        let mut manifest = ChecksumManifest::new();
        manifest.add_artifact(&archive)?;
        let manifest = manifest.write_to(RunLayout::checksum_path_for(archive.path()))?;
        let archive = archive.with_checksum_manifest(manifest.path());
        finalizer.reach(RunState::Checksummed);

        report.project_parts = split_if_oversize(archive, self.config.split_size_mb)?;
        if self.notifier.is_enabled() {
            self.upload("project", &report.project_parts, &manifest);
            finalizer.reach(RunState::Uploaded);
        }
        report.project_manifest = Some(manifest);

        self.cancel.check()?;
        if let Some(policy) = self.config.retention_policy() {
            match policy.sweep(context.project_root(), context.run_dir(), Utc::now()) {
                Ok(sweep) => report.sweep = Some(sweep),
                Err(e) => tracing::warn!("Retention sweep failed: {e}"),
            }
        }
        finalizer.reach(RunState::Retained);

        finalizer.reach(RunState::Done);
        report.state = RunState::Done;
        Ok(report)
    }

    fn preflight(&self, compressor: &CompressorConfig, encryptor: &EncryptorConfig) -> Result<()> {
        self.cancel.check()?;
        validate_source_dir(&self.config.source_dir)?;
        if let Some(stage) = self.config.database_stage() {
            stage.check()?;
        }
        compressor.check_tools()?;
        encryptor.check_tools()?;
        Ok(())
    }

    fn upload(&self, label: &str, parts: &[Artifact], manifest: &Artifact) {
        if !self.notifier.is_enabled() {
            return;
        }
        let total = parts.len();
        for (i, part) in parts.iter().enumerate() {
            let caption = if total > 1 {
                format!("{} {label} part {}/{total}: {}", self.config.project_name, i + 1, part.file_name())
            } else {
                format!("{} {label}: {}", self.config.project_name, part.file_name())
            };
            self.notifier.document(part.path(), &caption);
        }
        self.notifier.document(
            manifest.path(),
            &format!("{} {label} checksums", self.config.project_name),
        );
    }
}

/// Single exit path of a run: log upload plus exactly one status message.
pub struct RunFinalizer {
    notifier: Notifier,
    run_log: RunLog,
    project_name: String,
    timestamp: RunTimestamp,
    started: Instant,
    state: RunState,
    log_path: Option<PathBuf>,
    finished: bool,
}

impl RunFinalizer {
    fn new(notifier: Notifier, run_log: RunLog, project_name: String, timestamp: RunTimestamp) -> Self {
        Self {
            notifier,
            run_log,
            project_name,
            timestamp,
            started: Instant::now(),
            state: RunState::Init,
            log_path: None,
            finished: false,
        }
    }

    fn reach(&mut self, state: RunState) {
        tracing::info!("Run state: {state}");
        self.state = state;
    }

    fn finish(&mut self, result: &Result<RunReport>) {
        let message = match result {
            Ok(report) => self.success_message(report),
            Err(e) => {
                tracing::error!("Backup failed in state {}: {e}", self.state);
                self.failure_message(e)
            }
        };
        self.deliver(&message);
    }

    fn deliver(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!("{message}");
        self.run_log.detach();
        if let Some(log_path) = self.log_path.as_ref().filter(|p| p.is_file()) {
            self.notifier.document(
                log_path,
                &format!("{} log {}", self.project_name, self.timestamp),
            );
        }
        self.notifier.status(message);
    }

    fn elapsed(&self) -> String {
        format_duration(self.started.elapsed())
    }

    fn success_message(&self, report: &RunReport) -> String {
        let files = report
            .db_parts()
            .iter()
            .chain(report.project_parts())
            .map(|a| format!("{} ({} bytes)", a.file_name(), a.size_bytes()))
            .join("\n");
        format!(
            "Backup {} {} succeeded in {}\n{}",
            self.project_name,
            self.timestamp,
            self.elapsed(),
            files
        )
    }

    fn failure_message(&self, error: &Error) -> String {
        let reason = if error.is_cancelled() {
            "cancelled by signal".to_string()
        } else {
            error.to_string()
        };
        format!(
            "Backup {} {} FAILED after {} (last state: {}, exit status {})\n{}",
            self.project_name,
            self.timestamp,
            self.elapsed(),
            self.state,
            error.exit_code(),
            reason
        )
    }
}

impl Drop for RunFinalizer {
    fn drop(&mut self) {
        if !self.finished {
            let message = format!(
                "Backup {} {} FAILED after {}: run aborted unexpectedly in state {}",
                self.project_name,
                self.timestamp,
                self.elapsed(),
                self.state
            );
            tracing::error!("{message}");
            self.deliver(&message);
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{}.{:01}s", secs, d.subsec_millis() / 100),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60),
    }
}
