//! # k-backup-pipe
//!
//! One-shot backup runs for a single project: a tar archive of the project
//! tree and, optionally, a `mysqldump` export, each streamed through
//! compression and encryption stages, checksummed, split into upload-sized
//! parts, sent to a bot API, and pruned by age.
//!
//! ## Features
//!
//! - **Streaming pipelines**: stages are connected by OS pipes and every
//!   stage's exit status is checked
//! - **Compression**: zstd (external) or XZ (in-process, multi-threaded)
//! - **Encryption**: GnuPG public-key encryption to one recipient
//! - **Splitting**: fixed-width `.partNNN` files that reassemble with `cat`
//! - **Retention**: age-based removal of old run directories
//! - **Notifications**: status messages and document uploads, best-effort
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_backup_pipe::backup::backup_config::BackupConfig;
//! use k_backup_pipe::backup::orchestrator::Orchestrator;
//!
//! let config = BackupConfig::load("/etc/k-backup/shop.conf")?;
//! let report = Orchestrator::builder()
//!     .config(&config)
//!     .notifier(config.notifier()?)
//!     .build()
//!     .run()?;
//! println!("{:?}", report.run_dir());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
