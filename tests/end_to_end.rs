use chrono::{Local, TimeZone};
use k_backup_pipe::backup::backup_config::{parse_key_values, BackupConfig};
use k_backup_pipe::backup::checksum::sha256_file;
use k_backup_pipe::backup::layout::RunTimestamp;
use k_backup_pipe::backup::notifications::{Notification, Notifier};
use k_backup_pipe::backup::orchestrator::{Orchestrator, RunReport, RunState};
use k_backup_pipe::backup::result_error::error::Error;
use k_backup_pipe::backup::result_error::result::Result;
use k_backup_pipe::backup::signal::CancelToken;
use k_backup_pipe::backup::validate::find_tool;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

const TS: &str = "2024-03-02_01-02-03";

#[derive(Debug, Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("status:").map(str::to_string))
            .collect()
    }
}

impl Notification for RecordingSink {
    fn send_status(&self, text: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("status:{text}"));
        Ok(())
    }

    fn send_document(&self, path: &Path, _caption: &str) -> Result<()> {
        assert!(path.is_file(), "uploaded {path:?} does not exist");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        self.events.lock().unwrap().push(format!("document:{name}"));
        Ok(())
    }
}

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            root: TempDir::new().unwrap(),
        };
        let source = fixture.source_dir();
        std::fs::create_dir_all(source.join("nested")).unwrap();
        for i in 0..10 {
            let dir = if i % 2 == 0 { source.clone() } else { source.join("nested") };
            std::fs::write(dir.join(format!("file{i}.txt")), format!("content of file {i}\n").repeat(50))
                .unwrap();
        }
        fixture
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn source_dir(&self) -> PathBuf {
        self.path().join("app")
    }

    fn backup_dir(&self) -> PathBuf {
        self.path().join("backups")
    }

    fn run_dir(&self) -> PathBuf {
        self.backup_dir().join("demo").join(TS)
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(&self, extra: &str) -> BackupConfig {
        let content = format!(
            "PROJECT_NAME=demo\nSOURCE_DIR={}\nBACKUP_DIR={}\n{extra}",
            self.source_dir().display(),
            self.backup_dir().display()
        );
        BackupConfig::from_key_values(parse_key_values(&content).unwrap()).unwrap()
    }

    fn run(&self, config: &BackupConfig, notifier: Notifier) -> Result<RunReport> {
        Orchestrator::builder()
            .config(config)
            .notifier(notifier)
            .timestamp(timestamp())
            .build()
            .run()
    }
}

fn timestamp() -> RunTimestamp {
    RunTimestamp::from_datetime(&Local.with_ymd_and_hms(2024, 3, 2, 1, 2, 3).unwrap())
}

fn manifest_digest(manifest: &Path) -> (String, String) {
    let content = std::fs::read_to_string(manifest).unwrap();
    assert_eq!(content.lines().count(), 1);
    let (digest, name) = content.trim_end().split_once("  ").unwrap();
    (digest.to_string(), name.to_string())
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn scenario_a_zstd_archive_with_checksum() {
    if find_tool("zstd").is_none() {
        eprintln!("zstd not installed, skipping");
        return;
    }
    let fixture = Fixture::new();
    let config = fixture.config("COMPRESSOR=zstd\nENABLE_GPG=no\n");

    let report = fixture.run(&config, Notifier::disabled()).unwrap();

    let project_dir = fixture.run_dir().join("project");
    let archive = format!("demo-project-{TS}.tar.zst");
    assert_eq!(files_in(&project_dir), [archive.clone(), format!("{archive}.sha256")]);
    assert_eq!(report.project_parts().len(), 1);

    let (digest, name) = manifest_digest(&project_dir.join(format!("{archive}.sha256")));
    assert_eq!(name, archive);
    assert_eq!(digest, sha256_file(project_dir.join(&archive)).unwrap());
    assert!(fixture.run_dir().join(format!("demo-{TS}.log")).is_file());
}

#[test]
fn scenario_b_oversize_archive_is_split() {
    let fixture = Fixture::new();
    // 3 MiB of incompressible bytes
    let mut state = 0x2545F4914F6CDD1Du64;
    let noise: Vec<u8> = (0..3 * 1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    std::fs::write(fixture.source_dir().join("noise.bin"), &noise).unwrap();
    let config = fixture.config("SPLIT_SIZE_MB=1\n");
    let sink = Arc::new(RecordingSink::default());

    let report = fixture.run(&config, Notifier::from_arc(sink.clone())).unwrap();

    let project_dir = fixture.run_dir().join("project");
    let archive = format!("demo-project-{TS}.tar");
    let names = files_in(&project_dir);
    assert_eq!(
        names,
        [
            format!("{archive}.part000"),
            format!("{archive}.part001"),
            format!("{archive}.part002"),
            format!("{archive}.part003"),
            format!("{archive}.sha256"),
        ]
    );
    assert!(!project_dir.join(&archive).exists());
    assert_eq!(report.project_parts().len(), 4);

    let joined = fixture.path().join("joined.tar");
    let mut out = File::create(&joined).unwrap();
    for part in report.project_parts() {
        std::io::copy(&mut File::open(part.path()).unwrap(), &mut out).unwrap();
    }
    let (digest, name) = manifest_digest(&project_dir.join(format!("{archive}.sha256")));
    assert_eq!(name, archive);
    assert_eq!(digest, sha256_file(&joined).unwrap());

    let uploads: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.starts_with("document:"))
        .collect();
    assert_eq!(
        uploads,
        [
            format!("document:{archive}.part000"),
            format!("document:{archive}.part001"),
            format!("document:{archive}.part002"),
            format!("document:{archive}.part003"),
            format!("document:{archive}.sha256"),
            format!("document:demo-{TS}.log"),
        ]
    );
}

#[test]
fn scenario_c_encryption_replaces_plaintext() {
    let fixture = Fixture::new();
    let gpg = fixture.script(
        "fake-gpg",
        "case \"$*\" in *\"--recipient ops@example.com --output -\"*) exec cat ;; *) exit 9 ;; esac",
    );
    let config = fixture.config(&format!(
        "COMPRESSOR=xz\nENABLE_GPG=yes\nGPG_RECIPIENT=ops@example.com\nGPG_BIN={}\n",
        gpg.display()
    ));

    let report = fixture.run(&config, Notifier::disabled()).unwrap();

    let project_dir = fixture.run_dir().join("project");
    let encrypted = format!("demo-project-{TS}.tar.xz.gpg");
    assert_eq!(files_in(&project_dir), [encrypted.clone(), format!("{encrypted}.sha256")]);
    assert!(!project_dir.join(format!("demo-project-{TS}.tar.xz")).exists());
    assert_eq!(report.project_parts()[0].file_name(), encrypted);
    assert_eq!(
        report.project_parts()[0].logical_name(),
        &format!("demo-project-{TS}.tar.xz")
    );
    let (digest, _) = manifest_digest(&project_dir.join(format!("{encrypted}.sha256")));
    assert_eq!(digest, sha256_file(project_dir.join(&encrypted)).unwrap());
}

#[test]
fn scenario_d_db_enabled_without_name_fails_before_archiving() {
    let fixture = Fixture::new();
    let config = fixture.config("ENABLE_DB_BACKUP=yes\n");
    let sink = Arc::new(RecordingSink::default());

    let err = fixture
        .run(&config, Notifier::from_arc(sink.clone()))
        .unwrap_err();

    assert!(matches!(err.root(), Error::Config(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(!fixture.run_dir().exists());
    assert_eq!(sink.statuses().len(), 1);
    assert!(sink.statuses()[0].contains("DB_NAME"));
}

#[test]
fn database_dump_keeps_credentials_out_of_arguments() {
    let fixture = Fixture::new();
    let args_log = fixture.path().join("mysqldump-args");
    let mysqldump = fixture.script(
        "fake-mysqldump",
        &format!(
            "echo \"$@\" > '{}'\n\
             creds=\"${{1#--defaults-extra-file=}}\"\n\
             grep -q 'password=\"s3cret pass\"' \"$creds\" || exit 4\n\
             echo \"$creds\" >> '{}'\n\
             echo 'CREATE TABLE t (id INT);'",
            args_log.display(),
            args_log.display()
        ),
    );
    let config = fixture.config(&format!(
        "ENABLE_DB_BACKUP=yes\nDB_NAME=shop\nDB_USER=backup\nDB_PASS=\"s3cret pass\"\nMYSQLDUMP_BIN={}\n",
        mysqldump.display()
    ));

    let report = fixture.run(&config, Notifier::disabled()).unwrap();

    let db_dir = fixture.run_dir().join("db");
    let dump = format!("demo-db-{TS}.sql");
    assert_eq!(files_in(&db_dir), [format!("db-{TS}.sha256"), dump.clone()]);
    assert_eq!(
        std::fs::read_to_string(db_dir.join(&dump)).unwrap(),
        "CREATE TABLE t (id INT);\n"
    );
    let (digest, name) = manifest_digest(&db_dir.join(format!("db-{TS}.sha256")));
    assert_eq!(name, dump);
    assert_eq!(digest, sha256_file(db_dir.join(&dump)).unwrap());
    assert_eq!(report.db_parts().len(), 1);

    let recorded = std::fs::read_to_string(&args_log).unwrap();
    let mut lines = recorded.lines();
    let args = lines.next().unwrap();
    assert!(args.contains("--single-transaction"));
    assert!(args.ends_with(" shop"));
    assert!(!args.contains("s3cret"));
    let creds_path = lines.next().unwrap();
    assert!(!Path::new(creds_path).exists());
}

#[test]
fn failing_stage_notifies_exactly_once() {
    let fixture = Fixture::new();
    let gpg = fixture.script("broken-gpg", "cat > /dev/null\necho 'gpg: no public key' >&2\nexit 5");
    let config = fixture.config(&format!(
        "ENABLE_GPG=yes\nGPG_RECIPIENT=ops@example.com\nGPG_BIN={}\n",
        gpg.display()
    ));
    let sink = Arc::new(RecordingSink::default());

    let err = fixture
        .run(&config, Notifier::from_arc(sink.clone()))
        .unwrap_err();

    assert_eq!(err.exit_code(), 5);
    let project_dir = fixture.run_dir().join("project");
    assert!(!project_dir.join(format!("demo-project-{TS}.tar.gpg")).exists());
    assert!(!files_in(&project_dir).iter().any(|n| n.ends_with(".sha256")));

    let statuses = sink.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].contains("FAILED"));
    assert!(statuses[0].contains("ProjectArchived"));
    assert_eq!(
        sink.events().last().map(|e| e.starts_with("status:")),
        Some(true)
    );
    assert!(sink.events().contains(&format!("document:demo-{TS}.log")));
}

#[test]
fn cancel_during_in_process_compression_fails_once_with_130() {
    let fixture = Fixture::new();
    let started_marker = fixture.path().join("dump-started");
    // never ends on its own; only cancellation stops the run
    let mysqldump = fixture.script(
        "endless-mysqldump",
        &format!(
            "touch '{}'\nexec yes 'INSERT INTO t VALUES (1);'",
            started_marker.display()
        ),
    );
    let config = fixture.config(&format!(
        "COMPRESSOR=xz\nENABLE_DB_BACKUP=yes\nDB_NAME=shop\nMYSQLDUMP_BIN={}\n",
        mysqldump.display()
    ));
    let sink = Arc::new(RecordingSink::default());
    let cancel = CancelToken::default();

    let trigger = {
        let cancel = cancel.clone();
        let marker = started_marker.clone();
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !marker.exists() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };
    let started = Instant::now();
    let err = Orchestrator::builder()
        .config(&config)
        .notifier(Notifier::from_arc(sink.clone()))
        .cancel(cancel)
        .timestamp(timestamp())
        .build()
        .run()
        .unwrap_err();
    trigger.join().unwrap();

    assert!(started_marker.exists());
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), 130);
    assert!(started.elapsed() < Duration::from_secs(20));
    let db_dir = fixture.run_dir().join("db");
    assert!(files_in(&db_dir).is_empty());

    let statuses = sink.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].contains("cancelled by signal"));
    assert!(statuses[0].contains("exit status 130"));
    assert_eq!(
        sink.events(),
        [
            format!("document:demo-{TS}.log"),
            format!("status:{}", statuses[0]),
        ]
    );
}

#[test]
fn retention_removes_only_expired_runs() {
    let fixture = Fixture::new();
    let project_root = fixture.backup_dir().join("demo");
    let aged = |name: &str, days: u64| {
        let dir = project_root.join(name);
        std::fs::create_dir_all(dir.join("project")).unwrap();
        File::open(&dir)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
            .unwrap();
        dir
    };
    let old = aged("2024-01-01_00-00-00", 40);
    let mid = aged("2024-01-21_00-00-00", 20);
    let recent = aged("2024-02-25_00-00-00", 5);
    let config = fixture.config("RETAIN_DAYS=30\n");

    let report = fixture.run(&config, Notifier::disabled()).unwrap();

    assert_eq!(report.state(), RunState::Done);
    assert!(!old.exists());
    assert!(mid.exists());
    assert!(recent.exists());
    assert!(fixture.run_dir().exists());
    assert_eq!(report.sweep().as_ref().unwrap().removed(), &[old]);
}
