//! The database dump source.
//!
//! `mysqldump` never sees the credentials on its command line. They go into a
//! `[client]` option file that only the current user can read, which exists
//! for the duration of the dump and is removed afterwards whether the dump
//! succeeded or not.

use crate::backup::artifact::Artifact;
use crate::backup::backup_config::deserialize_space_separated;
use crate::backup::pipeline::{CommandStage, Pipeline, PipelineSpec, Source, Transform};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::require_tool;

use bon::Builder;
use getset::Getters;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tempfile::NamedTempFile;
use validator::Validate;
use zeroize::Zeroizing;

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `DB_*` settings.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Validate, Builder, Getters)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[getset(get = "pub")]
pub struct DbConfig {
    #[builder(into)]
    db_name: Option<String>,
    #[builder(into)]
    db_user: Option<String>,
    #[builder(into)]
    db_pass: Option<RedactedString>,
    #[builder(into)]
    db_host: Option<String>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    #[validate(range(min = 1))]
    db_port: Option<u16>,
    #[builder(into)]
    db_socket: Option<PathBuf>,
    /// Extra `mysqldump` arguments, space separated.
    #[serde(default, deserialize_with = "deserialize_space_separated")]
    #[builder(default)]
    db_extra_opts: Vec<String>,
}

impl DbConfig {
    /// The database to dump; unset is a configuration error.
    pub fn required_db_name(&self) -> Result<&str> {
        match self.db_name.as_deref() {
            None => Err(Error::config(
                "ENABLE_DB_BACKUP=yes but DB_NAME is not set",
            )),
            Some(name) if name.starts_with('-') => Err(Error::config(format!(
                "DB_NAME {:?} must not start with '-'",
                name
            ))),
            Some(name) => Ok(name),
        }
    }

    fn client_section(&self) -> Zeroizing<String> {
        let mut section = Zeroizing::new(String::from("[client]\n"));
        let mut option = |key: &str, value: &str| {
            let _ = writeln!(section, "{key}=\"{}\"", escape_option_value(value));
        };
        if let Some(user) = &self.db_user {
            option("user", user);
        }
        if let Some(pass) = &self.db_pass {
            option("password", pass.inner());
        }
        if let Some(host) = &self.db_host {
            option("host", host);
        }
        if let Some(port) = self.db_port {
            option("port", &port.to_string());
        }
        if let Some(socket) = &self.db_socket {
            option("socket", &socket.to_string_lossy());
        }
        section
    }
}

fn escape_option_value(value: &str) -> String {
    value
        .chars()
        .fold(String::with_capacity(value.len()), |mut s, c| {
            match c {
                '\\' => s.push_str("\\\\"),
                '"' => s.push_str("\\\""),
                '\n' => s.push_str("\\n"),
                '\r' => s.push_str("\\r"),
                '\t' => s.push_str("\\t"),
                c => s.push(c),
            }
            s
        })
}

/// Short-lived, owner-only option file; removed on `close` or drop.
#[derive(Debug)]
pub struct CredentialsFile {
    file: NamedTempFile,
}

impl CredentialsFile {
    pub fn create(config: &DbConfig) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".k-backup-")
            .suffix(".cnf")
            .tempfile()
            .map_err(Error::from)
            .with_msg("Create database credentials file failed")?;
        restrict_permissions(file.as_file())?;
        file.write_all(config.client_section().as_bytes())?;
        file.as_file().sync_all()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn close(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        self.file
            .close()
            .map_err(Error::from)
            .with_msg(format!("Remove credentials file {:?} failed", path))
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> Result<()> {
    Ok(())
}

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct DatabaseDumpStage {
    #[builder(into, default = "mysqldump".to_string())]
    program: String,
    config: DbConfig,
}

impl DatabaseDumpStage {
    /// Pre-flight: the database name is set and the dump tool is installed.
    pub fn check(&self) -> Result<()> {
        self.config.required_db_name()?;
        require_tool(&self.program)?;
        Ok(())
    }

    fn command(&self, credentials: &Path, db_name: &str) -> CommandStage {
        let mut defaults_file = std::ffi::OsString::from("--defaults-extra-file=");
        defaults_file.push(credentials);
        CommandStage::new("mysqldump", &self.program)
            .arg(defaults_file)
            .args([
                "--single-transaction",
                "--quick",
                "--routines",
                "--triggers",
                "--events",
            ])
            .args(&self.config.db_extra_opts)
            .arg(db_name)
    }

    /// Dumps the database through `transforms` into `destination`.
    pub fn execute<P: AsRef<Path>>(
        &self,
        pipeline: &Pipeline,
        transforms: Vec<Transform>,
        destination: P,
    ) -> Result<Artifact> {
        let db_name = self.config.required_db_name()?;
        tracing::info!("Dumping database {:?}", db_name);

        let credentials = CredentialsFile::create(&self.config)?;
        let spec = PipelineSpec::new(Source::Command(self.command(credentials.path(), db_name)))
            .then_all(transforms);
        let dumped = pipeline.execute(spec, destination);

        match (dumped, credentials.close()) {
            (Ok(artifact), Ok(())) => Ok(artifact),
            (Err(e), Ok(())) => Err(e),
            (Ok(artifact), Err(e)) => {
                tracing::error!("Dump {:?} written but credentials file was not removed", artifact.path());
                Err(e)
            }
            (Err(e), Err(close_err)) => Err(e.chain(close_err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> DbConfig {
        DbConfig::builder()
            .db_name("shop")
            .db_user("backup")
            .db_pass(RedactedString::builder().inner("p\"a\\ss").build())
            .db_host("db.internal")
            .db_port(3307)
            .db_extra_opts(vec!["--hex-blob".to_string()])
            .build()
    }

    #[test]
    fn test_required_db_name() {
        assert!(matches!(
            DbConfig::default().required_db_name(),
            Err(Error::Config(_))
        ));
        assert!(DbConfig::builder()
            .db_name("--all-databases")
            .build()
            .required_db_name()
            .is_err());
        assert_eq!(full_config().required_db_name().unwrap(), "shop");
    }

    #[test]
    fn test_client_section_escapes_values() {
        let section = full_config().client_section();
        assert!(section.starts_with("[client]\n"));
        assert!(section.contains("user=\"backup\"\n"));
        assert!(section.contains("password=\"p\\\"a\\\\ss\"\n"));
        assert!(section.contains("port=\"3307\"\n"));
        assert!(!section.contains("socket="));
    }

    #[cfg(unix)]
    #[test]
    fn test_credentials_file_is_private_and_removed() {
        use std::os::unix::fs::PermissionsExt;

        let credentials = CredentialsFile::create(&full_config()).unwrap();
        let path = credentials.path().to_path_buf();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(std::fs::read_to_string(&path).unwrap().contains("password="));

        credentials.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_command_keeps_secrets_out_of_arguments() {
        let stage = DatabaseDumpStage::builder().config(full_config()).build();
        let command = stage.command(Path::new("/tmp/creds.cnf"), "shop");
        let args: Vec<_> = command
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "--defaults-extra-file=/tmp/creds.cnf");
        assert!(args.contains(&"--single-transaction".to_string()));
        assert!(args.contains(&"--events".to_string()));
        assert_eq!(args[args.len() - 2..], ["--hex-blob", "shop"]);
        assert!(!args.iter().any(|a| a.contains("p\"a")));
    }

    #[test]
    fn test_check_reports_missing_tool() {
        let stage = DatabaseDumpStage::builder()
            .program("no-such-mysqldump-xyz")
            .config(full_config())
            .build();
        assert!(matches!(stage.check(), Err(Error::ToolMissing { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_removes_credentials_even_on_failure() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let seen = temp_dir.path().join("seen");
        let fake = temp_dir.path().join("fake-mysqldump");
        std::fs::write(
            &fake,
            format!(
                "#!/bin/sh\nprintf '%s' \"${{1#--defaults-extra-file=}}\" > {:?}\nexit 7\n",
                seen
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let stage = DatabaseDumpStage::builder()
            .program(fake.to_string_lossy())
            .config(full_config())
            .build();
        let err = stage
            .execute(&Pipeline::default(), vec![], temp_dir.path().join("dump.sql"))
            .unwrap_err();

        assert_eq!(err.exit_code(), 7);
        let credentials_path = std::fs::read_to_string(&seen).unwrap();
        assert!(!credentials_path.is_empty());
        assert!(!Path::new(&credentials_path).exists());
        assert!(!temp_dir.path().join("dump.sql").exists());
    }
}
