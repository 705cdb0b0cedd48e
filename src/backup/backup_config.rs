//! The run configuration.
//!
//! Settings come from a shell-style `KEY=VALUE` file. The file is parsed into
//! a string map, deserialized into [`BackupConfig`] and validated once at
//! startup; the resulting struct is immutable and handed to every component
//! by reference.

use crate::backup::archive::ArchiveStage;
use crate::backup::compress::{CompressorConfig, CompressorKind};
use crate::backup::database::{DatabaseDumpStage, DbConfig};
use crate::backup::encrypt::gpg::GpgConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::notifications::telegram::TelegramConfig;
use crate::backup::notifications::Notifier;
use crate::backup::pipeline::priority::{Priority, PriorityConfig};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::RetentionPolicy;
use crate::backup::validate::{validate_globs, validate_valid_project_name};

use serde::de::Visitor;
use serde::{Deserialize, Deserializer};
use serde_with::{serde_as, DisplayFromStr};
use validator::{Validate, ValidationError};

use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::path::{Path, PathBuf};

pub const DEFAULT_SPLIT_SIZE_MB: u64 = 1950;

#[serde_as]
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[validate(schema(function = validate_gpg_settings))]
pub struct BackupConfig {
    #[validate(custom(function = validate_valid_project_name))]
    pub project_name: String,
    pub source_dir: PathBuf,
    pub backup_dir: PathBuf,
    #[serde(default)]
    pub compressor: Option<CompressorKind>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub compression_level: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_space_separated")]
    #[validate(custom(function = validate_globs))]
    pub excludes: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_yes_no")]
    pub enable_gpg: bool,
    pub gpg_recipient: Option<String>,
    #[serde(default, deserialize_with = "deserialize_yes_no")]
    pub enable_db_backup: bool,
    #[serde(flatten)]
    #[validate(nested)]
    pub db: DbConfig,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_split_size_mb")]
    #[validate(range(min = 1))]
    pub split_size_mb: u64,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub retain_days: Option<u32>,
    #[serde(flatten)]
    #[validate(nested)]
    pub priority: PriorityConfig,
    #[serde(flatten)]
    pub tools: ToolsConfig,
    #[serde(flatten)]
    pub telegram: TelegramConfig,
}

/// Program overrides for the external tools.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ToolsConfig {
    #[serde(default = "default_mysqldump_bin")]
    pub mysqldump_bin: String,
    #[serde(default = "default_zstd_bin")]
    pub zstd_bin: String,
    #[serde(default = "default_gpg_bin")]
    pub gpg_bin: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mysqldump_bin: default_mysqldump_bin(),
            zstd_bin: default_zstd_bin(),
            gpg_bin: default_gpg_bin(),
        }
    }
}

fn default_split_size_mb() -> u64 {
    DEFAULT_SPLIT_SIZE_MB
}

fn default_mysqldump_bin() -> String {
    "mysqldump".to_string()
}

fn default_zstd_bin() -> String {
    "zstd".to_string()
}

fn default_gpg_bin() -> String {
    "gpg".to_string()
}

fn validate_gpg_settings(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    let recipient_missing = !config
        .gpg_recipient
        .as_deref()
        .is_some_and(|r| !r.trim().is_empty());
    if config.enable_gpg && recipient_missing {
        return Err(ValidationError::new("MissingGpgRecipient")
            .with_message("ENABLE_GPG=yes requires GPG_RECIPIENT".into()));
    }
    Ok(())
}

/// `yes`/`no` (also `true`/`false`, `1`/`0`), case-insensitive.
pub fn deserialize_yes_no<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    deserializer.deserialize_str(YesNoVisitor)
}

struct YesNoVisitor;

impl Visitor<'_> for YesNoVisitor {
    type Value = bool;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("yes or no")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<bool, E> {
        match v.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" | "1" => Ok(true),
            "no" | "n" | "false" | "0" => Ok(false),
            other => Err(E::custom(format!("expected yes or no, got {other:?}"))),
        }
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<bool, E> {
        Ok(v)
    }
}

/// A space-separated list, e.g. `EXCLUDES="*.log node_modules"`.
pub fn deserialize_space_separated<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(raw.split_whitespace().map(str::to_string).collect())
}

/// Parses `KEY=VALUE` lines. Comments, blank lines and an `export ` prefix
/// are skipped; matching outer quotes are removed; the last assignment of a
/// key wins and empty values leave the key unset.
pub fn parse_key_values(content: &str) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::config(format!("line {line_no}: expected KEY=VALUE")))?;
        let key = key.trim();
        if !is_valid_key(key) {
            return Err(Error::config(format!("line {line_no}: invalid key {key:?}")));
        }
        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    values.retain(|_, v| !v.is_empty());
    Ok(values)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    // unquoted: a ` #` starts a trailing comment
    match value.find(" #") {
        Some(at) => value[..at].trim_end(),
        None => value,
    }
}

impl BackupConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read config file {:?}: {e}", path)))?;
        Self::from_key_values(parse_key_values(&content)?)
            .with_msg(format!("Load config {:?} failed", path))
    }

    pub fn from_key_values(values: BTreeMap<String, String>) -> Result<Self> {
        let object = values
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect::<serde_json::Map<_, _>>();
        let config: BackupConfig = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig::new(self.compressor, self.compression_level, &self.tools.zstd_bin)
    }

    pub fn encryptor_config(&self) -> Result<EncryptorConfig> {
        if !self.enable_gpg {
            return Ok(EncryptorConfig::None);
        }
        let recipient = self
            .gpg_recipient
            .as_deref()
            .ok_or_else(|| Error::config("ENABLE_GPG=yes requires GPG_RECIPIENT"))?;
        Ok(EncryptorConfig::Gpg(
            GpgConfig::builder()
                .program(&self.tools.gpg_bin)
                .recipient(recipient)
                .build(),
        ))
    }

    pub fn archive_stage(&self) -> ArchiveStage {
        ArchiveStage::builder()
            .src_dir(&self.source_dir)
            .excludes(self.excludes.clone())
            .build()
    }

    /// `None` when database backups are disabled.
    pub fn database_stage(&self) -> Option<DatabaseDumpStage> {
        self.enable_db_backup.then(|| {
            DatabaseDumpStage::builder()
                .program(&self.tools.mysqldump_bin)
                .config(self.db.clone())
                .build()
        })
    }

    pub fn retention_policy(&self) -> Option<RetentionPolicy> {
        RetentionPolicy::from_days(self.retain_days)
    }

    pub fn priority(&self) -> Priority {
        Priority::resolve(&self.priority)
    }

    pub fn notifier(&self) -> Result<Notifier> {
        Ok(self
            .telegram
            .transport()?
            .map(Notifier::new)
            .unwrap_or_default())
    }
}
