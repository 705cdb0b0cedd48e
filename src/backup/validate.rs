//! Validation functions for configuration values and the run environment.
//!
//! Provides custom validation functions for names, directories, globs,
//! and lookup of the external tools a run depends on.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use globset::GlobBuilder;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub fn validate_valid_project_name<S: AsRef<str>>(name: S) -> std::result::Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || !is_sanitized(name) {
        return Err(ValidationError::new("InvalidProjectName").with_message(
            format!(
                "Invalid project name, try sanitizing like {:?}",
                sanitize(name)
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_globs(patterns: &[String]) -> std::result::Result<(), ValidationError> {
    for pattern in patterns {
        GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                ValidationError::new("InvalidGlob")
                    .with_message(format!("invalid exclude pattern {pattern:?}: {e}").into())
            })?;
    }

    Ok(())
}

/// Fails with `SourceMissing` unless `dir` is an existing directory.
pub fn validate_source_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    if dir.is_dir() {
        Ok(())
    } else {
        Err(Error::SourceMissing(dir.to_path_buf()))
    }
}

/// Resolves `program` the way a shell would: explicit paths are checked
/// as-is, bare names are searched on `PATH`.
pub fn find_tool<S: AsRef<OsStr>>(program: S) -> Option<PathBuf> {
    let program = Path::new(program.as_ref());
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    })
}

pub fn require_tool<S: AsRef<OsStr>>(program: S) -> Result<PathBuf> {
    let program = program.as_ref();
    find_tool(program).ok_or_else(|| Error::tool_missing(program.to_string_lossy()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_name_validation() {
        assert!(validate_valid_project_name("shop-prod").is_ok());
        assert!(validate_valid_project_name("a/b").is_err());
        assert!(validate_valid_project_name("").is_err());
    }

    #[test]
    fn test_glob_validation() {
        assert!(validate_globs(&["*.log".into(), "node_modules".into()]).is_ok());
        assert!(validate_globs(&["[broken".into()]).is_err());
    }

    #[test]
    fn test_source_dir_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(validate_source_dir(tmp.path()).is_ok());
        let err = validate_source_dir(tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::SourceMissing(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_find_tool() {
        assert!(find_tool("sh").is_some());
        assert!(find_tool("definitely-not-a-real-tool-xyz").is_none());
        let err = require_tool("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(matches!(err, Error::ToolMissing { .. }));
    }

    #[test]
    fn test_find_tool_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("plain");
        std::fs::write(&plain, "data").unwrap();
        assert!(find_tool(&plain).is_none());
        assert!(find_tool("/bin/sh").is_some() || find_tool("/usr/bin/sh").is_some());
    }
}
