use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status for a missing or invalid configuration.
pub const EXIT_CONFIG: i32 = 1;
/// Exit status when `SOURCE_DIR` does not exist.
pub const EXIT_SOURCE_MISSING: i32 = 2;
/// Exit status after SIGINT/SIGTERM.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
    #[error("required tool {tool:?} not found")]
    ToolMissing { tool: String },
    #[error("source directory {0:?} does not exist or is not a directory")]
    SourceMissing(PathBuf),
    #[error("run directory {0:?} already exists, refusing to overwrite a previous run")]
    RunCollision(PathBuf),
    #[error(
        "pipeline stage {stage_index} ({stage}) failed{}{}",
        exit_code.map(|c| format!(" with exit status {c}")).unwrap_or_default(),
        cause.as_ref().map(|c| format!(":\n{}", indent::indent_all_with("  ", c.to_string()))).unwrap_or_default()
    )]
    Pipeline {
        stage_index: usize,
        stage: String,
        exit_code: Option<i32>,
        cause: Option<Box<Error>>,
    },
    #[error("run cancelled by signal")]
    Cancelled,
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        // urls carry the bot token
        Self::Transport(value.without_url().to_string())
    }
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn tool_missing<S: Into<String>>(tool: S) -> Self {
        Self::ToolMissing { tool: tool.into() }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.root()
            }
            Error::LotsOfError(v) => v.first().map(Error::root).unwrap_or(self),
            e => e,
        }
    }

    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Error::Config(_) | Error::Validation(_) => EXIT_CONFIG,
            Error::SourceMissing(_) => EXIT_SOURCE_MISSING,
            Error::Cancelled => EXIT_CANCELLED,
            Error::Pipeline {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            Error::Pipeline {
                cause: Some(cause), ..
            } if cause.is_cancelled() => EXIT_CANCELLED,
            _ => 1,
        }
    }

    /// True only when the run was stopped by a signal, not when a tool
    /// happened to exit with status 130.
    pub fn is_cancelled(&self) -> bool {
        match self.root() {
            Error::Cancelled => true,
            Error::Pipeline {
                cause: Some(cause), ..
            } => cause.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error(msg: &str) -> Error {
        Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, msg.to_string()))
    }

    #[test]
    fn test_error_with_msg() {
        let error_with_msg = io_error("file not found").with_msg("Custom message");

        match &error_with_msg {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
        let error_str = error_with_msg.to_string();
        assert!(error_str.contains("Custom message"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_error_with_debug_object_and_fn_name() {
        let error_with_debug = io_error("file not found").with_debug_object_and_fn_name(42, "test_function");
        let error_str = error_with_debug.to_string();

        assert!(error_str.contains("test_function"));
        assert!(error_str.contains("failed"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_chain_flattens() {
        let combined = io_error("a").chain(io_error("b")).chain(io_error("c"));
        match combined {
            Error::LotsOfError(errors) => assert_eq!(errors.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_exit_code_taxonomy() {
        assert_eq!(Error::config("PROJECT_NAME missing").exit_code(), EXIT_CONFIG);
        assert_eq!(
            Error::SourceMissing("/nope".into()).exit_code(),
            EXIT_SOURCE_MISSING
        );
        assert_eq!(Error::tool_missing("zstd").exit_code(), 1);
        assert_eq!(Error::Cancelled.exit_code(), EXIT_CANCELLED);
        let pipeline = Error::Pipeline {
            stage_index: 1,
            stage: "zstd".into(),
            exit_code: Some(7),
            cause: None,
        };
        assert_eq!(pipeline.exit_code(), 7);
    }

    #[test]
    fn test_tool_exit_130_is_not_a_cancellation() {
        let sigint_death = Error::Pipeline {
            stage_index: 2,
            stage: "gpg".into(),
            exit_code: Some(EXIT_CANCELLED),
            cause: None,
        };
        assert_eq!(sigint_death.exit_code(), EXIT_CANCELLED);
        assert!(!sigint_death.is_cancelled());

        assert!(Error::Cancelled.with_msg("archive").is_cancelled());
        assert!(!Error::config("x").is_cancelled());
    }

    #[test]
    fn test_exit_code_sees_through_wrappers() {
        let wrapped = Error::config("DB_NAME unset")
            .with_msg("database dump")
            .with_debug_object_and_fn_name("run", "run");
        assert_eq!(wrapped.exit_code(), EXIT_CONFIG);
        assert!(matches!(wrapped.root(), Error::Config(_)));
    }

    #[test]
    fn test_pipeline_display_includes_cause() {
        let err = Error::Pipeline {
            stage_index: 0,
            stage: "tar".into(),
            exit_code: None,
            cause: Some(Box::new(io_error("gone"))),
        };
        let s = err.to_string();
        assert!(s.contains("stage 0 (tar)"));
        assert!(s.contains("gone"));
        assert!(!s.contains("exit status"));
    }
}
