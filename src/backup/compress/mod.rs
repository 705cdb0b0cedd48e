pub mod xz;
pub mod zstd;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::Transform;
use crate::backup::validate::require_tool;
use crate::backup::result_error::result::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `COMPRESSOR` values; an empty value disables compression.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    Zstd,
    Xz,
}

#[derive(Clone, Debug, Default)]
pub enum CompressorConfig {
    #[default]
    None,
    Zstd(zstd::ZstdConfig),
    Xz(xz::XzConfig),
}

impl CompressorConfig {
    pub fn new(kind: Option<CompressorKind>, level: Option<u32>, zstd_bin: &str) -> Self {
        match kind {
            None => CompressorConfig::None,
            Some(CompressorKind::Zstd) => CompressorConfig::Zstd(
                zstd::ZstdConfig::builder()
                    .program(zstd_bin)
                    .maybe_level(level)
                    .build(),
            ),
            Some(CompressorKind::Xz) => {
                CompressorConfig::Xz(xz::XzConfig::builder().maybe_level(level).build())
            }
        }
    }

    /// The stage to append to a pipeline, if compression is enabled.
    pub fn transform(&self) -> Option<Transform> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Zstd(zstd) => Some(zstd.stage()),
            CompressorConfig::Xz(xz) => Some(xz.stage()),
        }
    }

    /// Checks the external tool this compressor needs, if any.
    pub fn check_tools(&self) -> Result<()> {
        match self {
            CompressorConfig::Zstd(zstd) => require_tool(zstd.program()).map(drop),
            CompressorConfig::None | CompressorConfig::Xz(_) => Ok(()),
        }
    }
}

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Zstd(_) => Some("zst".into()),
            CompressorConfig::Xz(_) => Some("xz".into()),
        }
    }
}
