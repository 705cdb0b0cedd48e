pub mod gpg;

use crate::backup::encrypt::gpg::GpgConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::Transform;
use crate::backup::result_error::result::Result;
use crate::backup::validate::require_tool;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub enum EncryptorConfig {
    #[default]
    None,
    Gpg(GpgConfig),
}

impl EncryptorConfig {
    /// The stage to append to a pipeline, if encryption is enabled.
    pub fn transform(&self) -> Option<Transform> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Gpg(gpg) => Some(gpg.stage()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptorConfig::None)
    }

    pub fn check_tools(&self) -> Result<()> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Gpg(gpg) => require_tool(gpg.program()).map(drop),
        }
    }
}

impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Gpg(_) => Some("gpg".into()),
        }
    }
}
