use crate::backup::pipeline::{CommandStage, Transform};
use bon::Builder;
use getset::Getters;

/// Compression through the external `zstd` binary, multi-threaded (`-T0`).
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ZstdConfig {
    #[builder(into)]
    program: String,
    /// 1-19; zstd's own default when unset
    level: Option<u32>,
}

impl ZstdConfig {
    pub fn stage(&self) -> Transform {
        let stage = CommandStage::new("zstd", &self.program)
            .args(["-q", "-c", "-T0"])
            .args(self.level.map(|l| format!("-{}", l.clamp(1, 19))));
        Transform::Command(stage)
    }
}
