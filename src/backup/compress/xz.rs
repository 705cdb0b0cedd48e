use crate::backup::pipeline::{ByteTransform, Transform};
use crate::backup::result_error::result::Result;
use bon::Builder;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use std::io::{Read, Write};
use std::num::NonZero;

/// Default compression level (balance of speed vs size)
static DEFAULT_COMPRESSION_LEVEL: u32 = 6;
/// Maximum threads to prevent resource exhaustion
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

/// XZ (LZMA) compression, run in-process.
#[derive(Clone, Debug, Default, Builder)]
pub struct XzConfig {
    /// 0-9
    level: Option<u32>,
}

impl XzConfig {
    pub fn stage(&self) -> Transform {
        Transform::in_process("xz", self.clone())
    }

    fn encoder<W: Write>(&self, writer: W) -> Result<XzEncoder<W>> {
        self.encoder_with_threads(writer, auto_thread_count())
    }

    fn encoder_with_threads<W: Write>(&self, writer: W, thread: u32) -> Result<XzEncoder<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL).min(9);
        tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

        if thread <= 1 {
            Ok(XzEncoder::new(writer, level))
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .encoder()?;
            Ok(XzEncoder::new_stream(writer, stream))
        }
    }
}

/// Half of the available cores, at least one.
fn auto_thread_count() -> u32 {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .map(|core| core / 2)
        .map(|t| t.clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
        .unwrap_or(1)
}

impl ByteTransform for XzConfig {
    fn transform(self: Box<Self>, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut encoder = self.encoder(output)?;
        std::io::copy(input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    }
}
