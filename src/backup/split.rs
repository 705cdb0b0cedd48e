//! Splitting oversized artifacts into `.partNNN` files.
//!
//! Part numbers are zero-padded to a fixed width (at least three digits), so
//! `cat name.part*` in lexicographic order reassembles the original.

use crate::backup::artifact::Artifact;
use crate::backup::file_ext::append_ext;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

pub const MIB: u64 = 1024 * 1024;
const MIN_INDEX_WIDTH: usize = 3;

/// Returns `[artifact]` untouched when it fits in `max_part_mb` MiB,
/// otherwise the parts, in order, with the original removed from disk.
pub fn split_if_oversize(artifact: Artifact, max_part_mb: u64) -> Result<Vec<Artifact>> {
    if max_part_mb == 0 {
        return Err(Error::config("SPLIT_SIZE_MB must be at least 1"));
    }
    split_with_part_size(artifact, max_part_mb.saturating_mul(MIB))
}

pub(crate) fn split_with_part_size(artifact: Artifact, part_size: u64) -> Result<Vec<Artifact>> {
    if artifact.size_bytes() <= part_size {
        return Ok(vec![artifact]);
    }

    let part_count = artifact.size_bytes().div_ceil(part_size);
    let width = MIN_INDEX_WIDTH.max((part_count - 1).to_string().len());
    tracing::info!(
        "Splitting {:?} ({} bytes) into {} parts of at most {} bytes",
        artifact.path(),
        artifact.size_bytes(),
        part_count,
        part_size
    );

    let mut written: Vec<PathBuf> = Vec::new();
    match write_parts(&artifact, part_size, part_count, width, &mut written) {
        Ok(parts) => {
            artifact.discard()?;
            Ok(parts)
        }
        Err(e) => {
            for path in written {
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to remove partial part {:?}: {remove_err}", path);
                }
            }
            Err(e.with_msg(format!("Split {:?} failed", artifact.path())))
        }
    }
}

fn write_parts(
    artifact: &Artifact,
    part_size: u64,
    part_count: u64,
    width: usize,
    written: &mut Vec<PathBuf>,
) -> Result<Vec<Artifact>> {
    let mut reader = BufReader::new(File::open(artifact.path())?);
    let mut parts = Vec::with_capacity(part_count as usize);

    for index in 0..part_count as usize {
        let path = append_ext(artifact.path(), &format!("part{index:0width$}"));
        let file = File::options().write(true).create_new(true).open(&path)?;
        written.push(path.clone());

        let mut writer = BufWriter::new(file);
        let copied = std::io::copy(&mut (&mut reader).take(part_size), &mut writer)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::from(e.into_error()))?
            .sync_all()?;

        if copied == 0 {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{:?} shrank while splitting", artifact.path()),
            )));
        }
        parts.push(Artifact::part(
            path,
            artifact.logical_name(),
            copied,
            artifact.checksum_manifest().clone(),
            index,
        ));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact_with(dir: &TempDir, name: &str, data: &[u8]) -> Artifact {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        Artifact::open(path, name).unwrap()
    }

    #[test]
    fn test_small_artifact_is_returned_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = artifact_with(&temp_dir, "small.tar", b"tiny");
        let path = artifact.path().clone();

        let parts = split_if_oversize(artifact, 1).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].path(), &path);
        assert!(parts[0].part_index().is_none());
    }

    #[test]
    fn test_exact_size_is_not_split() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = artifact_with(&temp_dir, "exact.bin", &[7u8; 10]);
        let parts = split_with_part_size(artifact, 10).unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_split_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let artifact = artifact_with(&temp_dir, "big.tar.zst", &data)
            .with_checksum_manifest(temp_dir.path().join("big.tar.zst.sha256"));
        let original = artifact.path().clone();

        let parts = split_with_part_size(artifact, 3000).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(!original.exists());

        let names: Vec<_> = parts.iter().map(Artifact::file_name).collect();
        assert_eq!(
            names,
            [
                "big.tar.zst.part000",
                "big.tar.zst.part001",
                "big.tar.zst.part002",
                "big.tar.zst.part003"
            ]
        );
        assert_eq!(parts[3].size_bytes(), 1000);
        assert!(parts.iter().all(|p| p.logical_name() == "big.tar.zst"));
        assert!(parts.iter().all(|p| p.checksum_manifest().is_some()));

        let mut on_disk: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        on_disk.sort();
        let joined: Vec<u8> = on_disk
            .iter()
            .flat_map(|p| std::fs::read(p).unwrap())
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_index_width_grows_past_three_digits() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = artifact_with(&temp_dir, "many", &[1u8; 1001]);
        let parts = split_with_part_size(artifact, 1).unwrap();
        assert_eq!(parts.len(), 1001);
        assert_eq!(parts[0].file_name(), "many.part0000");
        assert_eq!(parts[1000].file_name(), "many.part1000");
    }

    #[test]
    fn test_existing_part_aborts_and_keeps_original() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = artifact_with(&temp_dir, "clash", &[0u8; 100]);
        std::fs::write(temp_dir.path().join("clash.part001"), "in the way").unwrap();

        assert!(split_with_part_size(artifact, 40).is_err());
        assert!(temp_dir.path().join("clash").exists());
        assert!(!temp_dir.path().join("clash.part000").exists());
        assert!(temp_dir.path().join("clash.part001").exists());
    }

    #[test]
    fn test_zero_part_size_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = artifact_with(&temp_dir, "x", b"x");
        assert!(split_if_oversize(artifact, 0).is_err());
    }
}
