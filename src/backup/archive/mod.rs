//! The project archive source: a tar stream of the source directory.

pub mod walkdir_globset;

use crate::backup::archive::walkdir_globset::{walk_entries, ExcludeSet, WalkedEntry};
use crate::backup::artifact::Artifact;
use crate::backup::function_path;
use crate::backup::pipeline::{ByteSource, Pipeline, PipelineSpec, Source, Transform};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::validate::validate_source_dir;

use bon::Builder;
use function_name::named;
use getset::Getters;
use tar::{EntryType, Header, HeaderMode};

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ArchiveStage {
    #[builder(into)]
    src_dir: PathBuf,
    #[builder(default, into)]
    excludes: Vec<String>,
}

impl ArchiveStage {
    /// Builds the in-process tar source. Fails before anything runs when the
    /// source directory is missing or an exclude pattern does not compile.
    #[named]
    pub fn source(&self) -> Result<Source> {
        self.producer()
            .map(|producer| Source::in_process("tar", producer))
            .with_debug_object_and_fn_name(self.clone(), function_path!())
    }

    /// Archives the source directory through `transforms` into `destination`.
    pub fn execute<P: AsRef<Path>>(
        &self,
        pipeline: &Pipeline,
        transforms: Vec<Transform>,
        destination: P,
    ) -> Result<Artifact> {
        let spec = PipelineSpec::new(self.source()?).then_all(transforms);
        pipeline.execute(spec, destination)
    }

    fn producer(&self) -> Result<TarProducer> {
        validate_source_dir(&self.src_dir)?;
        let canonical = self
            .src_dir
            .canonicalize()
            .map_err(Error::from)
            .with_msg(format!("Resolve source directory {:?} failed", self.src_dir))?;
        let archive_root = canonical
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::config(format!("{:?} has no directory name", canonical)))?;
        Ok(TarProducer {
            src_dir: canonical,
            archive_root,
            excludes: ExcludeSet::new(&self.excludes)?,
        })
    }
}

struct TarProducer {
    src_dir: PathBuf,
    archive_root: PathBuf,
    excludes: ExcludeSet,
}

impl ByteSource for TarProducer {
    fn produce(self: Box<Self>, output: &mut dyn Write) -> Result<()> {
        tracing::info!(
            "Archiving {:?} as {:?} with {} exclude pattern(s)",
            self.src_dir,
            self.archive_root,
            self.excludes.patterns().len()
        );
        let mut builder = tar::Builder::new(output);
        let mut entry_count = 0usize;
        for entry in walk_entries(&self.src_dir, &self.archive_root, &self.excludes) {
            if append_entry(&mut builder, entry?)? {
                entry_count += 1;
            }
        }
        builder.finish()?;
        tracing::info!("Archived {} entries", entry_count);
        Ok(())
    }
}

/// Returns false when the entry was skipped.
fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: WalkedEntry) -> Result<bool> {
    let metadata = match std::fs::symlink_metadata(&entry.src) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!("{:?} vanished before it could be archived", entry.src);
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
    header.set_uid(0);
    header.set_gid(0);

    if entry.file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, &entry.dst, std::io::empty())?;
    } else if entry.file_type.is_symlink() {
        let target = std::fs::read_link(&entry.src)?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, &entry.dst, target)?;
    } else if entry.file_type.is_file() {
        let file = match File::open(&entry.src) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("{:?} vanished before it could be archived", entry.src);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        // the header size is fixed now; pad or cut if the file changes under us
        let len = metadata.len();
        header.set_size(len);
        let reader = file.take(len).chain(std::io::repeat(0)).take(len);
        builder
            .append_data(&mut header, &entry.dst, reader)
            .map_err(Error::from)
            .with_msg(format!("Append {:?} to archive failed", entry.src))?;
    } else {
        tracing::debug!("Skipping special file {:?}", entry.src);
        return Ok(false);
    }
    Ok(true)
}
