//! Streaming composition of backup stages.
//!
//! A [`PipelineSpec`] is one source followed by any number of transforms. The
//! [`Pipeline`] connects them with OS pipes, so nothing is buffered beyond
//! the pipe capacity, and watches the exit status of every stage. The output
//! is written to a hidden temporary file next to the destination and renamed
//! into place only when all stages succeeded, so a failed chain never leaves a
//! file at the destination path.

pub mod priority;
pub mod stage;

use crate::backup::artifact::Artifact;
use crate::backup::pipeline::priority::Priority;
use crate::backup::pipeline::stage::{RunningStage, StageFailure, StageOutput};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::signal::CancelToken;
use bon::Builder;
use itertools::Itertools;
use std::path::Path;
use std::time::Duration;

pub use stage::{ByteSource, ByteTransform, CommandStage, Source, Transform};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exactly one source, then transforms applied left to right.
#[derive(Debug)]
pub struct PipelineSpec {
    source: Source,
    transforms: Vec<Transform>,
}

impl PipelineSpec {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            transforms: Vec::new(),
        }
    }

    pub fn then(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn then_all<I: IntoIterator<Item = Transform>>(mut self, transforms: I) -> Self {
        self.transforms.extend(transforms);
        self
    }

    pub fn stage_names(&self) -> Vec<String> {
        std::iter::once(self.source.name())
            .chain(self.transforms.iter().map(Transform::name))
            .collect()
    }
}

#[derive(Clone, Debug, Default, Builder)]
pub struct Pipeline {
    #[builder(default)]
    priority: Priority,
    #[builder(default)]
    cancel: CancelToken,
}

impl Pipeline {
    /// Runs every stage of `spec` concurrently and writes the last stage's
    /// output to `destination`. The artifact's logical name is the
    /// destination's file name.
    pub fn execute<P: AsRef<Path>>(&self, spec: PipelineSpec, destination: P) -> Result<Artifact> {
        let destination = destination.as_ref();
        let logical_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("{:?} has no file name", destination)))?;
        self.execute_named(spec, destination, logical_name)
    }

    /// Streams `artifact` through `transforms` into `destination`, then
    /// deletes the original so only the successor remains on disk.
    pub fn transform_artifact<P: AsRef<Path>>(
        &self,
        artifact: Artifact,
        transforms: Vec<Transform>,
        destination: P,
    ) -> Result<Artifact> {
        let destination = destination.as_ref();
        let spec = PipelineSpec::new(Source::File(artifact.path().clone())).then_all(transforms);
        let produced = self.execute_named(spec, destination, artifact.logical_name().clone())?;
        drop(produced);
        artifact.replace_with(destination)
    }

    fn execute_named(
        &self,
        spec: PipelineSpec,
        destination: &Path,
        logical_name: String,
    ) -> Result<Artifact> {
        self.cancel.check()?;
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let names = spec.stage_names();
        tracing::info!("Running pipeline [{}] -> {:?}", names.iter().join(" | "), destination);

        let partial = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(parent)
            .map_err(Error::from)
            .with_msg(format!("Create temporary output in {:?} failed", parent))?;

        let running = self.spawn_all(spec, partial.as_file().try_clone()?)?;
        self.wait_all(running)?;

        partial.as_file().sync_all()?;
        partial
            .persist(destination)
            .map_err(|e| Error::from(e.error))
            .with_msg(format!("Move finished output to {:?} failed", destination))?;

        let artifact = Artifact::open(destination, logical_name)?;
        tracing::info!(
            "Pipeline wrote {:?} ({} bytes)",
            artifact.path(),
            artifact.size_bytes()
        );
        Ok(artifact)
    }

    fn spawn_all(&self, spec: PipelineSpec, output: std::fs::File) -> Result<Vec<RunningStage>> {
        let PipelineSpec { source, transforms } = spec;
        let stages = std::iter::once(source.into_stage())
            .chain(transforms.into_iter().map(Transform::into_stage))
            .collect_vec();
        let last = stages.len() - 1;

        let mut running: Vec<RunningStage> = Vec::with_capacity(stages.len());
        let mut output = Some(output);
        let mut upstream = None;
        for (index, (name, kind)) in stages.into_iter().enumerate() {
            let spawned = (|| {
                let (stage_output, next) = if index == last {
                    let file = output.take().ok_or_else(|| {
                        Error::from(std::io::Error::other("pipeline output already taken"))
                    })?;
                    (StageOutput::File(file), None)
                } else {
                    let (reader, writer) = std::io::pipe()?;
                    (StageOutput::Pipe(writer), Some(reader))
                };
                let stage = RunningStage::spawn(
                    index,
                    name,
                    kind,
                    upstream.take(),
                    stage_output,
                    &self.priority,
                    &self.cancel,
                )?;
                Ok::<_, Error>((stage, next))
            })();

            match spawned {
                Ok((stage, next)) => {
                    running.push(stage);
                    upstream = next;
                }
                Err(e) => {
                    drop(upstream.take());
                    abort(&mut running);
                    return Err(e);
                }
            }
        }

        Ok(running)
    }

    /// Polls every stage until all have finished. The first failure kills the
    /// rest of the chain.
    fn wait_all(&self, mut running: Vec<RunningStage>) -> Result<()> {
        let mut failures: Vec<StageFailure> = Vec::new();
        let mut cancelled = false;

        loop {
            for stage in running.iter_mut() {
                if let Some(Err(failure)) = stage.poll() {
                    tracing::warn!(
                        "Stage {} ({}) failed, exit status {:?}",
                        failure.index,
                        failure.name,
                        failure.exit_code
                    );
                    failures.push(failure);
                }
            }

            if !cancelled && self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested, killing pipeline");
                cancelled = true;
            }
            if cancelled || !failures.is_empty() {
                running.iter_mut().for_each(RunningStage::kill);
            }
            if running.iter().all(RunningStage::is_done) {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if cancelled {
            return Err(Error::Cancelled);
        }
        match pick_culprit(failures) {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

/// The stage to blame: the lowest-indexed failure that wasn't just a
/// broken pipe caused by a neighbour dying.
fn pick_culprit(failures: Vec<StageFailure>) -> Option<StageFailure> {
    let (broken, real): (Vec<_>, Vec<_>) = failures.into_iter().partition(|f| f.broken_pipe);
    real.into_iter()
        .min_by_key(|f| f.index)
        .or_else(|| broken.into_iter().max_by_key(|f| f.index))
}

fn abort(running: &mut [RunningStage]) {
    running.iter_mut().for_each(RunningStage::kill);
    while !running.iter().all(RunningStage::is_done) {
        running.iter_mut().for_each(|s| {
            s.poll();
        });
        std::thread::sleep(POLL_INTERVAL);
    }
}
