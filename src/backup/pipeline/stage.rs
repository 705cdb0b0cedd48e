use crate::backup::pipeline::priority::Priority;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::signal::CancelToken;
use std::ffi::{OsStr, OsString};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, PipeReader, PipeWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

/// In-process producer of the pipeline's first byte stream.
pub trait ByteSource: Send {
    fn produce(self: Box<Self>, output: &mut dyn Write) -> Result<()>;
}

/// In-process stream transform between two stages.
pub trait ByteTransform: Send {
    fn transform(self: Box<Self>, input: &mut dyn Read, output: &mut dyn Write) -> Result<()>;
}

/// External program invocation; arguments are passed as a list, never through a shell.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandStage {
    name: String,
    program: OsString,
    args: Vec<OsString>,
}

impl CommandStage {
    pub fn new<S: Into<String>, P: Into<OsString>>(name: S, program: P) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = A>, A: Into<OsString>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }
}

impl Debug for CommandStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // argument values may carry paths but never secrets
        f.debug_struct("CommandStage")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("args", &self.args)
            .finish()
    }
}

/// First stage of a pipeline.
pub enum Source {
    Command(CommandStage),
    InProcess {
        name: String,
        producer: Box<dyn ByteSource>,
    },
    /// Streams an existing file.
    File(PathBuf),
}

impl Source {
    pub fn in_process<S: Into<String>, B: ByteSource + 'static>(name: S, producer: B) -> Self {
        Self::InProcess {
            name: name.into(),
            producer: Box::new(producer),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Source::Command(c) => c.name().to_string(),
            Source::InProcess { name, .. } => name.clone(),
            Source::File(path) => format!("read {}", path.display()),
        }
    }
}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Command(c) => c.fmt(f),
            Source::InProcess { name, .. } => write!(f, "InProcess({name})"),
            Source::File(path) => write!(f, "File({path:?})"),
        }
    }
}

/// Any stage after the source.
pub enum Transform {
    Command(CommandStage),
    InProcess {
        name: String,
        transform: Box<dyn ByteTransform>,
    },
}

impl Transform {
    pub fn in_process<S: Into<String>, T: ByteTransform + 'static>(name: S, transform: T) -> Self {
        Self::InProcess {
            name: name.into(),
            transform: Box::new(transform),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Transform::Command(c) => c.name().to_string(),
            Transform::InProcess { name, .. } => name.clone(),
        }
    }
}

impl Debug for Transform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Transform::Command(c) => c.fmt(f),
            Transform::InProcess { name, .. } => write!(f, "InProcess({name})"),
        }
    }
}

pub(crate) enum StageOutput {
    Pipe(PipeWriter),
    File(File),
}

impl StageOutput {
    fn into_stdio(self) -> Stdio {
        match self {
            StageOutput::Pipe(w) => w.into(),
            StageOutput::File(f) => f.into(),
        }
    }

    fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            StageOutput::Pipe(w) => Box::new(w),
            StageOutput::File(f) => Box::new(f),
        }
    }
}

pub(crate) enum StageKind {
    Command(CommandStage),
    Producer(Box<dyn ByteSource>),
    File(PathBuf),
    Transformer(Box<dyn ByteTransform>),
}

impl Source {
    pub(crate) fn into_stage(self) -> (String, StageKind) {
        let name = self.name();
        let kind = match self {
            Source::Command(c) => StageKind::Command(c),
            Source::InProcess { producer, .. } => StageKind::Producer(producer),
            Source::File(path) => StageKind::File(path),
        };
        (name, kind)
    }
}

impl Transform {
    pub(crate) fn into_stage(self) -> (String, StageKind) {
        let name = self.name();
        let kind = match self {
            Transform::Command(c) => StageKind::Command(c),
            Transform::InProcess { transform, .. } => StageKind::Transformer(transform),
        };
        (name, kind)
    }
}

pub(crate) enum Running {
    Child {
        child: Child,
        stderr: Option<JoinHandle<()>>,
    },
    Thread(Option<JoinHandle<Result<()>>>),
}

/// Why a stage did not succeed.
pub(crate) struct StageFailure {
    pub index: usize,
    pub name: String,
    pub exit_code: Option<i32>,
    pub cause: Option<Error>,
    /// Failed only because its neighbour went away.
    pub broken_pipe: bool,
}

impl From<StageFailure> for Error {
    fn from(f: StageFailure) -> Self {
        Error::Pipeline {
            stage_index: f.index,
            stage: f.name,
            exit_code: f.exit_code,
            cause: f.cause.map(Box::new),
        }
    }
}

pub(crate) struct RunningStage {
    pub index: usize,
    pub name: String,
    running: Running,
    killed: bool,
    done: bool,
}

const SIGKILL: i32 = 9;
const SIGPIPE: i32 = 13;

impl RunningStage {
    pub fn spawn(
        index: usize,
        name: String,
        kind: StageKind,
        input: Option<PipeReader>,
        output: StageOutput,
        priority: &Priority,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let cancel = cancel.clone();
        let running = match kind {
            StageKind::Command(command) => spawn_command(&name, command, input, output, priority)?,
            StageKind::Producer(producer) => spawn_thread(index, &name, move || {
                let mut writer = Cancellable::new(BufWriter::new(output.into_writer()), cancel);
                producer.produce(&mut writer)?;
                writer.flush()?;
                Ok(())
            })?,
            StageKind::File(path) => spawn_thread(index, &name, move || {
                let mut file = File::open(&path)
                    .map_err(Error::from)
                    .with_msg(format!("Open {:?} failed", path))?;
                let mut writer = Cancellable::new(output.into_writer(), cancel);
                std::io::copy(&mut file, &mut writer)?;
                writer.flush()?;
                Ok(())
            })?,
            StageKind::Transformer(transform) => {
                let input = input.ok_or_else(|| {
                    Error::from(std::io::Error::other("transform stage without upstream"))
                })?;
                spawn_thread(index, &name, move || {
                    let mut reader = Cancellable::new(BufReader::new(input), cancel.clone());
                    let mut writer = Cancellable::new(BufWriter::new(output.into_writer()), cancel);
                    transform.transform(&mut reader, &mut writer)?;
                    writer.flush()?;
                    Ok(())
                })?
            }
        };

        Ok(Self {
            index,
            name,
            running,
            killed: false,
            done: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Non-blocking status check. `Some` once the stage finished.
    pub fn poll(&mut self) -> Option<std::result::Result<(), StageFailure>> {
        if self.done {
            return None;
        }
        let outcome = match &mut self.running {
            Running::Child { child, stderr } => match child.try_wait() {
                Ok(None) => return None,
                Ok(Some(status)) => {
                    // a killed stage may leave grandchildren holding stderr open
                    if let Some(handle) = stderr.take().filter(|_| !self.killed) {
                        let _ = handle.join();
                    }
                    self.child_outcome(status)
                }
                Err(e) => Err(self.failure(None, Some(e.into()))),
            },
            Running::Thread(handle) => {
                if !handle.as_ref().is_some_and(JoinHandle::is_finished) {
                    return None;
                }
                match handle.take().map(JoinHandle::join) {
                    Some(Ok(Ok(()))) | None => Ok(()),
                    Some(Ok(Err(e))) => Err(self.failure(None, Some(e))),
                    Some(Err(_)) => Err(self.failure(
                        None,
                        Some(std::io::Error::other("stage thread panicked").into()),
                    )),
                }
            }
        };
        self.done = true;
        Some(outcome)
    }

    /// Kills an external stage. In-process stages stop on their own once
    /// their pipe neighbours are gone.
    pub fn kill(&mut self) {
        if self.done {
            return;
        }
        if let Running::Child { child, .. } = &mut self.running {
            if child.kill().is_ok() {
                self.killed = true;
            }
        }
    }

    fn child_outcome(&self, status: ExitStatus) -> std::result::Result<(), StageFailure> {
        if status.success() {
            return Ok(());
        }
        let signal = exit_signal(&status);
        if self.killed && signal == Some(SIGKILL) {
            // our own abort, not a stage failure
            return Ok(());
        }
        let code = status.code().or(signal.map(|s| 128 + s));
        let mut failure = self.failure(code, None);
        failure.broken_pipe = signal == Some(SIGPIPE);
        Err(failure)
    }

    fn failure(&self, exit_code: Option<i32>, cause: Option<Error>) -> StageFailure {
        let broken_pipe = cause.as_ref().is_some_and(|e| {
            matches!(e.root(), Error::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe)
        });
        StageFailure {
            index: self.index,
            name: self.name.clone(),
            exit_code,
            cause,
            broken_pipe,
        }
    }
}

/// Fails every read and write once the run is cancelled, so in-process
/// stages stop at their next I/O call instead of running to completion.
struct Cancellable<T> {
    inner: T,
    cancel: CancelToken,
}

impl<T> Cancellable<T> {
    fn new(inner: T, cancel: CancelToken) -> Self {
        Self { inner, cancel }
    }

    fn check(&self) -> std::io::Result<()> {
        // not `Interrupted`: std's copy loops retry on that kind
        if self.cancel.is_cancelled() {
            Err(std::io::Error::other("stage cancelled"))
        } else {
            Ok(())
        }
    }
}

impl<R: Read> Read for Cancellable<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.check()?;
        self.inner.read(buf)
    }
}

impl<W: Write> Write for Cancellable<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn spawn_command(
    name: &str,
    stage: CommandStage,
    input: Option<PipeReader>,
    output: StageOutput,
    priority: &Priority,
) -> Result<Running> {
    let CommandStage { program, args, .. } = stage;
    let display_program = program.clone();
    let (program, args) = priority.wrap(program, args);

    // `command` owns the parent's copies of the pipe ends and must be
    // dropped right after spawning so EOF reaches the neighbours.
    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(input.map(Stdio::from).unwrap_or_else(Stdio::null))
        .stdout(output.into_stdio())
        .stderr(Stdio::piped());
    tracing::debug!("Spawning stage {name}: {:?} {:?}", program, args);
    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::tool_missing(display_program.to_string_lossy()),
        _ => Error::from(e).with_msg(format!("Spawn stage {name} failed")),
    })?;
    drop(command);

    let stderr = match child.stderr.take() {
        Some(stderr) => {
            let stage = name.to_string();
            Some(
                std::thread::Builder::new()
                    .name(format!("{name}-stderr"))
                    .spawn(move || forward_stderr(&stage, stderr))?,
            )
        }
        None => None,
    };

    Ok(Running::Child { child, stderr })
}

fn forward_stderr<R: Read>(stage: &str, stderr: R) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => tracing::info!(stage, "{line}"),
            Err(_) => break,
        }
    }
}

fn spawn_thread<F>(index: usize, name: &str, f: F) -> Result<Running>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(format!("stage-{index}-{name}"))
        .spawn(f)?;
    Ok(Running::Thread(Some(handle)))
}
