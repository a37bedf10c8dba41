//! A single ffmpeg invocation assembled from inputs and outputs.
//!
//! A [`Process`] compiles every output's timeline into one filter graph,
//! renders the full command line and runs it under a supervised worker. The
//! worker does not finish until every sub-pipeline spawned while compiling
//! (ducking passes, FIFO buffers) has been joined.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reelforge_av::{FifoConfig, FilterGraph, SilenceConfig, TerminationPolicy, ToolCommand, Workspace};
use reelforge_common::{Error, Result, Worker, WorkerHandle, DEFAULT_TIMEOUT};
use tracing::{debug, info, warn};

use crate::channel::{AudioChannel, VideoChannel};
use crate::duck::DuckingConfig;
use crate::output::Output;
use crate::reel::{Input, InputReel};

/// Everything a process run needs besides its timeline.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub ffmpeg: PathBuf,
    /// Per-attempt wait for joins and liveness re-checks.
    pub timeout: Duration,
    /// Per-attempt wait for subprocesses.
    pub command_timeout: Duration,
    /// Hard deadline for a whole run.
    pub limit: Option<Duration>,
    pub termination: TerminationPolicy,
    pub fifo: FifoConfig,
    pub silence: SilenceConfig,
    pub ducking: DuckingConfig,
}

impl ProcessSettings {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            timeout: DEFAULT_TIMEOUT,
            command_timeout: DEFAULT_TIMEOUT,
            limit: None,
            termination: TerminationPolicy::default(),
            fifo: FifoConfig::default(),
            silence: SilenceConfig::default(),
            ducking: DuckingConfig::default(),
        }
    }

    /// How long a failed run may take to reap its workers.
    fn reap_limit(&self) -> Duration {
        let grace = self.termination.grace_for(self.limit);
        self.timeout + self.command_timeout + grace * (self.termination.term_attempts + 2)
    }
}

/// State shared by the outputs of one process while they compile.
pub struct CompileContext {
    pub(crate) worker: Worker,
    pub(crate) workspace: Arc<Workspace>,
    pub(crate) settings: Arc<ProcessSettings>,
    pub(crate) ignore_broken_pipes: bool,
    pub(crate) pending: Vec<WorkerHandle<()>>,
}

impl CompileContext {
    pub fn new(
        worker: Worker,
        workspace: Arc<Workspace>,
        settings: Arc<ProcessSettings>,
        ignore_broken_pipes: bool,
    ) -> Self {
        Self {
            worker,
            workspace,
            settings,
            ignore_broken_pipes,
            pending: Vec::new(),
        }
    }

    /// Whether the main run should tolerate broken pipes.
    pub fn ignore_broken_pipes(&self) -> bool {
        self.ignore_broken_pipes
    }

    /// Workers spawned while compiling; each must be joined.
    pub fn take_pending(&mut self) -> Vec<WorkerHandle<()>> {
        std::mem::take(&mut self.pending)
    }
}

/// Inputs, outputs and the settings to run them with.
#[derive(Debug)]
pub struct Process {
    settings: Arc<ProcessSettings>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    ignore_broken_pipes: bool,
}

impl Process {
    pub fn new(settings: ProcessSettings) -> Self {
        Self::shared(Arc::new(settings))
    }

    pub fn shared(settings: Arc<ProcessSettings>) -> Self {
        Self {
            settings,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ignore_broken_pipes: false,
        }
    }

    pub fn ignore_broken_pipes(&mut self, ignore: bool) -> &mut Self {
        self.ignore_broken_pipes = ignore;
        self
    }

    /// Add an `-i` input and return a reel reading it.
    pub fn input(&mut self, path: impl Into<PathBuf>, video: bool, audio: bool) -> InputReel {
        let input = Input {
            path: path.into(),
            video,
            audio,
        };
        let reel = InputReel::new(self.inputs.len(), &input);
        self.inputs.push(input);
        reel
    }

    /// Add an output writing to `sink`.
    pub fn output(
        &mut self,
        sink: impl Into<PathBuf>,
        video: Option<VideoChannel>,
        audio: Option<AudioChannel>,
    ) -> Result<&mut Output> {
        let output = Output::new(self.outputs.len(), sink, video, audio)?;
        self.outputs.push(output);
        let last = self.outputs.len() - 1;
        Ok(&mut self.outputs[last])
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Compile every output and render the ffmpeg arguments.
    pub fn compile(&mut self, ctx: &mut CompileContext) -> Result<Vec<String>> {
        if self.outputs.is_empty() {
            return Err(Error::configuration("Nothing to output"));
        }
        for output in &mut self.outputs {
            output.compile(ctx)?;
        }

        // All graphs share one -filter_complex.
        let mut joined = FilterGraph::new();
        for output in &self.outputs {
            if let Some(graph) = output.graph() {
                joined.extend(graph.iter().cloned());
            }
        }
        joined.validate()?;

        self.args()
    }

    /// The ffmpeg arguments of compiled outputs.
    pub fn args(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y"]
            .into_iter()
            .map(String::from)
            .collect();
        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.path.to_string_lossy().to_string());
        }

        let graphs = self
            .outputs
            .iter()
            .map(|o| o.graph().map(|g| g.render()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::configuration("Must compile outputs first"))?;
        args.push("-filter_complex".to_string());
        args.push(graphs.join(";"));

        for output in &self.outputs {
            args.extend(output.args()?);
        }
        Ok(args)
    }

    /// Run the process under a child of `parent`.
    pub async fn run(self, parent: &Worker) -> Result<()> {
        parent
            .spawn("process", move |worker| async move { self.execute(&worker).await })
            .join()
            .await
    }

    async fn execute(mut self, worker: &Worker) -> Result<()> {
        let settings = self.settings.clone();
        let workspace = Arc::new(Workspace::new()?);
        let mut ctx = CompileContext::new(
            worker.clone(),
            workspace,
            settings.clone(),
            self.ignore_broken_pipes,
        );

        let outcome = self.compile_and_run(&mut ctx).await;

        let reaped = match &outcome {
            Ok(()) => worker.join_children(settings.limit, settings.timeout).await,
            Err(e) => {
                warn!("Process failed ({}), shutting its workers down", e);
                worker.shutdown(Some(settings.reap_limit())).await
            }
        };

        outcome?;
        reaped
    }

    async fn compile_and_run(&mut self, ctx: &mut CompileContext) -> Result<()> {
        let args = self.compile(ctx)?;
        let pending = ctx.take_pending();
        debug!("{} sub-pipeline(s) spliced in", pending.len());

        let mut cmd = ToolCommand::new(&self.settings.ffmpeg);
        cmd.args(args)
            .timeout(self.settings.command_timeout)
            .limit(self.settings.limit)
            .ignore_broken_pipes(ctx.ignore_broken_pipes())
            .termination(self.settings.termination);
        info!("Running {}", cmd.command_line());

        let ran = cmd.execute(&ctx.worker).await.map(|_| ());
        if ran.is_err() {
            return ran;
        }

        for handle in pending {
            handle.join().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Layer, Overlay};
    use assert_matches::assert_matches;

    fn context(settings: ProcessSettings) -> CompileContext {
        CompileContext::new(
            Worker::root("test"),
            Arc::new(Workspace::new().unwrap()),
            Arc::new(settings),
            false,
        )
    }

    #[test]
    fn test_args_render_inputs_graph_and_maps() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.mp4");

        let mut process = Process::new(ProcessSettings::new("ffmpeg"));
        let clip = process.input("clip.mp4", true, true);
        let music = process.input("music.wav", false, true);
        process
            .output(&sink, Some(VideoChannel::default()), Some(AudioChannel::default()))
            .unwrap()
            .roll(Layer::new(clip))
            .unwrap()
            .overlay(Overlay::new(music))
            .unwrap();

        let mut ctx = context(ProcessSettings::new("ffmpeg"));
        let args = process.compile(&mut ctx).unwrap();

        assert_eq!(&args[..3], &["-hide_banner", "-nostdin", "-y"]);
        assert_eq!(&args[3..7], &["-i", "clip.mp4", "-i", "music.wav"]);
        assert_eq!(args[7], "-filter_complex");
        assert!(args[8].contains("amix=inputs=2"));
        assert_eq!(&args[9..13], &["-map", "[o0o0:v]", "-map", "[o0o0:a]"]);
        assert_eq!(args.last().unwrap(), &sink.to_string_lossy());
        assert!(ctx.take_pending().is_empty());
    }

    #[test]
    fn test_nothing_to_output() {
        let mut process = Process::new(ProcessSettings::new("ffmpeg"));
        let mut ctx = context(ProcessSettings::new("ffmpeg"));
        assert_matches!(process.compile(&mut ctx), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_args_require_compilation() {
        let mut process = Process::new(ProcessSettings::new("ffmpeg"));
        let clip = process.input("clip.mp4", true, true);
        process
            .output("/tmp/never-written.mp4", Some(VideoChannel::default()), Some(AudioChannel::default()))
            .unwrap()
            .roll(Layer::new(clip))
            .unwrap();
        assert!(process.args().is_err());
    }

    #[test]
    fn test_reap_limit_covers_escalation() {
        let mut settings = ProcessSettings::new("ffmpeg");
        settings.timeout = Duration::from_secs(1);
        settings.command_timeout = Duration::from_secs(1);
        settings.termination.grace = Some(Duration::from_secs(1));
        assert_eq!(settings.reap_limit(), Duration::from_secs(6));
    }
}
