//! Supervised execution of external tool commands.
//!
//! A [`ToolCommand`] runs under its own child [`Worker`]. Standard output and
//! standard error are each drained by a reader worker so a chatty process
//! never blocks on a full pipe. Waiting is liveness-checked through
//! [`timeout_or_live`], and once the wait is over the process is made dead
//! with an escalating [`TerminationPolicy`].

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use reelforge_common::{timeout_or_live, Error, Result, Worker, WorkerHandle, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// Which stream carries the process's diagnostic chatter.
///
/// Lines of the diagnostic stream are logged at `debug`, the other stream at
/// `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Diagnostics {
    Stdout,
    #[default]
    Stderr,
}

/// How a lingering process is made dead (the `[termination]` config section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    /// Wait after each signal; defaults to a quarter of the limit, or 1s.
    #[serde(default, rename = "grace_secs", with = "opt_duration_secs")]
    pub grace: Option<Duration>,
    /// Graceful signals sent before the forceful one.
    #[serde(default = "default_term_attempts")]
    pub term_attempts: u32,
}

fn default_term_attempts() -> u32 {
    2
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: None,
            term_attempts: default_term_attempts(),
        }
    }
}

impl TerminationPolicy {
    pub fn grace_for(&self, limit: Option<Duration>) -> Duration {
        self.grace
            .or_else(|| limit.map(|l| l / 4))
            .unwrap_or(Duration::from_secs(1))
    }
}

/// Serde helpers for `Option<Duration>` as (fractional) seconds.
mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Outcome of making a process dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited on its own.
    Exited,
    /// It exited after the given number of graceful signals.
    Terminated { attempts: u32 },
    /// It needed the forceful signal.
    Killed,
    /// It survived the forceful signal; nothing more is attempted.
    StillAlive,
}

/// A builder for supervised external tool invocations.
///
/// # Example
///
/// ```no_run
/// use reelforge_av::ToolCommand;
/// use reelforge_common::Worker;
///
/// # async fn example() -> reelforge_common::Result<()> {
/// let root = Worker::root("main");
/// let output = ToolCommand::new("ffmpeg")
///     .arg("-hide_banner")
///     .arg("-version")
///     .execute(&root)
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    limit: Option<Duration>,
    stdin_data: Option<Vec<u8>>,
    ignore_broken_pipes: bool,
    diagnostics: Diagnostics,
    termination: TerminationPolicy,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            limit: None,
            stdin_data: None,
            ignore_broken_pipes: false,
            diagnostics: Diagnostics::default(),
            termination: TerminationPolicy::default(),
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Per-attempt wait before the parent's liveness is re-checked.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Hard deadline for the whole run.
    pub fn limit(&mut self, d: Option<Duration>) -> &mut Self {
        self.limit = d;
        self
    }

    /// Provide data to be written to the process's stdin.
    pub fn stdin(&mut self, data: Vec<u8>) -> &mut Self {
        self.stdin_data = Some(data);
        self
    }

    /// Accept death by `SIGPIPE` as success.
    pub fn ignore_broken_pipes(&mut self, ignore: bool) -> &mut Self {
        self.ignore_broken_pipes = ignore;
        self
    }

    pub fn diagnostics(&mut self, stream: Diagnostics) -> &mut Self {
        self.diagnostics = stream;
        self
    }

    pub fn termination(&mut self, policy: TerminationPolicy) -> &mut Self {
        self.termination = policy;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Human-readable command line.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Execute the command under a child of `parent`.
    ///
    /// # Errors
    ///
    /// - [`Error::Spawn`] if the process cannot be launched.
    /// - [`Error::TimeLimit`] if it outlives the limit, or [`Error::Parent`]
    ///   if `parent` dies first. The process is terminated either way.
    /// - [`Error::BrokenPipe`] if it died of `SIGPIPE` and broken pipes are
    ///   not ignored.
    /// - [`Error::CommandFailed`] for any other unsuccessful exit, carrying
    ///   the captured standard error.
    pub async fn execute(&self, parent: &Worker) -> Result<ToolOutput> {
        let cmd = self.clone();
        parent
            .spawn(format!("`{}`", self.program_name()), move |worker| async move {
                cmd.run(&worker).await
            })
            .join()
            .await
    }

    async fn run(&self, worker: &Worker) -> Result<ToolOutput> {
        let command_line = self.command_line();
        debug!("Running `{}`...", command_line);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let prefix = self.program_name().to_uppercase();
        let readers = [
            spawn_reader(
                worker,
                "stdout",
                child.stdout.take(),
                prefix.clone(),
                self.diagnostics == Diagnostics::Stdout,
            ),
            spawn_reader(
                worker,
                "stderr",
                child.stderr.take(),
                prefix,
                self.diagnostics == Diagnostics::Stderr,
            ),
        ];

        let waited = self.feed_and_wait(worker, &mut child, &command_line).await;
        let termination = self.process_dead(&mut child, &command_line).await;
        if termination == Termination::StillAlive {
            warn!("`{}` may linger after the run", command_line);
        }

        let [stdout, stderr] = readers;
        let grace = self.termination.grace_for(self.limit);
        let stdout = self.rejoin(worker, stdout, grace, &command_line).await;
        let stderr = self.rejoin(worker, stderr, grace, &command_line).await;

        let status = waited?;
        let (stdout, stderr) = (stdout?, stderr?);

        if status.success() {
            debug!("`{}` done", command_line);
            return Ok(ToolOutput {
                status,
                stdout,
                stderr,
            });
        }

        if status.signal() == Some(Signal::SIGPIPE as i32) {
            if self.ignore_broken_pipes {
                info!("Ignoring broken pipe: `{}`", command_line);
                return Ok(ToolOutput {
                    status,
                    stdout,
                    stderr,
                });
            }
            return Err(Error::BrokenPipe {
                command: command_line,
            });
        }

        Err(Error::CommandFailed {
            command: command_line,
            status: status.to_string(),
            stderr,
        })
    }

    async fn feed_and_wait(
        &self,
        worker: &Worker,
        child: &mut Child,
        command_line: &str,
    ) -> Result<ExitStatus> {
        let waiting = async {
            if let (Some(mut stdin), Some(data)) = (child.stdin.take(), &self.stdin_data) {
                if let Err(e) = stdin.write_all(data).await {
                    warn!("Failed to feed `{}`: {}", command_line, e);
                }
                // Dropping stdin closes the pipe so the child can proceed.
            }
            child.wait().await
        };

        timeout_or_live(
            worker,
            self.limit,
            self.timeout,
            || format!("feeding and waiting for `{command_line}`"),
            waiting,
        )
        .await?
        .map_err(Error::from)
    }

    async fn rejoin(
        &self,
        worker: &Worker,
        reader: WorkerHandle<String>,
        grace: Duration,
        command_line: &str,
    ) -> Result<String> {
        let name = reader.name().to_string();
        let abort = reader.abort_handle();
        let joining = reader.join();
        tokio::pin!(joining);

        match tokio::time::timeout(grace.max(self.timeout), &mut joining).await {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    "The {} of `{}` is still open, probably held by a descendant; abandoning it",
                    name, command_line
                );
                abort.abort();
                let _ = joining.await;
                Err(Error::system(format!(
                    "failed to rejoin the {name} of `{command_line}` in {}",
                    worker.name()
                )))
            }
        }
    }

    /// Make sure the process is dead, escalating from graceful signals to a
    /// forceful one.
    async fn process_dead(&self, child: &mut Child, command_line: &str) -> Termination {
        if let Ok(Some(_)) = child.try_wait() {
            return Termination::Exited;
        }
        let Some(pid) = child.id() else {
            return Termination::Exited;
        };
        let pid = Pid::from_raw(pid as i32);
        let grace = self.termination.grace_for(self.limit);

        for attempt in 1..=self.termination.term_attempts {
            if attempt == 1 {
                warn!("Sorry it came to this, but I'm terminating `{}`({})...", command_line, pid);
            } else {
                warn!(
                    "Very sorry it came to this, but I'm terminating `{}`({}) again...",
                    command_line, pid
                );
            }
            send(pid, Signal::SIGTERM);
            if exited_within(child, grace).await {
                return Termination::Terminated { attempts: attempt };
            }
        }

        warn!("Die `{}`({}), die! (killing amok)", command_line, pid);
        send(pid, Signal::SIGKILL);
        debug!("Checking if `{}`({}) is finally dead...", command_line, pid);
        if exited_within(child, grace).await {
            return Termination::Killed;
        }

        error!("Still alive `{}`({}) -- giving up", command_line, pid);
        Termination::StillAlive
    }
}

fn send(pid: Pid, sig: Signal) {
    if let Err(e) = signal::kill(pid, sig) {
        debug!("Sending {} to {} failed: {}", sig, pid, e);
    }
}

async fn exited_within(child: &mut Child, grace: Duration) -> bool {
    matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_)))
}

fn spawn_reader<R>(
    worker: &Worker,
    name: &str,
    stream: Option<R>,
    prefix: String,
    diagnostic: bool,
) -> WorkerHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    worker.spawn(format!("{} {name} reader", worker.name()), move |_| async move {
        let mut text = String::new();
        let Some(stream) = stream else {
            return Ok(text);
        };

        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if diagnostic {
                debug!("{}: {}", prefix, line);
            } else {
                info!("{}: {}", prefix, line);
            }
            text.push_str(line);
            text.push('\n');
        }
        Ok(text)
    })
}
