//! Execution router: runs interactive or batch commands on a machine.
//!
//! The request variant alone picks the strategy. Interactive requests pipe
//! the caller's input and output streams through the transport client as
//! data arrives; batch requests run without input and buffer output up to a
//! fixed bound. Every run has a deadline and a cancellation path that ends
//! with the process killed.

mod error;
mod transport;

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use error::ExecError;

use crate::config::ExecConfig;
use crate::resource::{AuthMethod, ConnectionParams};
use transport::{Invocation, classify_failure, invocation};

/// Input stream attached to an interactive command.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Output sink receiving an interactive command's stdout or stderr.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Exit code reported when the process ended without one (killed by a signal).
pub const SIGNALLED_EXIT_CODE: i32 = -1;

const CHUNK_SIZE: usize = 8 * 1024;
const STDERR_TAIL: usize = 4 * 1024;

/// Command streaming caller input and output.
pub struct InteractiveExec {
    /// Shell command line run on the machine.
    pub command: String,
    /// Caller input forwarded to the process.
    pub stdin: InputStream,
    /// Receives the process stdout as it arrives.
    pub stdout: OutputSink,
    /// Receives the process stderr as it arrives.
    pub stderr: OutputSink,
    /// Closes the input when cancelled; the process is killed if it
    /// outlives the grace period.
    pub cancel: CancellationToken,
    /// Overall deadline.
    pub timeout: Option<Duration>,
}

/// Command run without input, output captured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchExec {
    /// Shell command line run on the machine.
    pub command: String,
    /// Overall deadline.
    pub timeout: Option<Duration>,
}

/// What to run and how.
pub enum ExecutionRequest {
    /// Streamed execution; the only variant that carries input.
    Interactive(InteractiveExec),
    /// Captured execution.
    Batch(BatchExec),
}

impl ExecutionRequest {
    /// Batch request without a deadline.
    #[must_use]
    pub fn batch(command: impl Into<String>) -> Self {
        Self::Batch(BatchExec {
            command: command.into(),
            timeout: None,
        })
    }

    /// Interactive request wired to the given streams.
    #[must_use]
    pub fn interactive(
        command: impl Into<String>,
        stdin: InputStream,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Self {
        Self::Interactive(InteractiveExec {
            command: command.into(),
            stdin,
            stdout,
            stderr,
            cancel: CancellationToken::new(),
            timeout: None,
        })
    }

    /// Sets the overall deadline.
    #[must_use]
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        match &mut self {
            Self::Interactive(request) => request.timeout = Some(limit),
            Self::Batch(request) => request.timeout = Some(limit),
        }
        self
    }

    fn command(&self) -> &str {
        match self {
            Self::Interactive(request) => &request.command,
            Self::Batch(request) => &request.command,
        }
    }
}

/// Captured streams of a batch run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CapturedOutput {
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    /// Stdout decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Outcome of a run; the variant mirrors the request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionResult {
    /// Result of an interactive request.
    Interactive {
        /// Remote exit code, [`SIGNALLED_EXIT_CODE`] when there was none.
        exit_code: i32,
    },
    /// Result of a batch request.
    Batch {
        /// Remote exit code, [`SIGNALLED_EXIT_CODE`] when there was none.
        exit_code: i32,
        /// Captured output.
        output: CapturedOutput,
    },
}

impl ExecutionResult {
    /// Exit code regardless of variant.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Interactive { exit_code } | Self::Batch { exit_code, .. } => *exit_code,
        }
    }
}

/// Picks the transport from connection params and runs requests through it.
#[derive(Clone, Debug)]
pub struct ExecutionRouter {
    config: ExecConfig,
}

impl ExecutionRouter {
    /// Creates a router.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Configuration`] when validation fails.
    pub fn new(config: ExecConfig) -> Result<Self, ExecError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs `request` on the machine described by `params`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Configuration`] for interactive requests
    /// against batch-only params, [`ExecError::Unreachable`] when the
    /// machine cannot be dialed, [`ExecError::Authentication`] when keys
    /// are rejected, [`ExecError::Timeout`] when the deadline expires and
    /// [`ExecError::OutputTooLarge`] when batch output exceeds the bound.
    pub async fn execute(
        &self,
        params: &ConnectionParams,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        let interactive = matches!(request, ExecutionRequest::Interactive(_));
        if interactive && !params.interactive {
            return Err(ExecError::Configuration(format!(
                "machine {} only supports batch execution",
                params.machine_id
            )));
        }
        let invocation = invocation(&self.config, params, request.command(), interactive)?;
        self.preflight(params).await?;
        debug!(
            machine = %params.machine_id,
            program = %invocation.program,
            interactive,
            "executing command"
        );
        match request {
            ExecutionRequest::Interactive(request) => {
                self.run_interactive(&invocation, request).await
            }
            ExecutionRequest::Batch(request) => self.run_batch(&invocation, &request).await,
        }
    }

    async fn preflight(&self, params: &ConnectionParams) -> Result<(), ExecError> {
        let (AuthMethod::Ssh { .. }, Some(address)) = (&params.auth, params.address.as_ref())
        else {
            return Ok(());
        };
        let dial = TcpStream::connect((address.host.as_str(), address.port));
        match timeout(self.config.dial_timeout(), dial).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(ExecError::Unreachable(format!("{address}: {err}"))),
            Err(_elapsed) => Err(ExecError::Unreachable(format!(
                "{address}: no answer within {}s",
                self.config.dial_timeout_secs
            ))),
        }
    }

    fn spawn(invocation: &Invocation, stdin: Stdio) -> Result<Child, ExecError> {
        Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecError::Spawn {
                program: invocation.program.clone(),
                message: err.to_string(),
            })
    }

    async fn run_batch(
        &self,
        invocation: &Invocation,
        request: &BatchExec,
    ) -> Result<ExecutionResult, ExecError> {
        let mut child = Self::spawn(invocation, Stdio::null())?;
        let limit = self.config.output_limit();
        let outcome = with_deadline(request.timeout, collect_batch(&mut child, limit)).await;
        let (status, output) = match outcome {
            Ok(done) => done,
            Err(err) => {
                kill(&mut child).await;
                return Err(err);
            }
        };
        let exit_code = status.code();
        if let Some(err) = classify_failure(invocation.transport, exit_code, &output.stderr) {
            return Err(err);
        }
        Ok(ExecutionResult::Batch {
            exit_code: exit_code.unwrap_or(SIGNALLED_EXIT_CODE),
            output,
        })
    }

    async fn run_interactive(
        &self,
        invocation: &Invocation,
        request: InteractiveExec,
    ) -> Result<ExecutionResult, ExecError> {
        let InteractiveExec {
            stdin,
            mut stdout,
            mut stderr,
            cancel,
            timeout: deadline,
            ..
        } = request;
        let mut child = Self::spawn(invocation, Stdio::piped())?;
        let input = tokio::spawn(pump_input(stdin, child.stdin.take(), cancel.clone()));
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let session = async {
            let mut tail = Vec::new();
            let (status, copied_out, copied_err) = tokio::join!(
                wait_or_cancel(&mut child, &cancel, self.config.cancel_grace()),
                forward(child_stdout, &mut stdout, None),
                forward(child_stderr, &mut stderr, Some(&mut tail)),
            );
            copied_out?;
            copied_err?;
            Ok::<_, ExecError>((status?, tail))
        };
        let outcome = with_deadline(deadline, session).await;
        input.abort();
        let (status, tail) = match outcome {
            Ok(done) => done,
            Err(err) => {
                kill(&mut child).await;
                return Err(err);
            }
        };
        let exit_code = status.code();
        if let Some(err) = classify_failure(invocation.transport, exit_code, &tail) {
            return Err(err);
        }
        Ok(ExecutionResult::Interactive {
            exit_code: exit_code.unwrap_or(SIGNALLED_EXIT_CODE),
        })
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, work: F) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, ExecError>>,
{
    match deadline {
        Some(after) => timeout(after, work)
            .await
            .unwrap_or(Err(ExecError::Timeout { after })),
        None => work.await,
    }
}

async fn kill(child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(error = %err, "process already gone");
    }
}

async fn collect_batch(
    child: &mut Child,
    limit: usize,
) -> Result<(ExitStatus, CapturedOutput), ExecError> {
    let used = AtomicUsize::new(0);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = tokio::try_join!(
        read_capped(stdout, &used, limit),
        read_capped(stderr, &used, limit),
    )?;
    let status = child.wait().await?;
    Ok((status, CapturedOutput { stdout, stderr }))
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    used: &AtomicUsize,
    limit: usize,
) -> Result<Vec<u8>, ExecError> {
    let mut captured = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };
    let mut chunk = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(captured);
        }
        let total = used.fetch_add(read, Ordering::SeqCst).saturating_add(read);
        if total > limit {
            return Err(ExecError::OutputTooLarge { limit });
        }
        captured.extend(chunk.iter().take(read));
    }
}

async fn forward<R: AsyncRead + Unpin>(
    reader: Option<R>,
    sink: &mut OutputSink,
    mut tail: Option<&mut Vec<u8>>,
) -> Result<(), ExecError> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).await?;
        let data = chunk.get(..read).unwrap_or_default();
        if data.is_empty() {
            sink.flush().await?;
            return Ok(());
        }
        sink.write_all(data).await?;
        sink.flush().await?;
        if let Some(buffer) = tail.as_deref_mut() {
            buffer.extend_from_slice(data);
            let excess = buffer.len().saturating_sub(STDERR_TAIL);
            buffer.drain(..excess);
        }
    }
}

async fn pump_input(
    mut source: InputStream,
    sink: Option<tokio::process::ChildStdin>,
    cancel: CancellationToken,
) {
    let Some(mut sink) = sink else {
        return;
    };
    tokio::select! {
        copied = tokio::io::copy(&mut source, &mut sink) => {
            if let Err(err) = copied {
                debug!(error = %err, "input stream ended with an error");
            }
        }
        () = cancel.cancelled() => debug!("input closed by cancellation"),
    }
    if let Err(err) = sink.shutdown().await {
        debug!(error = %err, "closing process input failed");
    }
}

async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<ExitStatus, ExecError> {
    tokio::select! {
        status = child.wait() => return Ok(status?),
        () = cancel.cancelled() => {}
    }
    if let Ok(status) = timeout(grace, child.wait()).await {
        return Ok(status?);
    }
    warn!(grace_secs = grace.as_secs(), "process outlived cancellation; killing it");
    child.kill().await?;
    Ok(child.wait().await?)
}

#[cfg(test)]
mod tests;
