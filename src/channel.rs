//! Restartable line-protocol channel to a cooperating subprocess
//!
//! The counterpart process accepts one text request per line on its input and
//! answers each with exactly one status line on the control stream, while the
//! bulk payload for confirmed requests flows out the data stream. Responses
//! are correlated to requests purely by order, so a channel never has more
//! than one request in flight.

use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Destination for the subprocess's bulk payload stream.
pub type DataSink = Box<dyn AsyncWrite + Send + Unpin>;

type DataStream = Box<dyn AsyncRead + Send + Unpin>;

/// Command line used to start (and restart) the subprocess.
#[derive(Debug, Clone)]
pub struct ChannelCommand {
    program: String,
    args: Vec<String>,
}

impl ChannelCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Which physical stream plays which role.
///
/// The protocol only fixes the meaning (control carries short status lines,
/// data carries payload); which of stdout/stderr is which has varied between
/// counterpart programs, so it stays configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamAssignment {
    /// Status lines on stdout, payload on stderr
    #[default]
    ControlOnStdout,
    /// Status lines on stderr, payload on stdout
    ControlOnStderr,
}

/// The closed vocabulary a well-behaved subprocess may answer with.
///
/// Anything outside the two recognized lines is kept verbatim in `Other` so
/// the protocol-violation path can report what was actually said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Success,
    TryAgain,
    Other(String),
}

impl ControlResponse {
    /// Parse one control line. Only the line terminator is stripped; the
    /// recognized responses are exact literals, not fuzzy matches.
    pub fn parse(line: &str) -> Self {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        match line {
            "success" => ControlResponse::Success,
            "please try again" => ControlResponse::TryAgain,
            other => ControlResponse::Other(other.to_string()),
        }
    }
}

struct ActiveProcess {
    child: Child,
    // Dropping the handle half-closes the pipe, which is the graceful
    // shutdown request. None once close() has run.
    stdin: Option<ChildStdin>,
    control: BufReader<DataStream>,
}

/// A lazily started, restartable channel to a line-protocol subprocess.
///
/// Construction spawns nothing; the process starts on the first
/// [`make_request`](Self::make_request) and a process that has exited is
/// quietly replaced on the next request. The channel never kills its
/// process: [`close`](Self::close) asks for a graceful finish and
/// [`wait_for_done`](Self::wait_for_done) waits for it.
pub struct SubprocessChannel {
    command: ChannelCommand,
    assignment: StreamAssignment,
    // Parked here while no pump task owns it.
    sink: Option<DataSink>,
    active: Option<ActiveProcess>,
    pump: Option<JoinHandle<DataSink>>,
}

impl SubprocessChannel {
    /// Remember how to start the process and where its payload should go.
    /// Nothing is spawned until the first request.
    pub fn new(command: ChannelCommand, assignment: StreamAssignment, data_sink: DataSink) -> Self {
        Self {
            command,
            assignment,
            sink: Some(data_sink),
            active: None,
            pump: None,
        }
    }

    /// Send a request and wait for the subprocess to confirm it.
    ///
    /// A `"please try again"` answer resends the identical request, forever;
    /// each retry is logged with `status` so a stuck run is observable. Any
    /// response outside the vocabulary is a [`Error::ProtocolViolation`].
    /// The exclusive borrow keeps requests strictly serialized, which the
    /// order-correlated protocol depends on.
    pub async fn make_request(&mut self, request: &str, status: impl fmt::Display) -> Result<()> {
        loop {
            match self.make_request_once(request).await? {
                ControlResponse::Success => return Ok(()),
                ControlResponse::TryAgain => info!("Automatic retry @ {}", status),
                ControlResponse::Other(line) => {
                    // The contract is broken, so half-close stdin and let the
                    // error propagate rather than guessing at recovery.
                    warn!("Unexpected response: {:?}", line);
                    self.close();
                    return Err(Error::ProtocolViolation(line));
                }
            }
        }
    }

    async fn make_request_once(&mut self, request: &str) -> Result<ControlResponse> {
        if request.contains('\n') {
            return Err(Error::Config(format!(
                "request must be a single line, got {:?}",
                request
            )));
        }
        self.start_if_required().await?;
        let active = self.active.as_mut().ok_or(Error::ChannelClosed)?;
        let stdin = active.stdin.as_mut().ok_or(Error::ChannelClosed)?;

        stdin.write_all(request.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        let mut line = String::new();
        let n = active.control.read_line(&mut line).await?;
        if n == 0 {
            // Exited instead of answering; raising beats hanging here.
            return Err(Error::ChannelClosed);
        }
        Ok(ControlResponse::parse(&line))
    }

    /// Ensure a live process exists. An exited one is drained and discarded
    /// first so payload ordering survives the restart.
    async fn start_if_required(&mut self) -> Result<()> {
        if let Some(active) = &mut self.active {
            match active.child.try_wait()? {
                None => return Ok(()),
                Some(status) => {
                    info!("Subprocess exited with {}, starting a fresh one", status);
                    self.active = None;
                    self.reclaim_sink().await?;
                }
            }
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;

        let stdin = child.stdin.take().ok_or_else(|| pipe_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_missing("stderr"))?;

        let (control, data): (DataStream, DataStream) = match self.assignment {
            StreamAssignment::ControlOnStdout => (Box::new(stdout), Box::new(stderr)),
            StreamAssignment::ControlOnStderr => (Box::new(stderr), Box::new(stdout)),
        };

        let mut sink = self.sink.take().ok_or(Error::ChannelClosed)?;
        self.pump = Some(tokio::spawn(async move {
            let mut data = data;
            match tokio::io::copy(&mut data, &mut sink).await {
                Ok(bytes) => debug!("Data stream drained after {} bytes", bytes),
                Err(e) => warn!("Data stream pump failed: {}", e),
            }
            if let Err(e) = sink.flush().await {
                warn!("Data sink flush failed: {}", e);
            }
            sink
        }));

        self.active = Some(ActiveProcess {
            child,
            stdin: Some(stdin),
            control: BufReader::new(control),
        });
        Ok(())
    }

    /// Join the pump task, if any, and take the data sink back.
    async fn reclaim_sink(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            let sink = pump
                .await
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            self.sink = Some(sink);
        }
        Ok(())
    }

    /// Ask the subprocess for a graceful finish by closing its input, the
    /// pipe equivalent of typing ctrl-D at it.
    ///
    /// Never kills the process, never errors, and does nothing when the
    /// process was never started or the input is already closed.
    pub fn close(&mut self) {
        if let Some(active) = &mut self.active {
            active.stdin = None;
        }
    }

    /// Wait until both streams are drained and the process has exited.
    ///
    /// Resolves immediately when nothing was started or everything already
    /// finished, and is safe to call more than once. This only waits; pair it
    /// with [`close`](Self::close) for a process that reads until end of
    /// input. A subprocess may answer its last request while payload is still
    /// queued on the data stream, which is exactly the case this exists for.
    pub async fn wait_for_done(&mut self) -> Result<()> {
        if let Some(mut active) = self.active.take() {
            let mut line = String::new();
            loop {
                line.clear();
                match active.control.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = line.trim_end();
                        if !text.is_empty() {
                            debug!("Late control line: {:?}", text);
                        }
                    }
                    Err(e) => {
                        warn!("Control stream error while draining: {}", e);
                        break;
                    }
                }
            }
            let status = active.child.wait().await?;
            debug!("Subprocess exited with {}", status);
        }
        self.reclaim_sink().await
    }
}

fn pipe_missing(name: &str) -> Error {
    Error::Spawn(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("subprocess {} was not piped", name),
    ))
}
