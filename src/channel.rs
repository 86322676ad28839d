//! Worker channel: an isolated worker writing raw response bytes into a pipe.
//!
//! The worker is either an OS child process whose stdout is the pipe, or a
//! blocking function run on tokio's blocking pool that writes into a
//! [`PipeWriter`]. Either way the session only ever sees the read end, through
//! non-blocking calls made from its poll ticks.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Size of a single read from a child's stdout.
const READ_CHUNK: usize = 8 * 1024;

/// External command that performs the request and prints the response on stdout.
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl WorkerCommand {
    /// Creates a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Writes `payload` to the child's stdin, then closes it.
    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Returns the program name.
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Blocking worker function run off the async threads.
pub type WorkerFn = Box<dyn FnOnce(PipeWriter) -> io::Result<()> + Send + 'static>;

/// The code that performs the actual request.
pub enum Worker {
    /// Run an external command; its stdout is the pipe.
    Command(WorkerCommand),
    /// Run a blocking function that writes into the pipe.
    Task(WorkerFn),
}

impl Worker {
    /// Creates a worker from an external command.
    pub fn command(command: WorkerCommand) -> Self {
        Self::Command(command)
    }

    /// Creates a worker from a blocking function.
    pub fn task<F>(f: F) -> Self
    where
        F: FnOnce(PipeWriter) -> io::Result<()> + Send + 'static,
    {
        Self::Task(Box::new(f))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(command) => f.debug_tuple("Command").field(command).finish(),
            Self::Task(_) => f.write_str("Task(..)"),
        }
    }
}

enum PipeEvent {
    Data(Vec<u8>),
    Error(io::Error),
}

/// Write end of the pipe handed to in-process workers.
///
/// Writes fail with [`io::ErrorKind::BrokenPipe`] once the parent has terminated
/// the channel.
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<PipeEvent>,
}

impl PipeWriter {
    /// Returns true once the parent no longer wants output.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(PipeEvent::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed by parent"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum WorkerProcess {
    Child(Child),
    Task(JoinHandle<()>),
}

/// Parent side of a running worker.
pub struct SubprocessChannel {
    process: WorkerProcess,
    rx: mpsc::UnboundedReceiver<PipeEvent>,
    /// Bytes received from the pipe but not yet read by the session.
    pending: VecDeque<u8>,
    eof: bool,
    exited: bool,
    terminated: bool,
    read_error: Option<(io::ErrorKind, String)>,
}

impl SubprocessChannel {
    /// Starts the worker and returns the parent side of its pipe.
    ///
    /// Failing to start the worker is the only synchronous error; everything else
    /// surfaces through [`available`](Self::available) and
    /// [`is_done`](Self::is_done). Must be called from within a tokio runtime.
    pub fn start(worker: Worker) -> Result<Self> {
        match worker {
            Worker::Command(command) => Self::start_command(command),
            Worker::Task(f) => Ok(Self::start_task(f)),
        }
    }

    fn start_command(command: WorkerCommand) -> Result<Self> {
        tracing::debug!(program = %command.program, args = ?command.args, "starting worker process");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to spawn {}: {}", command.program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("worker stdout was not captured".to_string()))?;

        if let (Some(payload), Some(mut stdin)) = (command.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::warn!(error = %e, "failed to write request to worker stdin");
                }
                // Dropping stdin closes it so the worker sees end of input.
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(line = %line, "worker stderr");
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(PipeEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(PipeEvent::Error(e));
                        break;
                    }
                }
            }
        });

        Ok(Self::with_process(WorkerProcess::Child(child), rx))
    }

    fn start_task(f: WorkerFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let error_tx = tx.clone();
        let writer = PipeWriter { tx };

        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = f(writer) {
                // A broken pipe just means the parent stopped listening.
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = error_tx.send(PipeEvent::Error(e));
                }
            }
        });

        Self::with_process(WorkerProcess::Task(handle), rx)
    }

    fn with_process(process: WorkerProcess, rx: mpsc::UnboundedReceiver<PipeEvent>) -> Self {
        Self {
            process,
            rx,
            pending: VecDeque::new(),
            eof: false,
            exited: false,
            terminated: false,
            read_error: None,
        }
    }

    /// Moves everything the pipe has delivered so far into `pending`.
    fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(PipeEvent::Data(bytes)) => self.pending.extend(bytes),
                Ok(PipeEvent::Error(e)) => {
                    if self.read_error.is_none() {
                        self.read_error = Some((e.kind(), e.to_string()));
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
            }
        }
    }

    /// Number of bytes readable without blocking.
    ///
    /// Bytes received before a pipe error are still handed out first; the error is
    /// reported once nothing is left to read.
    pub fn available(&mut self) -> io::Result<usize> {
        self.pump();
        if !self.pending.is_empty() {
            return Ok(self.pending.len());
        }
        match &self.read_error {
            Some((kind, message)) => Err(io::Error::new(*kind, message.clone())),
            None => Ok(0),
        }
    }

    /// Reads at most `max` bytes, in arrival order.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        self.pump();
        let n = max.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    /// Returns true once the worker has exited and its pipe reached end of file.
    pub fn is_done(&mut self) -> bool {
        self.pump();
        if !self.exited {
            self.exited = match &mut self.process {
                WorkerProcess::Child(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!(status = %status, "worker process exited");
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to query worker status");
                        true
                    }
                },
                WorkerProcess::Task(handle) => handle.is_finished(),
            };
        }
        self.exited && self.eof
    }

    /// Signals the worker to stop. Idempotent.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let WorkerProcess::Child(child) = &mut self.process {
            if let Err(e) = child.start_kill() {
                // Already exited; nothing to kill.
                tracing::debug!(error = %e, "worker kill skipped");
            }
        }
        // Closing the receiver fails further writes, which stops task workers and
        // the stdout forwarder.
        self.rx.close();
    }

    /// Returns true once [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Releases the worker in the background.
    ///
    /// A terminated process is not necessarily reclaimable right away, so this
    /// retries every `interval` until [`is_done`](Self::is_done) holds, draining
    /// whatever the pipe still delivers.
    pub fn reap(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                self.pump();
                self.pending.clear();
                if self.is_done() {
                    tracing::debug!(attempts, "worker reaped");
                    break;
                }
                attempts += 1;
                tracing::debug!(attempts, "worker not yet reclaimable, retrying");
                tokio::time::sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn drain(channel: &mut SubprocessChannel) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while Instant::now() < deadline {
            let n = channel.available().expect("pipe error");
            if n > 0 {
                out.extend(channel.read(n));
            } else if channel.is_done() {
                return out;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker did not finish in time");
    }

    #[tokio::test]
    async fn task_worker_bytes_arrive_in_order() {
        let mut channel = SubprocessChannel::start(Worker::task(|mut pipe| {
            pipe.write_all(b"hello ")?;
            pipe.write_all(b"world")?;
            Ok(())
        }))
        .unwrap();

        assert_eq!(drain(&mut channel).await, b"hello world");
        assert!(channel.is_done());
        assert_eq!(channel.available().unwrap(), 0);
    }

    #[tokio::test]
    async fn read_is_bounded_by_max() {
        let mut channel = SubprocessChannel::start(Worker::task(|mut pipe| {
            pipe.write_all(b"abcdef")?;
            Ok(())
        }))
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while channel.available().unwrap() < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.read(4), b"abcd");
        assert_eq!(channel.available().unwrap(), 2);
        assert_eq!(channel.read(10), b"ef");
    }

    #[tokio::test]
    async fn worker_error_is_reported_after_pending_bytes() {
        let mut channel = SubprocessChannel::start(Worker::task(|mut pipe| {
            pipe.write_all(b"partial")?;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"))
        }))
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !channel.is_done() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.available().unwrap(), 7);
        assert_eq!(channel.read(7), b"partial");
        let err = channel.available().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn terminate_closes_pipe_for_task_worker() {
        let mut channel = SubprocessChannel::start(Worker::task(|pipe| {
            while !pipe.is_closed() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }))
        .unwrap();

        assert!(!channel.is_done());
        channel.terminate();
        channel.terminate();
        assert!(channel.is_terminated());

        let reaper = channel.reap(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(5), reaper)
            .await
            .expect("reap did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let result = SubprocessChannel::start(Worker::command(WorkerCommand::new(
            "/definitely/not/a/real/binary",
        )));
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_worker_streams_stdout() {
        let mut channel = SubprocessChannel::start(Worker::command(
            WorkerCommand::new("sh").args(["-c", "printf 'one\\ntwo\\n'"]),
        ))
        .unwrap();

        assert_eq!(drain(&mut channel).await, b"one\ntwo\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_worker_receives_stdin_payload() {
        let mut channel = SubprocessChannel::start(Worker::command(
            WorkerCommand::new("cat").stdin(b"{\"prompt\":\"hi\"}".to_vec()),
        ))
        .unwrap();

        assert_eq!(drain(&mut channel).await, b"{\"prompt\":\"hi\"}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminated_process_is_reaped() {
        let mut channel =
            SubprocessChannel::start(Worker::command(WorkerCommand::new("sleep").arg("30")))
                .unwrap();

        assert!(!channel.is_done());
        channel.terminate();
        let reaper = channel.reap(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), reaper)
            .await
            .expect("reap did not finish")
            .unwrap();
    }
}
