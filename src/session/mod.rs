//! Session orchestration shared by streaming and bulk requests.
//!
//! A session owns one [`SubprocessChannel`] and drives it from a poll task. The
//! terminal outcome goes through [`SessionControl::resolve`], which takes the state
//! lock, so the poll task and the timeout task can race without ever both winning:
//! the completion callback runs exactly once.

mod bulk;
mod stream;

pub use bulk::{BulkSession, ResponseParser, VendorResponseParser};
pub use stream::{NoopObserver, StreamObserver, StreamSession};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{SubprocessChannel, Worker};
use crate::config::{EngineConfig, Validate};
use crate::decoder;
use crate::error::{Result, SessionError};
use crate::registry::{SessionKind, SessionRegistry};
use crate::scheduler::{PollScheduler, TickOutcome, TimeoutGuard};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, worker not yet running.
    Pending,
    /// Worker running, ticks in progress.
    Running,
    /// Finished with a response.
    Completed,
    /// Stopped by the caller.
    Cancelled,
    /// Stopped by the deadline.
    TimedOut,
    /// Finished with an error.
    Failed,
}

impl SessionState {
    /// Returns true for the four terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }

    fn for_result(result: &std::result::Result<Response, SessionError>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(SessionError::Cancelled) => Self::Cancelled,
            Err(SessionError::TimedOut(_)) => Self::TimedOut,
            Err(_) => Self::Failed,
        }
    }
}

/// Provider reasoning observed during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reasoning {
    /// True if any frame carried reasoning, even without text.
    pub observed: bool,
    /// Reasoning text, when the provider sent it.
    pub text: Option<String>,
}

impl Reasoning {
    pub(crate) fn record(&mut self, text: Option<&str>) {
        self.observed = true;
        if let Some(text) = text {
            self.text.get_or_insert_with(String::new).push_str(text);
        }
    }
}

/// Successful session result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// Answer text, trimmed.
    pub content: String,
    /// Reasoning information.
    pub reasoning: Reasoning,
    /// Provider metadata such as token usage.
    pub metadata: Option<Value>,
}

/// What the completion callback receives.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Session identifier.
    pub session_id: Uuid,
    /// Terminal state.
    pub state: SessionState,
    /// Response or failure.
    pub result: std::result::Result<Response, SessionError>,
}

impl SessionOutcome {
    /// Returns true if the session completed with a response.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Terminal callback.
pub type CompletionCallback = Box<dyn FnOnce(SessionOutcome) + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared by the poll task, the timeout task and the caller's handle.
pub(crate) struct SessionControl {
    id: Uuid,
    state: Mutex<SessionState>,
    callback: Mutex<Option<CompletionCallback>>,
    cancel_requested: AtomicBool,
    deadline: Mutex<Option<(Instant, Duration)>>,
    stop: CancellationToken,
    settled: CancellationToken,
}

impl SessionControl {
    pub(crate) fn new(id: Uuid, callback: CompletionCallback) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::Pending),
            callback: Mutex::new(Some(callback)),
            cancel_requested: AtomicBool::new(false),
            deadline: Mutex::new(None),
            stop: CancellationToken::new(),
            settled: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    fn mark_running(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Pending {
            *state = SessionState::Running;
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn arm_deadline(&self, timeout: Duration) {
        *lock(&self.deadline) = Instant::now()
            .checked_add(timeout)
            .map(|deadline| (deadline, timeout));
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Moves the session to its terminal state and fires the callback.
    ///
    /// Returns false if the session was already terminal. Once the deadline has
    /// passed, any other outcome is replaced by a timeout.
    pub(crate) fn resolve(&self, result: std::result::Result<Response, SessionError>) -> bool {
        let result = match *lock(&self.deadline) {
            Some((deadline, timeout))
                if Instant::now() >= deadline
                    && !matches!(result, Err(SessionError::TimedOut(_))) =>
            {
                Err(SessionError::TimedOut(timeout))
            }
            _ => result,
        };

        let state = SessionState::for_result(&result);
        let callback = {
            let mut current = lock(&self.state);
            if current.is_terminal() {
                return false;
            }
            *current = state;
            lock(&self.callback).take()
        };

        match &result {
            Ok(response) => tracing::info!(
                session_id = %self.id,
                chars = response.content.len(),
                reasoning = response.reasoning.observed,
                "session completed"
            ),
            Err(e) => tracing::info!(session_id = %self.id, state = ?state, error = %e, "session ended"),
        }

        let _settle = Settle(self);
        if let Some(callback) = callback {
            callback(SessionOutcome {
                session_id: self.id,
                state,
                result,
            });
        }
        true
    }

    /// Completes once the callback has returned.
    pub(crate) async fn settled(&self) {
        self.settled.cancelled().await
    }
}

/// Stops the poll loop and releases waiters on drop, also when the callback unwinds.
struct Settle<'a>(&'a SessionControl);

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.0.stop.cancel();
        self.0.settled.cancel();
    }
}

/// Caller's view of a running session.
pub struct SessionHandle {
    control: Arc<SessionControl>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.control.id()
    }

    /// Requests cancellation. Takes effect at the next poll tick.
    pub fn cancel(&self) {
        tracing::debug!(session_id = %self.control.id(), "cancellation requested");
        self.control.request_cancel();
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Returns true once the session reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.control.is_terminal()
    }

    /// Waits until the completion callback has run, without consuming the handle.
    pub async fn wait(&self) -> SessionState {
        self.control.settled().await;
        self.control.state()
    }

    /// Waits until the completion callback has run and the poll task has wound
    /// down, then returns the final state.
    pub async fn finished(self) -> SessionState {
        if let Err(e) = self.task.await {
            tracing::error!(session_id = %self.control.id(), error = %e, "poll task failed");
        }
        self.control.settled().await;
        self.control.state()
    }
}

/// Per-session decoding logic driven by the poll loop.
pub(crate) trait Pipeline: Send + 'static {
    /// Runs one poll tick.
    fn tick(&mut self) -> TickOutcome;

    /// Gives the channel back once the loop ends.
    fn into_channel(self) -> SubprocessChannel;
}

/// Result of the common tick prologue.
pub(crate) enum Intake {
    /// The session is terminal; stop polling.
    Stop,
    /// Bytes read this tick, possibly none.
    Bytes(Vec<u8>),
}

/// Checks terminal state and cancellation, then reads at most `max` bytes.
pub(crate) fn intake(
    channel: &mut SubprocessChannel,
    control: &SessionControl,
    max: usize,
) -> Intake {
    if control.is_terminal() {
        return Intake::Stop;
    }
    if control.cancel_requested() {
        channel.terminate();
        control.resolve(Err(SessionError::Cancelled));
        return Intake::Stop;
    }
    match channel.available() {
        Ok(0) => Intake::Bytes(Vec::new()),
        Ok(n) => {
            let bytes = channel.read(n.min(max));
            tracing::trace!(session_id = %control.id(), bytes = bytes.len(), "read from worker");
            Intake::Bytes(bytes)
        }
        Err(e) => {
            channel.terminate();
            control.resolve(Err(SessionError::Read(e.to_string())));
            Intake::Stop
        }
    }
}

/// Builds the failure for a response that carried the non-success sentinel.
///
/// `tail` is everything after the sentinel: an optional status code followed by the
/// raw error body.
pub(crate) fn transport_error(tail: &str, limit: usize) -> SessionError {
    let tail = tail.trim();
    let (status, body) = match tail.split_once(char::is_whitespace) {
        Some((code, rest)) if code.chars().all(|c| c.is_ascii_digit()) => {
            (Some(code.to_string()), rest.trim())
        }
        None if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => {
            (Some(tail.to_string()), "")
        }
        _ => (None, tail),
    };

    let message = decoder::extract_tail_error(body).unwrap_or_else(|| {
        let label = status.as_deref().unwrap_or("error");
        if body.is_empty() {
            format!("HTTP {}", label)
        } else {
            format!("HTTP {}: {}", label, decoder::truncate_diagnostic(body, limit))
        }
    });
    SessionError::Transport { status, message }
}

/// Returns true when the worker is gone and nothing is left to read.
pub(crate) fn drained(channel: &mut SubprocessChannel) -> bool {
    channel.is_done() && matches!(channel.available(), Ok(0))
}

/// Starts the worker and the poll/timeout tasks for a session.
pub(crate) fn launch<P, B>(
    config: &EngineConfig,
    registry: Option<&SessionRegistry>,
    kind: SessionKind,
    worker: Worker,
    on_complete: CompletionCallback,
    build: B,
) -> Result<SessionHandle>
where
    P: Pipeline,
    B: FnOnce(SubprocessChannel, Arc<SessionControl>) -> P,
{
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "engine configuration");
    }

    let channel = SubprocessChannel::start(worker)?;
    let id = Uuid::new_v4();
    let control = SessionControl::new(id, on_complete);
    let ticket = registry.map(|r| r.register(id, kind));

    let timeout = config.timeout();
    control.mark_running();
    control.arm_deadline(timeout);
    TimeoutGuard::arm(timeout, control.stop_token(), {
        let control = control.clone();
        move || {
            if control.resolve(Err(SessionError::TimedOut(timeout))) {
                tracing::warn!(session_id = %control.id(), timeout_secs = timeout.as_secs(), "session deadline elapsed");
            }
        }
    });

    tracing::info!(
        session_id = %id,
        kind = ?kind,
        poll_interval_ms = config.poll_interval_ms,
        timeout_secs = config.timeout_secs,
        "session started"
    );

    let scheduler = PollScheduler::new(config.poll_interval(), control.stop_token());
    let reap_interval = config.reap_interval();
    let mut pipeline = build(channel, control.clone());

    let task = tokio::spawn(async move {
        let ticks = scheduler.run(|| pipeline.tick()).await;
        tracing::debug!(session_id = %id, ticks, "poll loop finished");

        let mut channel = pipeline.into_channel();
        channel.terminate();
        channel.reap(reap_interval);
        drop(ticket);
    });

    Ok(SessionHandle { control, task })
}
