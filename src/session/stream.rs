//! Incremental sessions: decode the worker's output line by line and surface each
//! content fragment as it arrives.

use std::sync::Arc;

use crate::channel::{SubprocessChannel, Worker};
use crate::config::EngineConfig;
use crate::decoder::{self, NormalizedEvent};
use crate::error::{Result, SessionError};
use crate::framing::LineFramer;
use crate::registry::{SessionKind, SessionRegistry};
use crate::scheduler::TickOutcome;

use super::{
    drained, intake, launch, transport_error, Intake, Pipeline, Reasoning, Response,
    SessionControl, SessionHandle, SessionOutcome,
};

/// Receives incremental updates while a stream session runs.
///
/// Calls happen on the session's poll task, in the order the source lines arrived.
pub trait StreamObserver: Send + 'static {
    /// The first content fragment is about to be delivered.
    fn on_first_content(&mut self) {}

    /// A content fragment arrived. `accumulated` already includes it.
    fn on_fragment(&mut self, fragment: &str, accumulated: &str);

    /// A frame carried provider reasoning.
    fn on_reasoning(&mut self, _text: Option<&str>) {}
}

impl<F> StreamObserver for F
where
    F: FnMut(&str, &str) + Send + 'static,
{
    fn on_fragment(&mut self, fragment: &str, accumulated: &str) {
        self(fragment, accumulated)
    }
}

/// Observer that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {
    fn on_fragment(&mut self, _fragment: &str, _accumulated: &str) {}
}

/// Starts incremental sessions.
#[derive(Debug, Clone, Default)]
pub struct StreamSession {
    config: EngineConfig,
    registry: Option<SessionRegistry>,
}

impl StreamSession {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
        }
    }

    /// Registers every started session with `registry` while it runs.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts `worker` and streams its output to `observer`.
    ///
    /// `on_complete` runs exactly once with the terminal outcome. Only a failure to
    /// start the worker or an invalid configuration is returned here. Must be
    /// called from within a tokio runtime.
    pub fn start<O, C>(&self, worker: Worker, observer: O, on_complete: C) -> Result<SessionHandle>
    where
        O: StreamObserver,
        C: FnOnce(SessionOutcome) + Send + 'static,
    {
        let max_read = self.config.max_read_per_tick;
        let diagnostic_limit = self.config.diagnostic_limit;

        launch(
            &self.config,
            self.registry.as_ref(),
            SessionKind::Stream,
            worker,
            Box::new(on_complete),
            move |channel, control| StreamPipeline {
                channel,
                control,
                observer: Box::new(observer),
                framer: LineFramer::new(),
                accumulated: String::new(),
                reasoning: Reasoning::default(),
                started: false,
                failure: None,
                max_read,
                diagnostic_limit,
            },
        )
    }
}

struct StreamPipeline {
    channel: SubprocessChannel,
    control: Arc<SessionControl>,
    observer: Box<dyn StreamObserver>,
    framer: LineFramer,
    accumulated: String,
    reasoning: Reasoning,
    started: bool,
    /// Raw text after the non-success sentinel, once it has been seen.
    failure: Option<String>,
    max_read: usize,
    diagnostic_limit: usize,
}

impl StreamPipeline {
    /// Feeds bytes through the framer. Returns true once a frame ends the stream.
    fn process(&mut self, bytes: &[u8]) -> bool {
        for line in self.framer.feed(bytes) {
            if self.handle_line(&line) {
                return true;
            }
        }
        false
    }

    fn handle_line(&mut self, line: &str) -> bool {
        if let Some(body) = &mut self.failure {
            body.push('\n');
            body.push_str(line);
            return false;
        }
        match decoder::decode_line(line) {
            Some(event) => self.apply(event),
            None => false,
        }
    }

    fn apply(&mut self, event: NormalizedEvent) -> bool {
        if let Some(marker) = event.error_marker {
            tracing::debug!(session_id = %self.control.id(), marker = %marker, "non-success status reported");
            self.failure = Some(marker);
            return false;
        }

        if event.is_reasoning {
            self.reasoning.record(event.reasoning_text.as_deref());
            self.observer.on_reasoning(event.reasoning_text.as_deref());
        }

        if let Some(fragment) = event.content.filter(|c| !c.is_empty()) {
            if !self.started {
                self.started = true;
                self.observer.on_first_content();
            }
            self.accumulated.push_str(&fragment);
            self.observer.on_fragment(&fragment, &self.accumulated);
        }

        event.is_done
    }

    fn finalize(&mut self, mut done: bool) {
        while !done {
            match self.channel.available() {
                Ok(n) if n > 0 => {
                    let bytes = self.channel.read(n);
                    done = self.process(&bytes);
                }
                _ => break,
            }
        }

        let mut leftover = String::new();
        if let Some(rest) = self.framer.take_remainder() {
            if !done {
                self.handle_line(&rest);
            }
            leftover = rest;
        }

        let result = if let Some(tail) = self.failure.take() {
            Err(transport_error(&tail, self.diagnostic_limit))
        } else {
            let content = self.accumulated.trim();
            if content.is_empty() {
                Err(SessionError::EmptyResponse {
                    leftover: decoder::truncate_diagnostic(&leftover, self.diagnostic_limit),
                })
            } else {
                Ok(Response {
                    content: content.to_string(),
                    reasoning: self.reasoning.clone(),
                    metadata: None,
                })
            }
        };

        tracing::debug!(
            session_id = %self.control.id(),
            bytes = self.framer.fed(),
            "stream finalized"
        );
        self.control.resolve(result);
    }
}

impl Pipeline for StreamPipeline {
    fn tick(&mut self) -> TickOutcome {
        let bytes = match intake(&mut self.channel, &self.control, self.max_read) {
            Intake::Stop => return TickOutcome::Finished,
            Intake::Bytes(bytes) => bytes,
        };

        if self.process(&bytes) {
            self.finalize(true);
            return TickOutcome::Finished;
        }
        if drained(&mut self.channel) {
            self.finalize(false);
            return TickOutcome::Finished;
        }
        TickOutcome::Continue
    }

    fn into_channel(self) -> SubprocessChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(5))
    }

    fn lines_worker(lines: &'static [&'static str]) -> Worker {
        Worker::task(move |mut pipe| {
            for line in lines {
                pipe.write_all(line.as_bytes())?;
                pipe.write_all(b"\n")?;
            }
            Ok(())
        })
    }

    async fn run(worker: Worker) -> SessionOutcome {
        let (tx, rx) = oneshot::channel();
        let handle = StreamSession::new(fast_config())
            .start(worker, NoopObserver, move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        handle.finished().await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn event_stream_fragments_are_concatenated() {
        let outcome = run(lines_worker(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(outcome.state, SessionState::Completed);
        let response = outcome.result.unwrap();
        assert_eq!(response.content, "Hello");
        assert!(!response.reasoning.observed);
    }

    #[tokio::test]
    async fn observer_sees_fragments_in_order() {
        struct Recorder {
            events: Arc<Mutex<Vec<String>>>,
        }

        impl StreamObserver for Recorder {
            fn on_first_content(&mut self) {
                self.events.lock().unwrap().push("first".to_string());
            }

            fn on_fragment(&mut self, fragment: &str, accumulated: &str) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("{}|{}", fragment, accumulated));
            }

            fn on_reasoning(&mut self, text: Option<&str>) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("think:{}", text.unwrap_or("")));
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let handle = StreamSession::new(fast_config())
            .start(
                lines_worker(&[
                    r#"data: {"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#,
                    r#"data: {"choices":[{"delta":{"content":"a"}}]}"#,
                    r#"data: {"choices":[{"delta":{"content":"b"}}]}"#,
                    "data: [DONE]",
                ]),
                Recorder {
                    events: events.clone(),
                },
                move |outcome| {
                    let _ = tx.send(outcome);
                },
            )
            .unwrap();
        handle.finished().await;
        let outcome = rx.await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["think:hmm", "first", "a|a", "b|ab"]
        );
        let response = outcome.result.unwrap();
        assert!(response.reasoning.observed);
        assert_eq!(response.reasoning.text.as_deref(), Some("hmm"));
    }

    #[tokio::test]
    async fn ndjson_done_completes() {
        let outcome = run(lines_worker(&[
            r#"{"message":{"content":"Hi"},"done":false}"#,
            r#"{"message":{"content":" there"},"done":false}"#,
            r#"{"done":true}"#,
        ]))
        .await;

        assert_eq!(outcome.result.unwrap().content, "Hi there");
    }

    #[tokio::test]
    async fn worker_exit_without_done_marker_finalizes() {
        let outcome = run(Worker::task(|mut pipe| {
            pipe.write_all(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")?;
            Ok(())
        }))
        .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.result.unwrap().content, "tail");
    }

    #[tokio::test]
    async fn sentinel_yields_transport_failure() {
        let outcome = run(lines_worker(&[
            "X-NON-200-STATUS: 429",
            r#"{"error":{"message":"rate limited"}}"#,
        ]))
        .await;

        assert_eq!(outcome.state, SessionState::Failed);
        let err = outcome.result.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
        assert!(matches!(
            err,
            SessionError::Transport { status: Some(ref s), .. } if s == "429"
        ));
    }

    #[tokio::test]
    async fn no_fragments_is_empty_response() {
        let outcome = run(lines_worker(&[": keep-alive", "event: ping"])).await;

        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(
            outcome.result.unwrap_err(),
            SessionError::EmptyResponse {
                leftover: String::new()
            }
        );
    }

    #[tokio::test]
    async fn malformed_leftover_is_reported() {
        let outcome = run(Worker::task(|mut pipe| {
            pipe.write_all(b"data: {\"choices\":[")?;
            Ok(())
        }))
        .await;

        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("Raw response: data: {\"choices\":["));
    }

    #[tokio::test]
    async fn read_error_fails_session() {
        let outcome = run(Worker::task(|_pipe| {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer reset",
            ))
        }))
        .await;

        assert_eq!(outcome.state, SessionState::Failed);
        assert!(matches!(outcome.result, Err(SessionError::Read(_))));
    }
}
