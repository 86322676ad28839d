//! Non-incremental sessions: collect the whole response, then parse it once.

use std::sync::Arc;

use serde_json::Value;

use crate::channel::{SubprocessChannel, Worker};
use crate::config::EngineConfig;
use crate::decoder::{self, NON_SUCCESS_SENTINEL};
use crate::error::{Result, SessionError};
use crate::extract;
use crate::registry::{SessionKind, SessionRegistry};
use crate::scheduler::TickOutcome;

use super::{
    drained, intake, launch, transport_error, Intake, Pipeline, Reasoning, Response,
    SessionControl, SessionHandle, SessionOutcome,
};

/// Turns a complete provider response into a [`Response`].
///
/// An `Err` carries a provider-side error message.
pub trait ResponseParser: Send + 'static {
    fn parse(&self, value: &Value) -> std::result::Result<Response, String>;
}

impl<F> ResponseParser for F
where
    F: Fn(&Value) -> std::result::Result<Response, String> + Send + 'static,
{
    fn parse(&self, value: &Value) -> std::result::Result<Response, String> {
        self(value)
    }
}

/// Parser for the common vendor response formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct VendorResponseParser;

impl ResponseParser for VendorResponseParser {
    fn parse(&self, value: &Value) -> std::result::Result<Response, String> {
        match value.get("error") {
            None | Some(Value::Null) => {}
            Some(Value::String(message)) => return Err(message.clone()),
            Some(error) => {
                return Err(error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()))
            }
        }

        let complete = extract::extract_complete(value)
            .ok_or_else(|| "unrecognized response format".to_string())?;
        Ok(Response {
            content: complete.content,
            reasoning: Reasoning {
                observed: complete.reasoning_observed,
                text: complete.reasoning,
            },
            metadata: complete.usage,
        })
    }
}

/// Starts non-incremental sessions.
#[derive(Debug, Clone, Default)]
pub struct BulkSession {
    config: EngineConfig,
    registry: Option<SessionRegistry>,
}

impl BulkSession {
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

    /// Starts `worker`, waits for its whole output and hands it to `parser`.
    ///
    /// `on_complete` runs exactly once. Must be called from within a tokio runtime.
    pub fn start<P, C>(&self, worker: Worker, parser: P, on_complete: C) -> Result<SessionHandle>
    where
        P: ResponseParser,
        C: FnOnce(SessionOutcome) + Send + 'static,
    {
        let max_read = self.config.max_read_per_tick;
        let diagnostic_limit = self.config.diagnostic_limit;

        launch(
            &self.config,
            self.registry.as_ref(),
            SessionKind::Bulk,
            worker,
            Box::new(on_complete),
            move |channel, control| BulkPipeline {
                channel,
                control,
                parser: Box::new(parser),
                buffer: Vec::new(),
                max_read,
                diagnostic_limit,
            },
        )
    }
}

struct BulkPipeline {
    channel: SubprocessChannel,
    control: Arc<SessionControl>,
    parser: Box<dyn ResponseParser>,
    buffer: Vec<u8>,
    max_read: usize,
    diagnostic_limit: usize,
}

impl BulkPipeline {
    fn finalize(&mut self) -> std::result::Result<Response, SessionError> {
        let raw = String::from_utf8_lossy(&self.buffer);
        tracing::debug!(session_id = %self.control.id(), bytes = self.buffer.len(), "bulk response collected");

        if let Some(pos) = raw.find(NON_SUCCESS_SENTINEL) {
            let tail = &raw[pos + NON_SUCCESS_SENTINEL.len()..];
            return Err(transport_error(tail, self.diagnostic_limit));
        }

        let body = raw.trim();
        if body.is_empty() {
            return Err(SessionError::EmptyResponse {
                leftover: String::new(),
            });
        }

        let value: Value = serde_json::from_str(body).map_err(|e| {
            SessionError::Parse(format!(
                "{}: {}",
                e,
                decoder::truncate_diagnostic(body, self.diagnostic_limit)
            ))
        })?;

        let mut response = self.parser.parse(&value).map_err(SessionError::Provider)?;
        response.content = response.content.trim().to_string();
        if response.content.is_empty() {
            return Err(SessionError::EmptyResponse {
                leftover: decoder::truncate_diagnostic(body, self.diagnostic_limit),
            });
        }
        Ok(response)
    }
}

impl Pipeline for BulkPipeline {
    fn tick(&mut self) -> TickOutcome {
        match intake(&mut self.channel, &self.control, self.max_read) {
            Intake::Stop => return TickOutcome::Finished,
            Intake::Bytes(bytes) => self.buffer.extend_from_slice(&bytes),
        }

        if drained(&mut self.channel) {
            let result = self.finalize();
            self.control.resolve(result);
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
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(5))
            .with_max_read_per_tick(7)
    }

    fn body_worker(body: &'static str) -> Worker {
        Worker::task(move |mut pipe| pipe.write_all(body.as_bytes()))
    }

    async fn run<P: ResponseParser>(worker: Worker, parser: P) -> SessionOutcome {
        let (tx, rx) = oneshot::channel();
        let handle = BulkSession::new(fast_config())
            .start(worker, parser, move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        handle.finished().await;
        rx.await.unwrap()
    }

    #[test]
    fn vendor_parser_reads_chat_completion() {
        let response = VendorResponseParser
            .parse(&json!({
                "choices": [{"message": {"content": "Answer", "reasoning_content": "why"}}],
                "usage": {"total_tokens": 12}
            }))
            .unwrap();

        assert_eq!(response.content, "Answer");
        assert!(response.reasoning.observed);
        assert_eq!(response.reasoning.text.as_deref(), Some("why"));
        assert_eq!(response.metadata, Some(json!({"total_tokens": 12})));
    }

    #[test]
    fn vendor_parser_surfaces_provider_errors() {
        let err = VendorResponseParser
            .parse(&json!({"error": {"message": "invalid key"}}))
            .unwrap_err();
        assert_eq!(err, "invalid key");

        let err = VendorResponseParser.parse(&json!({"nothing": 1})).unwrap_err();
        assert_eq!(err, "unrecognized response format");
    }

    #[tokio::test]
    async fn bulk_response_is_parsed_once_complete() {
        let outcome = run(
            body_worker(r#"{"content":[{"type":"text","text":"  Bulk answer  "}]}"#),
            VendorResponseParser,
        )
        .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.result.unwrap().content, "Bulk answer");
    }

    #[tokio::test]
    async fn closure_parser_is_accepted() {
        let outcome = run(body_worker(r#"{"answer":"42"}"#), |value: &Value| {
            Ok::<_, String>(Response {
                content: value["answer"].as_str().unwrap_or_default().to_string(),
                ..Default::default()
            })
        })
        .await;

        assert_eq!(outcome.result.unwrap().content, "42");
    }

    #[tokio::test]
    async fn sentinel_fails_bulk_session() {
        let outcome = run(
            body_worker("X-NON-200-STATUS: 401 {\"error\":{\"message\":\"bad key\"}}"),
            VendorResponseParser,
        )
        .await;

        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.result.unwrap_err().to_string(), "bad key");
    }

    #[tokio::test]
    async fn empty_output_fails() {
        let outcome = run(body_worker(""), VendorResponseParser).await;
        assert!(matches!(
            outcome.result,
            Err(SessionError::EmptyResponse { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let outcome = run(body_worker("not json"), VendorResponseParser).await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, SessionError::Parse(_)));
        assert!(err.to_string().contains("not json"));
    }

    #[tokio::test]
    async fn parser_error_is_a_provider_error() {
        let outcome = run(
            body_worker(r#"{"error":"quota exceeded"}"#),
            VendorResponseParser,
        )
        .await;
        assert_eq!(
            outcome.result.unwrap_err(),
            SessionError::Provider("quota exceeded".to_string())
        );
    }
}
