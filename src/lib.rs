//! Pagewise Relay - request execution engine for the Pagewise reading assistant
//!
//! This library runs AI provider requests in an isolated worker (a child process or
//! a blocking task), polls its output pipe without ever blocking the caller, decodes
//! event-stream and newline-delimited JSON responses from several vendors, and
//! resolves every session exactly once as completed, cancelled, timed out or failed.

pub mod channel;
pub mod config;
pub mod decoder;
pub mod error;
pub mod extract;
pub mod framing;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use channel::{PipeWriter, SubprocessChannel, Worker, WorkerCommand};
pub use config::{DisplayHints, EngineConfig, Validate, ValidationResult};
pub use decoder::{decode_line, NormalizedEvent, NON_SUCCESS_SENTINEL};
pub use error::{Error, Result, SessionError};
pub use extract::{extract_complete, CompleteResponse, Extracted, PayloadShape};
pub use framing::LineFramer;
pub use registry::{SessionKind, SessionRegistry, SessionTicket};
pub use scheduler::{PollScheduler, TickOutcome, TimeoutGuard};
pub use session::{
    BulkSession, CompletionCallback, NoopObserver, Reasoning, Response, ResponseParser,
    SessionHandle, SessionOutcome, SessionState, StreamObserver, StreamSession,
    VendorResponseParser,
};
