//! Engine configuration and validation.
//!
//! Loaded from TOML or YAML and validated before any session starts, so that bad
//! intervals are caught early instead of surfacing as odd polling behaviour.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Display hints forwarded untouched to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayHints {
    /// Keep the streaming view scrolled to the newest text.
    #[serde(default = "default_true")]
    pub auto_scroll: bool,
    /// Show streamed text in a large dialog instead of a compact one.
    #[serde(default)]
    pub large_stream_dialog: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DisplayHints {
    fn default() -> Self {
        Self {
            auto_scroll: true,
            large_stream_dialog: false,
        }
    }
}

/// Configuration shared by stream and bulk sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between poll ticks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Absolute deadline for a session, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on bytes read from the pipe in a single tick.
    #[serde(default = "default_max_read_per_tick")]
    pub max_read_per_tick: usize,

    /// Delay between attempts to reap a terminated worker, in milliseconds.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Maximum characters of raw output included in diagnostics.
    #[serde(default = "default_diagnostic_limit")]
    pub diagnostic_limit: usize,

    /// UI hints; the engine never reads them.
    #[serde(default)]
    pub display: DisplayHints,
}

/// Longest deadline a session may be given.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_poll_interval_ms() -> u64 {
    125
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_read_per_tick() -> usize {
    16 * 1024
}

fn default_reap_interval_ms() -> u64 {
    2000
}

fn default_diagnostic_limit() -> usize {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            max_read_per_tick: default_max_read_per_tick(),
            reap_interval_ms: default_reap_interval_ms(),
            diagnostic_limit: default_diagnostic_limit(),
            display: DisplayHints::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file, choosing the format by extension.
    ///
    /// `.yaml` and `.yml` are read as YAML, everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the absolute timeout, rounded up to whole seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = timeout.as_secs().saturating_add(partial);
        self
    }

    /// Sets the per-tick read bound.
    pub fn with_max_read_per_tick(mut self, bytes: usize) -> Self {
        self.max_read_per_tick = bytes;
        self
    }

    /// Sets the reap retry interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Delay between poll ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Absolute session deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay between reap attempts.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.poll_interval_ms == 0 {
            result.add_error("poll_interval_ms must be greater than zero");
        } else if !(50..=250).contains(&self.poll_interval_ms) {
            result.add_warning(format!(
                "poll_interval_ms {} is outside the usual 50-250 ms range",
                self.poll_interval_ms
            ));
        }

        if self.timeout_secs == 0 {
            result.add_error("timeout_secs must be greater than zero");
        } else if self.timeout_secs > MAX_TIMEOUT_SECS {
            result.add_error(format!(
                "timeout_secs {} exceeds the maximum of {}",
                self.timeout_secs, MAX_TIMEOUT_SECS
            ));
        } else if self.timeout() <= self.poll_interval() {
            result.add_error("timeout_secs must be longer than the poll interval");
        }

        if self.max_read_per_tick == 0 {
            result.add_error("max_read_per_tick must be greater than zero");
        }

        if self.reap_interval_ms == 0 {
            result.add_error("reap_interval_ms must be greater than zero");
        }

        if self.timeout_secs > 600 && self.timeout_secs <= MAX_TIMEOUT_SECS {
            result.add_warning("timeout_secs over 10 minutes may indicate a misconfiguration");
        }

        result
    }
}
