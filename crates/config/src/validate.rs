//! Configuration validation.
//!
//! Checks value ranges and duration strings that serde alone cannot catch.
//! The gateway refuses to start when any diagnostic is an error.

use std::path::PathBuf;

use crate::{duration::parse_duration, schema::SwitchboardConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "supervisor.backoff_min"
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.severity, self.path, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate an already-parsed config.
pub fn validate_config(
    config: &SwitchboardConfig,
    config_path: Option<PathBuf>,
) -> ValidationResult {
    let mut result = ValidationResult {
        diagnostics: Vec::new(),
        config_path,
    };

    let reply = &config.reply;
    if !(reply.confidence_threshold > 0.0 && reply.confidence_threshold <= 1.0) {
        result.push(
            Severity::Error,
            "reply.confidence_threshold",
            format!("must be in (0, 1], got {}", reply.confidence_threshold),
        );
    }
    if reply.top_k == 0 {
        result.push(Severity::Error, "reply.top_k", "must be at least 1");
    }
    if reply.no_answer_sentinel.trim().is_empty() {
        result.push(Severity::Error, "reply.no_answer_sentinel", "must not be empty");
    }

    let sup = &config.supervisor;
    let min = check_duration(&mut result, "supervisor.backoff_min", &sup.backoff_min);
    let max = check_duration(&mut result, "supervisor.backoff_max", &sup.backoff_max);
    if let (Some(min), Some(max)) = (min, max)
        && max < min
    {
        result.push(
            Severity::Error,
            "supervisor.backoff_max",
            format!("{max:?} is below backoff_min {min:?}"),
        );
    }
    if !(0.0..=1.0).contains(&sup.backoff_jitter) {
        result.push(
            Severity::Error,
            "supervisor.backoff_jitter",
            format!("must be in [0, 1], got {}", sup.backoff_jitter),
        );
    }
    for (path, raw) in [
        ("supervisor.heartbeat_interval", &sup.heartbeat_interval),
        ("supervisor.pairing_timeout", &sup.pairing_timeout),
        ("supervisor.send_timeout", &sup.send_timeout),
        ("store.poll_interval", &config.store.poll_interval),
        ("ai.request_timeout", &config.ai.request_timeout),
    ] {
        check_duration(&mut result, path, raw);
    }

    if config.ai.api_key.is_none() {
        result.push(
            Severity::Warning,
            "ai.api_key",
            "no API key configured; every bot-mode message will be handed over",
        );
    }
    if config.handover.user_notice.trim().is_empty() {
        result.push(
            Severity::Warning,
            "handover.user_notice",
            "empty notice; users get no message on handover",
        );
    }
    if config.server.bind != "127.0.0.1" && config.server.bind != "localhost" {
        result.push(
            Severity::Info,
            "server.bind",
            "control API has no authentication; keep it behind a private network",
        );
    }

    result
}

fn check_duration(
    result: &mut ValidationResult,
    path: &str,
    raw: &str,
) -> Option<std::time::Duration> {
    match parse_duration(raw) {
        Some(d) if d.is_zero() => {
            result.push(Severity::Error, path, "must be greater than zero");
            None
        },
        Some(d) => Some(d),
        None => {
            result.push(
                Severity::Error,
                path,
                format!("cannot parse duration {raw:?} (expected e.g. \"30s\", \"5m\")"),
            );
            None
        },
    }
}
