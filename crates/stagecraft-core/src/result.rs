use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidResult {
    #[error("a validation result needs at least one message")]
    NoMessages,
    #[error("a validation result with {0} messages needs a summary")]
    MissingSummary(usize),
}

/// Outcome of one validator for one event.
///
/// Always carries at least one message, plus a summary whenever it carries
/// more than one. Equality compares severity, summary and the ordered
/// message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResult")]
pub struct ValidationResult {
    severity: Severity,
    messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Deserialize)]
struct RawResult {
    severity: Severity,
    messages: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

impl TryFrom<RawResult> for ValidationResult {
    type Error = InvalidResult;

    fn try_from(raw: RawResult) -> Result<Self, Self::Error> {
        Self::new(raw.severity, raw.messages, raw.summary)
    }
}

impl ValidationResult {
    pub fn new(
        severity: Severity,
        messages: Vec<String>,
        summary: Option<String>,
    ) -> Result<Self, InvalidResult> {
        if messages.is_empty() {
            return Err(InvalidResult::NoMessages);
        }
        if messages.len() > 1 && summary.is_none() {
            return Err(InvalidResult::MissingSummary(messages.len()));
        }
        Ok(Self {
            severity,
            messages,
            summary,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            messages: vec![message.into()],
            summary: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            messages: vec![message.into()],
            summary: None,
        }
    }

    pub fn errors(
        summary: impl Into<String>,
        messages: Vec<String>,
    ) -> Result<Self, InvalidResult> {
        Self::new(Severity::Error, messages, Some(summary.into()))
    }

    pub fn warnings(
        summary: impl Into<String>,
        messages: Vec<String>,
    ) -> Result<Self, InvalidResult> {
        Self::new(Severity::Warning, messages, Some(summary.into()))
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.summary {
            Some(summary) => {
                write!(f, "{}: {summary}", self.severity)?;
                for m in &self.messages {
                    write!(f, "\n  - {m}")?;
                }
                Ok(())
            }
            None => write!(f, "{}: {}", self.severity, self.messages.join("; ")),
        }
    }
}
