use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

pub type AnalysisOutcome<T, E = AnalysisError> = Result<T, E>;

/// A single problem found while validating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

/// Accumulates field issues so a request reports every problem at once.
#[derive(Debug, Default)]
pub struct Validation {
    issues: Vec<FieldIssue>,
}

impl Validation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, code: &str, message: impl Into<String>) {
        self.issues.push(FieldIssue {
            field: field.to_string(),
            code: code.to_string(),
            message: message.into(),
        });
    }

    pub fn into_result(self) -> AnalysisOutcome<()> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::Validation {
                issues: self.issues,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AcquisitionError,
    InternalError,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid request: {}", summarize(.issues))]
    Validation { issues: Vec<FieldIssue> },

    #[error("checker acquisition failed: {message}")]
    Acquisition {
        message: String,
        timed_out: bool,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    },

    #[error("internal error (correlation id {correlation_id})")]
    Internal {
        correlation_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl AnalysisError {
    pub fn validation(field: &str, code: &str, message: impl Into<String>) -> Self {
        let mut validation = Validation::new();
        validation.add(field, code, message);
        AnalysisError::Validation {
            issues: validation.issues,
        }
    }

    pub fn acquisition(message: impl Into<String>) -> Self {
        AnalysisError::Acquisition {
            message: message.into(),
            timed_out: false,
            exit_code: None,
            stderr_tail: None,
        }
    }

    pub fn internal(source: anyhow::Error) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, error = ?source, "internal error");
        AnalysisError::Internal {
            correlation_id,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation { .. } => ErrorKind::ValidationError,
            AnalysisError::Acquisition { .. } => ErrorKind::AcquisitionError,
            AnalysisError::Internal { .. } => ErrorKind::InternalError,
            AnalysisError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AnalysisError::Acquisition { timed_out: true, .. })
    }

    /// Whether a caller may reasonably resend the same request.
    pub fn retryable(&self) -> bool {
        matches!(self, AnalysisError::Acquisition { .. } | AnalysisError::Cancelled)
    }

    /// Caller-facing error object. Internal errors expose only their correlation id.
    pub fn to_json(&self) -> Value {
        let mut payload = json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        match self {
            AnalysisError::Validation { issues } => {
                payload["issues"] = json!(issues);
            }
            AnalysisError::Acquisition {
                timed_out,
                exit_code,
                stderr_tail,
                ..
            } => {
                payload["timed_out"] = json!(timed_out);
                payload["exit_code"] = json!(exit_code);
                if let Some(tail) = stderr_tail {
                    payload["stderr_tail"] = json!(tail);
                }
            }
            AnalysisError::Internal { correlation_id, .. } => {
                payload["correlation_id"] = json!(correlation_id);
            }
            AnalysisError::Cancelled => {}
        }
        payload
    }
}

fn summarize(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_all_issues() {
        let mut validation = Validation::new();
        validation.add("targets", "required", "at least one target is required");
        validation.add("options.foo", "unknown_option", "unknown option 'foo'");
        let err = validation.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        let payload = err.to_json();
        assert_eq!(payload["kind"], "validation_error");
        assert_eq!(payload["issues"].as_array().unwrap().len(), 2);
        assert_eq!(payload["retryable"], false);
    }

    #[test]
    fn internal_error_hides_source() {
        let err = AnalysisError::internal(anyhow::anyhow!("secret state /etc/passwd"));
        let payload = err.to_json();
        assert_eq!(payload["kind"], "internal_error");
        assert!(payload["correlation_id"].as_str().is_some());
        assert!(!payload.to_string().contains("passwd"));
    }

    #[test]
    fn acquisition_timeout_is_retryable() {
        let err = AnalysisError::Acquisition {
            message: "timed out".to_string(),
            timed_out: true,
            exit_code: None,
            stderr_tail: None,
        };
        assert!(err.is_timeout());
        assert!(err.retryable());
        assert_eq!(err.to_json()["timed_out"], true);
    }
}
