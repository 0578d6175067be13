//! Error taxonomy for portal submissions

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::state::Step;
use crate::browser::BrowserError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No record for submission {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Element not found: {target} (waited {waited_ms} ms)")]
    ElementNotFound { target: String, waited_ms: u64 },

    #[error("Element {target} cannot {action}: {reason}")]
    ElementNotInteractable { target: String, action: String, reason: String },

    #[error("Navigation to {url} timed out: {detail}")]
    NavigationTimeout { url: String, detail: String },

    #[error("Step {step} verification failed: {expected}")]
    StepVerificationFailed { step: Step, expected: String },

    #[error("Recovery skipped at {step}: confidence {confidence} below {threshold} ({cause})")]
    LowConfidenceRecovery { step: Step, confidence: u8, threshold: u8, cause: String },

    #[error("Submission {submission_id} exceeded {attempts} attempts")]
    MaxRetriesExceeded { submission_id: String, attempts: u32 },

    #[error("Portal session expired: {0}")]
    SessionExpired(String),

    #[error("Handler for {from} returned {to}, which is not the next step")]
    InvalidTransition { from: Step, to: Step },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cancelled before {step}")]
    Cancelled { step: Step },

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),
}

/// Flat error classification carried in results and the queue table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ElementNotFound,
    ElementNotInteractable,
    NavigationTimeout,
    StepVerificationFailed,
    LowConfidenceRecovery,
    MaxRetriesExceeded,
    SessionExpired,
    InvalidTransition,
    InvalidRequest,
    Cancelled,
    Browser,
    Store,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::ElementNotInteractable => "element_not_interactable",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::StepVerificationFailed => "step_verification_failed",
            ErrorKind::LowConfidenceRecovery => "low_confidence_recovery",
            ErrorKind::MaxRetriesExceeded => "max_retries_exceeded",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Browser => "browser",
            ErrorKind::Store => "store",
        };
        f.write_str(s)
    }
}

impl PortalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortalError::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            PortalError::ElementNotInteractable { .. } => ErrorKind::ElementNotInteractable,
            PortalError::NavigationTimeout { .. } => ErrorKind::NavigationTimeout,
            PortalError::StepVerificationFailed { .. } => ErrorKind::StepVerificationFailed,
            PortalError::LowConfidenceRecovery { .. } => ErrorKind::LowConfidenceRecovery,
            PortalError::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            PortalError::SessionExpired(_) => ErrorKind::SessionExpired,
            PortalError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            PortalError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PortalError::Cancelled { .. } => ErrorKind::Cancelled,
            PortalError::Browser(BrowserError::NavigationTimeout(_)) => ErrorKind::NavigationTimeout,
            PortalError::Browser(_) => ErrorKind::Browser,
            PortalError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether a vision-assisted recovery attempt makes sense.
    ///
    /// Credentials, bad input and local storage cannot be fixed by clicking.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PortalError::SessionExpired(_)
                | PortalError::InvalidRequest(_)
                | PortalError::Cancelled { .. }
                | PortalError::MaxRetriesExceeded { .. }
                | PortalError::InvalidTransition { .. }
                | PortalError::Store(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expired_is_fatal() {
        let err = PortalError::SessionExpired("login form shown".into());
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_element_errors_are_recoverable() {
        let err = PortalError::ElementNotFound { target: "button \"Continue\"".into(), waited_ms: 5000 };
        assert!(err.is_recoverable());
        assert_eq!(err.kind().to_string(), "element_not_found");
    }

    #[test]
    fn test_browser_navigation_timeout_kind() {
        let err: PortalError = BrowserError::NavigationTimeout("https://portal.example".into()).into();
        assert_eq!(err.kind(), ErrorKind::NavigationTimeout);
    }
}
