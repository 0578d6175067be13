//! Audit logging for permit submissions
//!
//! Milestones of every submission (started, step done, recovery, payment
//! pause, permit issued, failure) go to the system log so operators can
//! follow a batch without the CLI output:
//! - Linux: syslog/journald (`journalctl -t permit-pilot`)
//! - always: the `audit` target of the `tracing` subscriber
//!
//! Diagnostic detail stays in `tracing`; this is the short audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Step;

/// Event IDs for filtering in system logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventId {
    // Informational (2000-2099)
    SubmissionStarted = 2000,
    StepCompleted = 2010,
    PaymentConfirmed = 2020,
    PermitIssued = 2030,

    // Warnings (2100-2199)
    RecoveryAttempted = 2100,
    AwaitingPayment = 2110,

    // Errors (2200-2299)
    SubmissionFailed = 2200,
    ManualReviewRequired = 2210,

    // Critical (2300-2399)
    SessionExpired = 2300,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalEvent {
    pub timestamp: DateTime<Utc>,
    pub event_id: EventId,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permit_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PortalEvent {
    pub fn new(event_id: EventId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id,
            level,
            message: message.into(),
            submission_id: None,
            step: None,
            confidence: None,
            permit_number: None,
            reason: None,
        }
    }

    pub fn with_submission(mut self, id: impl Into<String>) -> Self {
        self.submission_id = Some(id.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_permit(mut self, permit: impl Into<String>) -> Self {
        self.permit_number = Some(permit.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        // Portal error pages can be long
        self.reason = Some(if reason.chars().count() > 300 { reason.chars().take(300).collect() } else { reason });
        self
    }

    /// Single `key=value` line
    pub fn to_syslog_format(&self) -> String {
        let mut parts = vec![
            format!("PERMIT_PILOT[{}]", self.event_id as u32),
            format!("level={}", self.level),
        ];

        if let Some(ref id) = self.submission_id {
            parts.push(format!("submission={}", id));
        }
        if let Some(step) = self.step {
            parts.push(format!("step={}", step));
        }
        if let Some(confidence) = self.confidence {
            parts.push(format!("confidence={}", confidence));
        }
        if let Some(ref permit) = self.permit_number {
            parts.push(format!("permit={}", permit));
        }
        if let Some(ref reason) = self.reason {
            let escaped = reason.replace('"', "\\\"").replace('\n', " ");
            parts.push(format!("reason=\"{}\"", escaped));
        }

        parts.push(format!("msg={}", self.message));
        parts.join(" ")
    }
}

#[cfg(target_os = "linux")]
mod linux;

/// Where audit lines go besides `tracing`
pub trait AuditSink: Send + Sync {
    fn write(&self, level: LogLevel, line: &str);
}

#[cfg(target_os = "linux")]
fn platform_sink() -> Option<Box<dyn AuditSink>> {
    linux::SyslogSink::connect().map(|sink| Box::new(sink) as Box<dyn AuditSink>)
}

#[cfg(not(target_os = "linux"))]
fn platform_sink() -> Option<Box<dyn AuditSink>> {
    None
}

/// Audit trail: every event goes to the `audit` tracing target, and to the
/// platform sink when there is one
pub struct SystemLogger {
    sink: Option<Box<dyn AuditSink>>,
}

impl SystemLogger {
    pub fn new() -> Self {
        Self { sink: platform_sink() }
    }

    /// Audit events to tracing only (tests, containers without /dev/log)
    pub fn console_only() -> Self {
        Self { sink: None }
    }

    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn log(&self, event: PortalEvent) {
        let line = event.to_syslog_format();
        if let Some(sink) = &self.sink {
            sink.write(event.level, &line);
        }

        match event.level {
            LogLevel::Debug => tracing::debug!(target: "audit", "{}", line),
            LogLevel::Info => tracing::info!(target: "audit", "{}", line),
            LogLevel::Warning => tracing::warn!(target: "audit", "{}", line),
            LogLevel::Error => tracing::error!(target: "audit", "{}", line),
            LogLevel::Critical => tracing::error!(target: "audit", critical = true, "{}", line),
        }
    }
}

impl Default for SystemLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience functions
impl SystemLogger {
    pub fn submission_started(&self, submission_id: &str, step: Step) {
        self.log(
            PortalEvent::new(EventId::SubmissionStarted, LogLevel::Info, "Submission started")
                .with_submission(submission_id)
                .with_step(step),
        );
    }

    pub fn step_completed(&self, submission_id: &str, step: Step) {
        self.log(
            PortalEvent::new(EventId::StepCompleted, LogLevel::Info, "Step completed")
                .with_submission(submission_id)
                .with_step(step),
        );
    }

    pub fn recovery_attempted(&self, submission_id: &str, step: Step, confidence: u8, cause: &str) {
        self.log(
            PortalEvent::new(EventId::RecoveryAttempted, LogLevel::Warning, "Vision recovery attempted")
                .with_submission(submission_id)
                .with_step(step)
                .with_confidence(confidence)
                .with_reason(cause),
        );
    }

    pub fn awaiting_payment(&self, submission_id: &str, fee: Option<&str>) {
        let mut event = PortalEvent::new(EventId::AwaitingPayment, LogLevel::Warning, "Awaiting manual payment")
            .with_submission(submission_id)
            .with_step(Step::AwaitingPayment);
        if let Some(fee) = fee {
            event = event.with_reason(fee);
        }
        self.log(event);
    }

    pub fn payment_confirmed(&self, submission_id: &str) {
        self.log(
            PortalEvent::new(EventId::PaymentConfirmed, LogLevel::Info, "Payment confirmed")
                .with_submission(submission_id),
        );
    }

    pub fn permit_issued(&self, submission_id: &str, permit: &str) {
        self.log(
            PortalEvent::new(EventId::PermitIssued, LogLevel::Info, "Permit issued")
                .with_submission(submission_id)
                .with_permit(permit),
        );
    }

    pub fn submission_failed(&self, submission_id: &str, step: Step, reason: &str) {
        self.log(
            PortalEvent::new(EventId::SubmissionFailed, LogLevel::Error, "Submission failed")
                .with_submission(submission_id)
                .with_step(step)
                .with_reason(reason),
        );
    }

    pub fn session_expired(&self, submission_id: &str) {
        self.log(
            PortalEvent::new(
                EventId::SessionExpired,
                LogLevel::Critical,
                "Portal session expired; re-authenticate before the next batch",
            )
            .with_submission(submission_id),
        );
    }

    pub fn manual_review_required(&self, submission_id: &str, attempts: u32) {
        self.log(
            PortalEvent::new(EventId::ManualReviewRequired, LogLevel::Error, "Routed to manual review")
                .with_submission(submission_id)
                .with_reason(format!("{} attempts", attempts)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_line() {
        let line = PortalEvent::new(EventId::RecoveryAttempted, LogLevel::Warning, "Vision recovery attempted")
            .with_submission("sub-17")
            .with_step(Step::Address)
            .with_confidence(64)
            .with_reason("click intercepted by \"pendo\"\noverlay")
            .to_syslog_format();
        assert!(line.starts_with("PERMIT_PILOT[2100] level=WARNING"));
        assert!(line.contains("submission=sub-17"));
        assert!(line.contains("step=address"));
        assert!(line.contains("confidence=64"));
        assert!(line.contains(r#"reason="click intercepted by \"pendo\" overlay""#));
        assert!(line.ends_with("msg=Vision recovery attempted"));
    }

    #[derive(Default)]
    struct Recorded(std::sync::Mutex<Vec<(LogLevel, String)>>);

    impl AuditSink for std::sync::Arc<Recorded> {
        fn write(&self, level: LogLevel, line: &str) {
            self.0.lock().unwrap().push((level, line.to_string()));
        }
    }

    #[test]
    fn test_events_reach_the_sink() {
        let recorded = std::sync::Arc::new(Recorded::default());
        let logger = SystemLogger::with_sink(Box::new(recorded.clone()));
        logger.manual_review_required("sub-3", 3);
        logger.session_expired("sub-3");

        let lines = recorded.0.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LogLevel::Error);
        assert!(lines[0].1.starts_with("PERMIT_PILOT[2210]"));
        assert!(lines[0].1.contains(r#"reason="3 attempts""#));
        assert_eq!(lines[1].0, LogLevel::Critical);

        // No sink: tracing only
        SystemLogger::console_only().payment_confirmed("sub-3");
    }

    #[test]
    fn test_long_reason_is_truncated() {
        let event = PortalEvent::new(EventId::SubmissionFailed, LogLevel::Error, "x").with_reason("é".repeat(500));
        assert_eq!(event.reason.map(|r| r.chars().count()), Some(300));
    }
}
