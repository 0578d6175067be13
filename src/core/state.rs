//! Orchestration state
//!
//! `SubmissionState` is the one mutable record per submission. It is created
//! on the first run, advanced after every completed step, and round-trips
//! through the checkpoint store between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::request::SubmissionRequest;

/// Well-known keys in `SubmissionState::data`
pub mod keys {
    pub const RECORD_NUMBER: &str = "record_number";
    pub const RECORD_URL: &str = "record_url";
    pub const PAYMENT_URL: &str = "payment_url";
    pub const FEE_TEXT: &str = "fee_text";
    pub const PERMIT_NUMBER: &str = "permit_number";
    pub const PAYMENT_CONFIRMED: &str = "payment_confirmed";
    pub const PAYMENT_REFERENCE: &str = "payment_reference";
    pub const SUBMIT_CLASSIFICATION: &str = "submit_classification";
    pub const SELECTED_ADDRESS: &str = "selected_address";
    pub const DOCUMENTS_SKIPPED: &str = "documents_skipped";
    /// Step a run last failed at; cleared by the next completed step
    pub const FAILED_AT: &str = "failed_at";
}

/// Wizard steps in portal order, followed by the pause and terminal states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    StartApplication,
    PermitType,
    Address,
    Contractor,
    Applicant,
    ProjectScope,
    Equipment,
    WorkItems,
    Documents,
    ReviewSubmit,
    AwaitingPayment,
    PostPayment,
    Complete,
}

impl Step {
    /// Fixed order the sequencer walks through
    pub const ORDER: [Step; 13] = [
        Step::StartApplication,
        Step::PermitType,
        Step::Address,
        Step::Contractor,
        Step::Applicant,
        Step::ProjectScope,
        Step::Equipment,
        Step::WorkItems,
        Step::Documents,
        Step::ReviewSubmit,
        Step::AwaitingPayment,
        Step::PostPayment,
        Step::Complete,
    ];

    /// Portal wizard step number (0-9); pause/terminal states have none
    pub fn number(&self) -> Option<u8> {
        match self {
            Step::StartApplication => Some(0),
            Step::PermitType => Some(1),
            Step::Address => Some(2),
            Step::Contractor => Some(3),
            Step::Applicant => Some(4),
            Step::ProjectScope => Some(5),
            Step::Equipment => Some(6),
            Step::WorkItems => Some(7),
            Step::Documents => Some(8),
            Step::ReviewSubmit => Some(9),
            Step::AwaitingPayment | Step::PostPayment | Step::Complete => None,
        }
    }

    /// Position in `ORDER`, usable as a vision-prompt step index
    pub fn ordinal(&self) -> u8 {
        Step::ORDER.iter().position(|s| s == self).unwrap_or(0) as u8
    }

    /// Immediate successor in the fixed order
    pub fn next(&self) -> Option<Step> {
        let idx = self.ordinal() as usize;
        Step::ORDER.get(idx + 1).copied()
    }

    /// States the loop stops at without error
    pub fn is_pause_or_terminal(&self) -> bool {
        matches!(self, Step::AwaitingPayment | Step::Complete)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Step::StartApplication => "Start application",
            Step::PermitType => "Permit type",
            Step::Address => "Property address",
            Step::Contractor => "Licensed professional",
            Step::Applicant => "Applicant contact",
            Step::ProjectScope => "Project description",
            Step::Equipment => "Equipment information",
            Step::WorkItems => "Work items and valuation",
            Step::Documents => "Documents",
            Step::ReviewSubmit => "Review and submit",
            Step::AwaitingPayment => "Awaiting payment",
            Step::PostPayment => "Post-payment",
            Step::Complete => "Complete",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::StartApplication => "start_application",
            Step::PermitType => "permit_type",
            Step::Address => "address",
            Step::Contractor => "contractor",
            Step::Applicant => "applicant",
            Step::ProjectScope => "project_scope",
            Step::Equipment => "equipment",
            Step::WorkItems => "work_items",
            Step::Documents => "documents",
            Step::ReviewSubmit => "review_submit",
            Step::AwaitingPayment => "awaiting_payment",
            Step::PostPayment => "post_payment",
            Step::Complete => "complete",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only value a step handler returns on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub success: bool,
    pub next_step: Step,
    pub error: Option<String>,
}

impl StepResult {
    pub fn advance(to: Step) -> Self {
        Self { success: true, next_step: to, error: None }
    }

    pub fn failed(at: Step, error: impl Into<String>) -> Self {
        Self { success: false, next_step: at, error: Some(error.into()) }
    }
}

/// Persisted progress of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionState {
    pub submission_id: String,
    pub current_step: Step,
    pub last_completed_step: Option<Step>,
    /// Portal-assigned identifiers, payment URL, fee text, ...
    pub data: BTreeMap<String, String>,
    pub errors: Vec<String>,
    /// Screenshot references (artifact paths)
    pub screenshots: Vec<String>,
    /// Copy of the request so `resume` needs only the id
    pub request: SubmissionRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionState {
    pub fn new(request: SubmissionRequest) -> Self {
        let now = Utc::now();
        Self {
            submission_id: request.submission_id.clone(),
            current_step: Step::StartApplication,
            last_completed_step: None,
            data: BTreeMap::new(),
            errors: vec![],
            screenshots: vec![],
            request,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a completed step and move to the next one
    pub fn advance(&mut self, next: Step) {
        self.last_completed_step = Some(self.current_step);
        self.current_step = next;
        self.data.remove(keys::FAILED_AT);
        self.updated_at = Utc::now();
    }

    /// Mark the current step as where the last run gave up
    pub fn mark_failed(&mut self) {
        let step = self.current_step;
        self.set(keys::FAILED_AT, step.as_str());
        self.updated_at = Utc::now();
    }

    /// A run failed mid-wizard. A new browser session cannot reach that
    /// half-filled application, so the wizard has to start over.
    pub fn needs_restart(&self) -> bool {
        self.get(keys::FAILED_AT).is_some() && self.current_step < Step::AwaitingPayment
    }

    /// Back to the first step; errors and screenshots are kept
    pub fn restart(&mut self) {
        self.current_step = Step::StartApplication;
        self.last_completed_step = None;
        self.data.clear();
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.updated_at = Utc::now();
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|s| s.as_str())
    }

    pub fn permit_number(&self) -> Option<&str> {
        self.get(keys::PERMIT_NUMBER)
    }

    pub fn payment_confirmed(&self) -> bool {
        self.get(keys::PAYMENT_CONFIRMED) == Some("true")
    }
}

/// Durable checkpoint row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub submission_id: String,
    pub current_step: Step,
    pub state: SubmissionState,
    pub updated_at: DateTime<Utc>,
}
