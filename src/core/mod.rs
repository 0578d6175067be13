//! Core data model
//!
//! Requests, persisted state, results and the error taxonomy shared by
//! every layer of the orchestrator.

pub mod config;
pub mod error;
pub mod request;
pub mod state;

use serde::{Deserialize, Serialize};

pub use config::{ConfigManager, OrchestratorConfig, TimingPolicy};
pub use error::{ErrorKind, PortalError, StoreError};
pub use request::{ContractorInfo, EquipmentDetails, InstallationType, PropertyAddress, SubmissionRequest};
pub use state::{keys, Checkpoint, Step, StepResult, SubmissionState};

use crate::orchestrator::vision::VisionAnalysis;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Submitted and a permit number was captured
    Complete,
    /// Paused for out-of-band payment; not a failure
    PendingPayment,
    Failed,
}

/// Terminal result of `run`/`resume`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: String,
    pub outcome: Outcome,
    pub success: bool,
    /// Steps completed during this invocation, in order
    pub steps_completed: Vec<Step>,
    pub final_step: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permit_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub screenshots: Vec<String>,
    pub analyses: Vec<VisionAnalysis>,
    /// Portal identifiers, payment URL, fee text
    pub data: std::collections::BTreeMap<String, String>,
}

impl SubmissionResult {
    pub fn from_state(
        state: &SubmissionState,
        steps_completed: Vec<Step>,
        analyses: Vec<VisionAnalysis>,
        error: Option<&PortalError>,
    ) -> Self {
        let outcome = match (error, state.current_step) {
            (Some(_), _) => Outcome::Failed,
            (None, Step::Complete) => Outcome::Complete,
            (None, _) => Outcome::PendingPayment,
        };
        Self {
            submission_id: state.submission_id.clone(),
            outcome,
            success: error.is_none(),
            steps_completed,
            final_step: state.current_step,
            permit_number: state.permit_number().map(|s| s.to_string()),
            error: error.map(|e| e.to_string()),
            error_kind: error.map(|e| e.kind()),
            screenshots: state.screenshots.clone(),
            analyses,
            data: state.data.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::PendingPayment
    }
}
