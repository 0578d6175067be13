//! The step sequencer
//!
//! Walks the step table from the checkpointed step, one handler at a time.
//! After every completed step the state is advanced and then saved, so a
//! resumed run starts at the first step that has not completed. Reaching
//! `AwaitingPayment` ends the run with a pending result; a later `resume`
//! continues once the payment has been confirmed.
//!
//! A run that fails before the payment pause leaves the portal's draft in
//! a browser session that is gone by the next run, so the next run starts
//! the wizard over. Errors and screenshots from the failed run are kept.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::checkpoint::CheckpointStore;
use super::recovery::RecoveryWrapper;
use super::steps::{step_table, StepContext, StepSpec};
use super::vision::StepAnalyzer;
use crate::browser::PortalPage;
use crate::core::{
    keys, OrchestratorConfig, PortalError, Step, StoreError, SubmissionRequest, SubmissionResult, SubmissionState,
};
use crate::logging::SystemLogger;

/// Allowed: the immediate successor, or a later pause/terminal state
pub fn check_transition(from: Step, to: Step) -> Result<(), PortalError> {
    if from.next() == Some(to) || (to.is_pause_or_terminal() && to > from) {
        Ok(())
    } else {
        Err(PortalError::InvalidTransition { from, to })
    }
}

pub struct StepSequencer {
    config: OrchestratorConfig,
    store: Arc<dyn CheckpointStore>,
    analyzer: Arc<dyn StepAnalyzer>,
    audit: Arc<SystemLogger>,
    table: Vec<StepSpec>,
    cancel: Arc<AtomicBool>,
}

impl StepSequencer {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn CheckpointStore>,
        analyzer: Arc<dyn StepAnalyzer>,
        audit: Arc<SystemLogger>,
    ) -> Self {
        Self {
            config,
            store,
            analyzer,
            audit,
            table: step_table(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag (set from a signal handler)
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Replace the step table, e.g. for a portal with a different wizard
    pub fn with_table(mut self, table: Vec<StepSpec>) -> Self {
        self.table = table;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    /// Start a submission, or continue it if a checkpoint already exists.
    ///
    /// `Err` only for problems found before touching the portal; handler
    /// failures come back as a failed `SubmissionResult`.
    pub async fn run(&self, page: &dyn PortalPage, request: SubmissionRequest) -> Result<SubmissionResult, PortalError> {
        request.validate()?;

        let state = match self.store.load(&request.submission_id)? {
            Some(state) => {
                info!(
                    submission_id = %state.submission_id,
                    step = %state.current_step,
                    "Checkpoint found; continuing instead of starting over"
                );
                self.restart_if_failed(state)?
            }
            None => {
                let state = SubmissionState::new(request);
                self.store.save(&state)?;
                state
            }
        };

        self.audit.submission_started(&state.submission_id, state.current_step);
        Ok(self.drive(page, state).await)
    }

    /// Continue a checkpointed submission by id
    pub async fn resume(&self, page: &dyn PortalPage, submission_id: &str) -> Result<SubmissionResult, PortalError> {
        let state = self
            .store
            .load(submission_id)?
            .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))?;
        info!(submission_id, step = %state.current_step, "Resuming submission");
        let state = self.restart_if_failed(state)?;
        Ok(self.drive(page, state).await)
    }

    /// Record the out-of-band payment so the next `resume` can finish
    pub fn confirm_payment(&self, submission_id: &str, reference: Option<&str>) -> Result<SubmissionState, PortalError> {
        let mut state = self
            .store
            .load(submission_id)?
            .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))?;

        if state.current_step != Step::AwaitingPayment {
            return Err(PortalError::InvalidTransition { from: state.current_step, to: Step::PostPayment });
        }

        state.set(keys::PAYMENT_CONFIRMED, "true");
        if let Some(reference) = reference {
            state.set(keys::PAYMENT_REFERENCE, reference);
        }
        state.updated_at = Utc::now();
        self.store.save(&state)?;
        self.audit.payment_confirmed(submission_id);
        Ok(state)
    }

    fn restart_if_failed(&self, mut state: SubmissionState) -> Result<SubmissionState, PortalError> {
        if state.needs_restart() {
            warn!(
                submission_id = %state.submission_id,
                failed_at = state.get(keys::FAILED_AT).unwrap_or_default(),
                "Previous run failed mid-wizard; starting a new application"
            );
            state.restart();
            self.store.save(&state)?;
        }
        Ok(state)
    }

    fn spec(&self, step: Step) -> Option<&StepSpec> {
        self.table.iter().find(|s| s.step == step)
    }

    async fn drive(&self, page: &dyn PortalPage, mut state: SubmissionState) -> SubmissionResult {
        let request = state.request.clone();
        let submission_id = state.submission_id.clone();
        let mut completed = Vec::new();
        let mut analyses = Vec::new();

        let failure = loop {
            let step = state.current_step;
            match step {
                Step::Complete => break None,
                Step::AwaitingPayment if !state.payment_confirmed() => {
                    info!(submission_id = %submission_id, "Waiting for out-of-band payment");
                    break None;
                }
                Step::AwaitingPayment => {
                    state.advance(Step::PostPayment);
                    if let Err(e) = self.store.save(&state) {
                        break Some(PortalError::from(e));
                    }
                    continue;
                }
                _ => {}
            }

            if self.cancel.load(Ordering::SeqCst) {
                warn!(submission_id = %submission_id, step = %step, "Cancellation requested");
                break Some(PortalError::Cancelled { step });
            }

            let Some(spec) = self.spec(step) else {
                break Some(PortalError::InvalidTransition { from: state.last_completed_step.unwrap_or(step), to: step });
            };

            debug!(submission_id = %submission_id, step = %step, "Running step");
            let outcome = {
                let mut ctx = StepContext {
                    page,
                    config: &self.config,
                    analyzer: self.analyzer.as_ref(),
                    audit: self.audit.as_ref(),
                    request: &request,
                    state: &mut state,
                    analyses: &mut analyses,
                };
                let next_anchor = step.next().and_then(|next| self.spec(next)).and_then(|s| s.anchor.as_ref());
                RecoveryWrapper::wrap(spec, next_anchor, &mut ctx).await
            };

            let result = match outcome.and_then(|r| check_transition(step, r.next_step).map(|_| r)) {
                Ok(result) => result,
                Err(e) => break Some(e),
            };

            state.advance(result.next_step);
            if let Err(e) = self.store.save(&state) {
                break Some(PortalError::from(e));
            }
            completed.push(step);
            self.audit.step_completed(&submission_id, step);
            info!(submission_id = %submission_id, step = %step, next = %result.next_step, "Step completed");

            match result.next_step {
                Step::AwaitingPayment => self.audit.awaiting_payment(&submission_id, state.get(keys::FEE_TEXT)),
                Step::Complete => {
                    if let Some(permit) = state.permit_number() {
                        self.audit.permit_issued(&submission_id, permit);
                    }
                }
                _ => {}
            }
        };

        if let Some(err) = &failure {
            error!(submission_id = %submission_id, step = %state.current_step, "Submission failed: {}", err);
            state.record_error(format!("{}: {}", state.current_step, err));
            state.mark_failed();
            if let Err(e) = self.store.save(&state) {
                warn!(submission_id = %submission_id, "Could not checkpoint the failure: {}", e);
            }
            match err {
                PortalError::SessionExpired(_) => self.audit.session_expired(&submission_id),
                _ => self.audit.submission_failed(&submission_id, state.current_step, &err.to_string()),
            }
        }

        SubmissionResult::from_state(&state, completed, analyses, failure.as_ref())
    }
}
