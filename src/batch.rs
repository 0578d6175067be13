//! Batch runner
//!
//! Caller-side policy around the sequencer: one exclusive browser session
//! per submission, an attempt cap that routes stubborn items to manual
//! review, and a cooldown between submissions so the portal is not hammered.
//!
//! The cap counts runs since the last payment pause; the queue resets the
//! counter when a submission reaches `AwaitingPayment`.

use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::browser::SessionFactory;
use crate::core::config::BatchConfig;
use crate::core::{ErrorKind, PortalError, Step, StoreError, SubmissionResult};
use crate::logging::SystemLogger;
use crate::orchestrator::StepSequencer;
use crate::queue::{QueueItem, QueueStatus, SubmissionQueue};

/// One line of the batch report
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub submission_id: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub final_step: Option<Step>,
    pub permit_number: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl BatchItem {
    fn from_result(result: &SubmissionResult, status: QueueStatus, attempts: u32) -> Self {
        Self {
            submission_id: result.submission_id.clone(),
            status,
            attempts,
            final_step: Some(result.final_step),
            permit_number: result.permit_number.clone(),
            error: result.error.clone(),
            error_kind: result.error_kind,
        }
    }

    fn errored(id: &str, status: QueueStatus, attempts: u32, error: &PortalError) -> Self {
        Self {
            submission_id: id.to_string(),
            status,
            attempts,
            final_step: None,
            permit_number: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    /// Submitted, or parked for payment
    pub fn succeeded(&self) -> bool {
        matches!(self.status, QueueStatus::Submitted | QueueStatus::AwaitingPayment)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub items: Vec<BatchItem>,
    pub dry_run: bool,
    /// Set when the batch stopped before the end of the list
    pub stopped_early: Option<String>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn count(&self, status: QueueStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

pub struct BatchRunner {
    sequencer: Arc<StepSequencer>,
    queue: Arc<SubmissionQueue>,
    sessions: Arc<dyn SessionFactory>,
    audit: Arc<SystemLogger>,
    policy: BatchConfig,
}

impl BatchRunner {
    pub fn new(
        sequencer: Arc<StepSequencer>,
        queue: Arc<SubmissionQueue>,
        sessions: Arc<dyn SessionFactory>,
        audit: Arc<SystemLogger>,
    ) -> Self {
        let policy = sequencer.config().batch.clone();
        Self { sequencer, queue, sessions, audit, policy }
    }

    /// Process up to `limit` pending submissions, oldest first
    pub async fn run_batch(&self, limit: usize, dry_run: bool) -> Result<BatchSummary, StoreError> {
        let pending = self.queue.pending(limit, self.policy.max_attempts)?;
        info!(count = pending.len(), limit, dry_run, "Batch starting");

        let mut summary = BatchSummary { dry_run, ..Default::default() };
        if dry_run {
            summary.items = pending.iter().map(listed).collect();
            return Ok(summary);
        }

        let cancel = self.sequencer.cancel_flag();
        for (i, item) in pending.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                summary.stopped_early = Some("cancelled".into());
                break;
            }
            if i > 0 && !self.policy.cooldown().is_zero() {
                info!(secs = self.policy.cooldown_secs, "Cooling down before next submission");
                tokio::time::sleep(self.policy.cooldown()).await;
            }

            let outcome = self.process(item).await?;
            let expired = outcome.error_kind == Some(ErrorKind::SessionExpired);
            summary.items.push(outcome);

            if expired {
                // Every later item would hit the same login page
                error!("Portal session expired; stopping batch");
                summary.stopped_early = Some("portal session expired".into());
                break;
            }
        }

        info!(
            total = summary.total(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Report line for one queued submission without running it
    pub fn list_one(&self, submission_id: &str) -> Result<BatchItem, StoreError> {
        self.queue
            .get(submission_id)?
            .map(|item| listed(&item))
            .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))
    }

    /// Process a single queued submission by id, ignoring its position
    pub async fn run_one(&self, submission_id: &str) -> Result<BatchItem, StoreError> {
        let item = self
            .queue
            .get(submission_id)?
            .ok_or_else(|| StoreError::NotFound(submission_id.to_string()))?;
        self.process(item).await
    }

    async fn process(&self, item: QueueItem) -> Result<BatchItem, StoreError> {
        let id = item.id.clone();
        let attempts = self.queue.record_attempt(&id)?;

        if attempts > self.policy.max_attempts {
            let err = PortalError::MaxRetriesExceeded { submission_id: id.clone(), attempts: attempts - 1 };
            warn!(submission_id = %id, attempts = attempts - 1, "Attempt cap reached; routing to manual review");
            self.queue.set_status(&id, QueueStatus::ManualReview, Some(&err.to_string()))?;
            self.audit.manual_review_required(&id, attempts - 1);
            return Ok(BatchItem::errored(&id, QueueStatus::ManualReview, attempts - 1, &err));
        }

        info!(submission_id = %id, attempt = attempts, "Processing submission");
        let session = match self.sessions.open(&id).await {
            Ok(session) => session,
            Err(e) => {
                error!(submission_id = %id, "Could not open browser session: {}", e);
                let err = PortalError::from(e);
                let status = self.fail(&id, attempts, &err.to_string())?;
                return Ok(BatchItem::errored(&id, status, attempts, &err));
            }
        };

        let outcome = self.sequencer.run(session.page(), item.request).await;
        if let Err(e) = session.close().await {
            warn!(submission_id = %id, "Closing browser session failed: {}", e);
        }

        match outcome {
            Ok(result) => {
                let mut status = self.queue.record_outcome(&result)?;
                if status == QueueStatus::Failed {
                    status = self.fail(&id, attempts, result.error.as_deref().unwrap_or("run failed"))?;
                }
                Ok(BatchItem::from_result(&result, status, attempts))
            }
            Err(PortalError::Store(e)) => Err(e),
            Err(e @ PortalError::InvalidRequest(_)) => {
                // Bad input does not improve with retries
                self.queue.set_status(&id, QueueStatus::ManualReview, Some(&e.to_string()))?;
                self.audit.manual_review_required(&id, attempts);
                Ok(BatchItem::errored(&id, QueueStatus::ManualReview, attempts, &e))
            }
            Err(e) => {
                let status = self.fail(&id, attempts, &e.to_string())?;
                Ok(BatchItem::errored(&id, status, attempts, &e))
            }
        }
    }

    /// Failed again; on the last allowed attempt it goes to manual review
    /// with the failure that ended it
    fn fail(&self, id: &str, attempts: u32, error: &str) -> Result<QueueStatus, StoreError> {
        if attempts < self.policy.max_attempts {
            self.queue.set_status(id, QueueStatus::Failed, Some(error))?;
            return Ok(QueueStatus::Failed);
        }
        warn!(submission_id = %id, attempts, "Last attempt failed; routing to manual review");
        self.queue.set_status(id, QueueStatus::ManualReview, Some(error))?;
        self.audit.manual_review_required(id, attempts);
        Ok(QueueStatus::ManualReview)
    }
}

fn listed(item: &QueueItem) -> BatchItem {
    BatchItem {
        submission_id: item.id.clone(),
        status: item.status,
        attempts: item.attempts,
        final_step: None,
        permit_number: item.permit_number.clone(),
        error: item.last_error.clone(),
        error_kind: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{FixturePage, FixtureScreen, FixtureSessionFactory};
    use crate::core::request::sample_request;
    use crate::core::{keys, OrchestratorConfig, StepResult};
    use crate::orchestrator::steps::{StepContext, StepHandler, StepSpec};
    use crate::orchestrator::{SqliteCheckpointStore, StaticAnalyzer};
    use async_trait::async_trait;

    /// Whole wizard in one step: either a permit or the scripted error
    struct OneShot {
        fail_with: Option<fn() -> PortalError>,
    }

    #[async_trait]
    impl StepHandler for OneShot {
        fn step(&self) -> Step {
            Step::StartApplication
        }

        async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            ctx.state.set(keys::PERMIT_NUMBER, "MEC-2025-000311");
            Ok(StepResult::advance(Step::Complete))
        }
    }

    type Sessions = FixtureSessionFactory<fn(&str) -> Arc<FixturePage>>;

    fn blank_page(_id: &str) -> Arc<FixturePage> {
        Arc::new(FixturePage::new(vec![FixtureScreen::new("blank", "https://portal.test/", "")]))
    }

    /// Stops for payment, then finishes after it
    struct PayFirst {
        step: Step,
    }

    #[async_trait]
    impl StepHandler for PayFirst {
        fn step(&self) -> Step {
            self.step
        }

        async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
            if self.step == Step::PostPayment {
                ctx.state.set(keys::PERMIT_NUMBER, "MEC-2025-000311");
                return Ok(StepResult::advance(Step::Complete));
            }
            Ok(StepResult::advance(Step::AwaitingPayment))
        }
    }

    fn spec(handler: Box<dyn StepHandler>) -> StepSpec {
        StepSpec { step: handler.step(), handler, anchor: None, recovery_enabled: false }
    }

    fn runner(fail_with: Option<fn() -> PortalError>, max_attempts: u32) -> (BatchRunner, Arc<SubmissionQueue>, Arc<Sessions>) {
        let (runner, queue, sessions, _) = runner_with(vec![spec(Box::new(OneShot { fail_with }))], max_attempts);
        (runner, queue, sessions)
    }

    fn runner_with(
        table: Vec<StepSpec>,
        max_attempts: u32,
    ) -> (BatchRunner, Arc<SubmissionQueue>, Arc<Sessions>, Arc<StepSequencer>) {
        let mut config = OrchestratorConfig::default();
        config.batch.cooldown_secs = 0;
        config.batch.max_attempts = max_attempts;
        let audit = Arc::new(SystemLogger::console_only());
        let sequencer = StepSequencer::new(
            config,
            Arc::new(SqliteCheckpointStore::open_memory().unwrap()),
            Arc::new(StaticAnalyzer::disabled()),
            audit.clone(),
        )
        .with_table(table);
        let sequencer = Arc::new(sequencer);
        let queue = Arc::new(SubmissionQueue::open_memory().unwrap());
        let sessions: Arc<Sessions> = Arc::new(FixtureSessionFactory::new(blank_page as fn(&str) -> Arc<FixturePage>));
        let runner = BatchRunner::new(sequencer.clone(), queue.clone(), sessions.clone(), audit);
        (runner, queue, sessions, sequencer)
    }

    fn not_found() -> PortalError {
        PortalError::ElementNotFound { target: "button \"Look Up\"".into(), waited_ms: 10 }
    }

    fn expired() -> PortalError {
        PortalError::SessionExpired("login page shown".into())
    }

    #[tokio::test]
    async fn test_successful_batch() {
        let (runner, queue, sessions) = runner(None, 3);
        queue.enqueue(sample_request("b-1")).unwrap();
        queue.enqueue(sample_request("b-2")).unwrap();

        let summary = runner.run_batch(10, false).await.unwrap();
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.count(QueueStatus::Submitted), 2);
        assert_eq!(summary.failed(), 0);
        assert_eq!(sessions.opened(), vec!["b-1", "b-2"]);
        assert_eq!(queue.get("b-1").unwrap().unwrap().permit_number.as_deref(), Some("MEC-2025-000311"));
    }

    #[tokio::test]
    async fn test_dry_run_opens_nothing() {
        let (runner, queue, sessions) = runner(None, 3);
        queue.enqueue(sample_request("b-3")).unwrap();
        let summary = runner.run_batch(10, true).await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.items[0].status, QueueStatus::Queued);
        assert!(sessions.opened().is_empty());
        assert_eq!(queue.get("b-3").unwrap().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_dry_run_single_item() {
        let (runner, queue, sessions) = runner(None, 3);
        queue.enqueue(sample_request("b-9")).unwrap();
        queue.enqueue(sample_request("b-10")).unwrap();

        let item = runner.list_one("b-10").unwrap();
        assert_eq!(item.submission_id, "b-10");
        assert_eq!(item.status, QueueStatus::Queued);
        assert!(sessions.opened().is_empty());
        assert_eq!(queue.get("b-10").unwrap().unwrap().attempts, 0);
        assert!(matches!(runner.list_one("nope"), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_attempt_cap_routes_to_manual_review() {
        let (runner, queue, sessions) = runner(Some(not_found), 2);
        queue.enqueue(sample_request("b-4")).unwrap();

        let first = runner.run_batch(10, false).await.unwrap();
        assert_eq!(first.items[0].status, QueueStatus::Failed);

        // The last allowed attempt fails: straight to review, real cause kept
        let second = runner.run_batch(10, false).await.unwrap();
        assert_eq!(second.items[0].status, QueueStatus::ManualReview);
        assert!(second.items[0].error.as_deref().unwrap().contains("Look Up"));
        let stored = queue.get("b-4").unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::ManualReview);
        assert!(stored.last_error.as_deref().unwrap().contains("Look Up"));
        assert_eq!(sessions.opened().len(), 2);
        assert!(queue.pending(10, 2).unwrap().is_empty());
        assert!(runner.run_batch(10, false).await.unwrap().items.is_empty());

        // Forcing it by id hits the cap before any browser opens
        let forced = runner.run_one("b-4").await.unwrap();
        assert_eq!(forced.status, QueueStatus::ManualReview);
        assert!(forced.error.as_deref().unwrap().contains("exceeded 2 attempts"));
        assert_eq!(sessions.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_post_payment_run_has_its_own_attempt_budget() {
        let table = vec![
            spec(Box::new(PayFirst { step: Step::StartApplication })),
            spec(Box::new(PayFirst { step: Step::PostPayment })),
        ];
        let (runner, queue, _sessions, sequencer) = runner_with(table, 1);
        queue.enqueue(sample_request("b-8")).unwrap();

        let first = runner.run_batch(10, false).await.unwrap();
        assert_eq!(first.items[0].status, QueueStatus::AwaitingPayment);
        assert_eq!(queue.get("b-8").unwrap().unwrap().attempts, 0);

        sequencer.confirm_payment("b-8", None).unwrap();
        queue.set_status("b-8", QueueStatus::PaymentReceived, None).unwrap();

        let second = runner.run_batch(10, false).await.unwrap();
        let item = &second.items[0];
        assert_eq!(item.status, QueueStatus::Submitted, "error: {:?}", item.error);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.permit_number.as_deref(), Some("MEC-2025-000311"));
    }

    #[tokio::test]
    async fn test_session_expiry_stops_batch() {
        let (runner, queue, sessions) = runner(Some(expired), 3);
        queue.enqueue(sample_request("b-5")).unwrap();
        queue.enqueue(sample_request("b-6")).unwrap();

        let summary = runner.run_batch(10, false).await.unwrap();
        assert_eq!(summary.total(), 1);
        assert_eq!(summary.stopped_early.as_deref(), Some("portal session expired"));
        assert_eq!(sessions.opened(), vec!["b-5"]);
    }

    #[tokio::test]
    async fn test_invalid_request_goes_to_manual_review() {
        let (runner, queue, _sessions) = runner(None, 3);
        let mut bad = sample_request("b-7");
        bad.equipment.tonnage = 0.0;
        queue.enqueue(bad).unwrap();

        let item = runner.run_one("b-7").await.unwrap();
        assert_eq!(item.status, QueueStatus::ManualReview);
        assert!(matches!(runner.run_one("nope").await, Err(StoreError::NotFound(_))));
    }
}
