//! Step handlers and the step table
//!
//! Every wizard step is one [`StepHandler`]. The sequencer walks the table
//! returned by [`step_table`]; each entry carries the handler, the anchor
//! that proves the portal is on that step, and whether a failure gets a
//! vision-assisted recovery attempt.

pub mod adaptive;
pub mod deterministic;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::action::ActionExecutor;
use super::stability::{GateOutcome, StabilityGate};
use super::vision::{StepAnalyzer, VisionAnalysis};
use crate::browser::{BrowserError, ElementRef, PortalPage};
use crate::core::{OrchestratorConfig, PortalError, Step, StepResult, SubmissionRequest, SubmissionState, TimingPolicy};
use crate::logging::SystemLogger;

/// Accessible name of the portal's wizard advance button
pub const CONTINUE: &str = "Continue Application";

/// What must be on screen before a step's handler acts
#[derive(Debug, Clone, PartialEq)]
pub enum Anchor {
    /// Case-insensitive substring of the page text
    Text(String),
    Control(ElementRef),
}

impl Anchor {
    pub fn text(s: &str) -> Self {
        Anchor::Text(s.into())
    }

    fn describe(&self) -> String {
        match self {
            Anchor::Text(t) => format!("text \"{}\"", t),
            Anchor::Control(r) => r.to_string(),
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step(&self) -> Step;

    /// Control pressed to leave the step
    fn advance_control(&self) -> Option<ElementRef> {
        Some(ElementRef::button(CONTINUE))
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError>;
}

/// One row of the step table
pub struct StepSpec {
    pub step: Step,
    pub handler: Box<dyn StepHandler>,
    pub anchor: Option<Anchor>,
    pub recovery_enabled: bool,
}

impl StepSpec {
    fn new(handler: Box<dyn StepHandler>, anchor: Option<Anchor>, recovery_enabled: bool) -> Self {
        Self { step: handler.step(), handler, anchor, recovery_enabled }
    }

    /// Verify the anchor, then run the handler
    pub async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        if let Some(anchor) = &self.anchor {
            ctx.wait_anchor(self.step, anchor).await?;
        }
        self.handler.run(ctx).await
    }
}

/// The fixed wizard, in portal order
pub fn step_table() -> Vec<StepSpec> {
    use adaptive::{Documents, PostPayment, ReviewSubmit, WorkItems};
    use deterministic::{Address, Applicant, Contractor, Equipment, PermitType, ProjectScope, StartApplication};

    vec![
        StepSpec::new(Box::new(StartApplication), None, true),
        StepSpec::new(Box::new(PermitType), Some(Anchor::text("Select a Record Type")), true),
        StepSpec::new(Box::new(Address), Some(Anchor::text("Property Address")), true),
        StepSpec::new(Box::new(Contractor), Some(Anchor::text("Licensed Professional")), true),
        StepSpec::new(Box::new(Applicant), Some(Anchor::text("Applicant")), true),
        StepSpec::new(Box::new(ProjectScope), Some(Anchor::text("Project Description")), true),
        StepSpec::new(Box::new(Equipment), Some(Anchor::text("Equipment Information")), true),
        StepSpec::new(Box::new(WorkItems), Some(Anchor::text("Work Items")), false),
        StepSpec::new(Box::new(Documents), Some(Anchor::text("Documents")), false),
        StepSpec::new(Box::new(ReviewSubmit), Some(Anchor::text("Review")), false),
        StepSpec::new(Box::new(PostPayment), None, false),
    ]
}

/// Everything a handler may touch during one step
pub struct StepContext<'a> {
    pub page: &'a dyn PortalPage,
    pub config: &'a OrchestratorConfig,
    pub analyzer: &'a dyn StepAnalyzer,
    pub audit: &'a SystemLogger,
    pub request: &'a SubmissionRequest,
    pub state: &'a mut SubmissionState,
    pub analyses: &'a mut Vec<VisionAnalysis>,
}

impl<'a> StepContext<'a> {
    pub fn timing(&self) -> &'a TimingPolicy {
        let config: &'a OrchestratorConfig = self.config;
        &config.timing
    }

    pub fn executor(&self) -> ActionExecutor<'a> {
        ActionExecutor::new(self.page, self.timing())
    }

    pub fn gate(&self) -> StabilityGate<'a> {
        let config: &'a OrchestratorConfig = self.config;
        StabilityGate::new(self.page, &config.portal.busy_indicators, &config.timing.stability)
    }

    /// Stability gate, then one bounded sleep if the indicators never cleared
    pub async fn settle(&self) -> GateOutcome {
        let outcome = self.gate().settle().await;
        if !outcome.is_stable() {
            tokio::time::sleep(self.timing().fallback_sleep()).await;
        }
        outcome
    }

    pub fn threshold(&self) -> u8 {
        self.config.vision.min_confidence
    }

    pub async fn body_text(&self) -> Result<String, PortalError> {
        Ok(self.page.body_text().await?)
    }

    pub async fn goto(&self, url: &str) -> Result<(), PortalError> {
        self.page
            .goto(url, self.timing().navigation_timeout_ms)
            .await
            .map_err(|e| match e {
                BrowserError::NavigationTimeout(detail) => PortalError::NavigationTimeout { url: url.into(), detail },
                other => PortalError::Browser(other),
            })
    }

    /// Bounded wait for the step's anchor
    pub async fn anchor_present(&self, anchor: &Anchor) -> Result<bool, PortalError> {
        Ok(match anchor {
            Anchor::Text(text) => self.body_text().await?.to_lowercase().contains(&text.to_lowercase()),
            Anchor::Control(target) => self.executor().try_find(target).await?.is_some(),
        })
    }

    pub async fn wait_anchor(&self, step: Step, anchor: &Anchor) -> Result<(), PortalError> {
        let wait = self.timing().anchor_wait();
        let start = Instant::now();
        loop {
            if self.anchor_present(anchor).await? {
                debug!(step = %step, anchor = %anchor.describe(), "Anchor present");
                return Ok(());
            }
            if start.elapsed() >= wait {
                return Err(PortalError::StepVerificationFailed { step, expected: anchor.describe() });
            }
            tokio::time::sleep(self.timing().poll_interval()).await;
        }
    }

    /// Press the step's advance control and let the next page load
    pub async fn advance(&self, from: Step) -> Result<StepResult, PortalError> {
        self.executor().click(&ElementRef::button(CONTINUE)).await?;
        self.settle().await;
        Ok(StepResult::advance(from.next().unwrap_or(Step::Complete)))
    }

    /// Screenshot to the artifacts directory; best effort
    pub async fn capture(&mut self, label: &str) -> Option<Vec<u8>> {
        let png = match self.page.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(label, "Screenshot failed: {}", e);
                return None;
            }
        };

        let seq = self.state.screenshots.len() + 1;
        let dir: PathBuf = self.config.storage.artifacts_dir.join(&self.state.submission_id);
        let path = dir.join(format!("{:02}-{}.png", seq, label));
        let written = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => tokio::fs::write(&path, &png).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => self.state.screenshots.push(path.display().to_string()),
            Err(e) => warn!(path = %path.display(), "Could not save screenshot: {}", e),
        }
        Some(png)
    }

    /// Screenshot plus vision analysis; recorded in the run's analyses
    pub async fn analyze(&mut self, step: Step, context: &str) -> VisionAnalysis {
        let label = format!("{}-analysis", step);
        let analysis = match self.capture(&label).await {
            Some(png) => self.analyzer.analyze_step(&png, step, self.request, context).await,
            None => VisionAnalysis::degraded(step, "no screenshot available"),
        };
        self.analyses.push(analysis.clone());
        analysis
    }

    /// Vision fallback shared by the adaptive steps: analyze, gate on
    /// confidence, then run the suggested fields
    pub async fn vision_fallback(&mut self, step: Step, context: &str) -> Result<VisionAnalysis, PortalError> {
        let analysis = self.analyze(step, context).await;
        let threshold = self.threshold();
        if !analysis.clears(threshold) {
            return Err(PortalError::LowConfidenceRecovery {
                step,
                confidence: analysis.confidence,
                threshold,
                cause: context.to_string(),
            });
        }
        let exec = self.executor();
        for field in &analysis.fields {
            exec.execute(field).await?;
        }
        if !analysis.fields.is_empty() {
            self.settle().await;
        }
        Ok(analysis)
    }

    /// Poll until `check` holds or `wait` passes
    pub async fn wait_until<F>(&self, wait: Duration, mut check: F) -> Result<bool, PortalError>
    where
        F: FnMut(&str) -> bool + Send,
    {
        let start = Instant::now();
        loop {
            if check(&self.body_text().await?) {
                return Ok(true);
            }
            if start.elapsed() >= wait {
                return Ok(false);
            }
            tokio::time::sleep(self.timing().poll_interval()).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::browser::fixture::{FixturePage, FixtureScreen};
    use crate::orchestrator::vision::StaticAnalyzer;

    #[test]
    fn test_table_follows_step_order() {
        let table = step_table();
        let steps: Vec<Step> = table.iter().map(|s| s.step).collect();
        let mut expected: Vec<Step> = Step::ORDER[..10].to_vec();
        expected.push(Step::PostPayment);
        assert_eq!(steps, expected);
        assert!(table.iter().take(7).all(|s| s.recovery_enabled));
        assert!(table.iter().skip(7).all(|s| !s.recovery_enabled));
    }

    #[tokio::test]
    async fn test_missing_anchor_is_verification_failure() {
        let page = FixturePage::new(vec![FixtureScreen::new("x", "https://portal.test/x", "Something else")]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let ctx = harness.ctx(&page);
        let err = ctx.wait_anchor(Step::Applicant, &Anchor::text("Applicant")).await.unwrap_err();
        assert!(matches!(err, PortalError::StepVerificationFailed { step: Step::Applicant, .. }));
    }

    #[tokio::test]
    async fn test_capture_writes_numbered_artifacts() {
        let page = FixturePage::new(vec![FixtureScreen::new("x", "https://portal.test/x", "Work Items")]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        {
            let mut ctx = harness.ctx(&page);
            ctx.capture("failure").await.unwrap();
            let analysis = ctx.analyze(Step::WorkItems, "cost input").await;
            assert_eq!(analysis.confidence, 0);
        }
        assert_eq!(harness.state.screenshots.len(), 2);
        assert!(harness.state.screenshots[0].ends_with("01-failure.png"));
        assert!(harness.state.screenshots[1].ends_with("02-work_items-analysis.png"));
        assert!(std::path::Path::new(&harness.state.screenshots[1]).exists());
        assert_eq!(harness.analyses.len(), 1);
    }

    #[tokio::test]
    async fn test_capture_survives_unwritable_artifacts_dir() {
        let page = FixturePage::new(vec![FixtureScreen::new("x", "https://portal.test/x", "Work Items")]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        // A plain file where the directory should be
        let blocker = harness.artifacts.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        harness.config.storage.artifacts_dir = blocker;
        {
            let mut ctx = harness.ctx(&page);
            assert!(ctx.capture("failure").await.is_some());
        }
        assert!(harness.state.screenshots.is_empty());
    }
}
