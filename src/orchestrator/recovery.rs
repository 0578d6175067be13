//! Vision-assisted recovery around a single step
//!
//! One attempt only. The failure and a screenshot go to the analyzer; its
//! suggested actions run only when the answer clears the confidence
//! threshold. Below it nothing is touched and the caller gets
//! `LowConfidenceRecovery`, which ends the run for manual review.
//!
//! After the suggested fields are filled the step's advance control is
//! pressed, and the step only counts as done once the page has left it.
//! Otherwise the original failure is returned.

use tracing::{info, warn};

use super::steps::{Anchor, StepContext, StepSpec};
use crate::core::{PortalError, Step, StepResult};

pub struct RecoveryWrapper;

impl RecoveryWrapper {
    /// `next_anchor` identifies the page that follows this step, if known
    pub async fn wrap(
        spec: &StepSpec,
        next_anchor: Option<&Anchor>,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult, PortalError> {
        let err = match spec.execute(ctx).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if !spec.recovery_enabled || !err.is_recoverable() {
            return Err(err);
        }

        let step = spec.step;
        let cause = err.to_string();
        warn!(step = %step, "Step failed, attempting recovery: {}", cause);
        ctx.state.record_error(format!("{}: {}", step, cause));

        let context = format!(
            "The automated handler for this step failed with: {}. Identify the fields still needing \
             values and the control that advances the wizard.",
            cause
        );
        let analysis = ctx.analyze(step, &context).await;
        ctx.audit.recovery_attempted(&ctx.state.submission_id, step, analysis.confidence, &cause);

        let threshold = ctx.threshold();
        if !analysis.clears(threshold) {
            return Err(PortalError::LowConfidenceRecovery { step, confidence: analysis.confidence, threshold, cause });
        }

        let exec = ctx.executor();
        for field in &analysis.fields {
            exec.execute(field).await?;
        }

        let Some(control) = analysis.submit_reference.clone().or_else(|| spec.handler.advance_control()) else {
            warn!(step = %step, "No advance control to press after recovery");
            return Err(err);
        };
        let url_before = ctx.page.current_url().await?;
        info!(step = %step, control = %control, suggested = analysis.suggests_advance(), "Recovery pressing advance control");
        exec.click(&control).await?;
        ctx.settle().await;

        if !RecoveryWrapper::left_step(spec, next_anchor, &url_before, ctx).await? {
            warn!(step = %step, control = %control, "Page did not leave the step after recovery");
            return Err(err);
        }
        Ok(StepResult::advance(step.next().unwrap_or(Step::Complete)))
    }

    /// The next page's anchor showed up, else this step's anchor is gone,
    /// else at least the URL changed
    async fn left_step(
        spec: &StepSpec,
        next_anchor: Option<&Anchor>,
        url_before: &str,
        ctx: &StepContext<'_>,
    ) -> Result<bool, PortalError> {
        if let Some(anchor) = next_anchor {
            let next = spec.step.next().unwrap_or(Step::Complete);
            return match ctx.wait_anchor(next, anchor).await {
                Ok(()) => Ok(true),
                Err(PortalError::StepVerificationFailed { .. }) => Ok(false),
                Err(e) => Err(e),
            };
        }
        if let Some(anchor) = &spec.anchor {
            return Ok(!ctx.anchor_present(anchor).await?);
        }
        Ok(ctx.page.current_url().await? != url_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{Effect, FixtureElement, FixturePage, FixtureScreen};
    use crate::browser::ElementRef;
    use crate::orchestrator::action::ActionDescriptor;
    use crate::orchestrator::steps::step_table;
    use crate::orchestrator::steps::test_support::Harness;
    use crate::orchestrator::vision::{StaticAnalyzer, VisionAnalysis};

    async fn recover(step: Step, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let table = step_table();
        let spec = table.iter().find(|s| s.step == step).unwrap();
        let next_anchor = step
            .next()
            .and_then(|next| table.iter().find(|s| s.step == next))
            .and_then(|s| s.anchor.as_ref());
        RecoveryWrapper::wrap(spec, next_anchor, ctx).await
    }

    fn applicant_page() -> FixturePage {
        FixturePage::new(vec![
            FixtureScreen::new("applicant", "https://portal.test/applicant", "Applicant")
                .with(FixtureElement::input("Contact Name"))
                .with(FixtureElement::input("Phone Number"))
                .with(FixtureElement::input("E-mail"))
                .with(FixtureElement::button("Continue Application »").on_click(Effect::Advance)),
            FixtureScreen::new("scope", "https://portal.test/scope", "Project Description"),
        ])
    }

    fn suggestion(confidence: u8) -> VisionAnalysis {
        VisionAnalysis {
            confidence,
            fields: vec![ActionDescriptor::fill(ElementRef::label("E-mail"), "dispatch@coolbreeze.test")],
            recommendations: vec!["Fill the e-mail field, then click Continue Application".into()],
            ..VisionAnalysis::degraded(Step::Applicant, "")
        }
    }

    #[tokio::test]
    async fn test_recovery_runs_confident_suggestion() {
        let page = applicant_page();
        let mut harness = Harness::new(StaticAnalyzer::scripted(vec![suggestion(80)]));
        {
            let mut ctx = harness.ctx(&page);
            let result = recover(Step::Applicant, &mut ctx).await.unwrap();
            assert_eq!(result.next_step, Step::ProjectScope);
        }
        assert_eq!(page.value_of("E-mail").as_deref(), Some("dispatch@coolbreeze.test"));
        assert_eq!(page.current_screen(), "scope");
        assert_eq!(harness.state.errors.len(), 1);
        assert!(harness.state.errors[0].starts_with("applicant: Element not found"));
    }

    #[tokio::test]
    async fn test_recovery_that_does_not_leave_the_page_fails() {
        // Continue stays put, e.g. a validation message the model missed
        let page = FixturePage::new(vec![
            FixtureScreen::new("applicant", "https://portal.test/applicant", "Applicant")
                .with(FixtureElement::input("Contact Name"))
                .with(FixtureElement::input("Phone Number"))
                .with(FixtureElement::input("E-mail"))
                .with(FixtureElement::button("Continue Application »")),
            FixtureScreen::new("scope", "https://portal.test/scope", "Project Description"),
        ]);
        let mut harness = Harness::new(StaticAnalyzer::scripted(vec![suggestion(80)]));
        {
            let mut ctx = harness.ctx(&page);
            let err = recover(Step::Applicant, &mut ctx).await.unwrap_err();
            assert!(matches!(err, PortalError::ElementNotFound { .. }), "got {:?}", err);
        }
        assert_eq!(page.value_of("E-mail").as_deref(), Some("dispatch@coolbreeze.test"));
        assert!(page.actions().iter().any(|a| a.starts_with("click button:Continue Application")));
        assert_eq!(page.current_screen(), "applicant");
    }

    #[tokio::test]
    async fn test_low_confidence_leaves_page_untouched() {
        let page = applicant_page();
        let mut harness = Harness::new(StaticAnalyzer::scripted(vec![suggestion(20)]));
        let mut ctx = harness.ctx(&page);
        let err = recover(Step::Applicant, &mut ctx).await.unwrap_err();
        assert!(matches!(err, PortalError::LowConfidenceRecovery { step: Step::Applicant, confidence: 20, .. }));
        assert_eq!(page.value_of("E-mail").as_deref(), Some(""));
        assert_eq!(page.current_screen(), "applicant");
    }

    #[tokio::test]
    async fn test_session_expired_is_not_recovered() {
        let page = FixturePage::new(vec![FixtureScreen::new(
            "login",
            "https://portal.test/login",
            "Login to your account",
        )])
        .route("CapHome", "login");
        let mut harness = Harness::new(StaticAnalyzer::scripted(vec![suggestion(95)]));
        {
            let mut ctx = harness.ctx(&page);
            let err = recover(Step::StartApplication, &mut ctx).await.unwrap_err();
            assert!(matches!(err, PortalError::SessionExpired(_)));
        }
        assert!(harness.analyzer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_steps_without_recovery_rethrow() {
        let page = FixturePage::new(vec![FixtureScreen::new("x", "https://portal.test/x", "Something else")]);
        let mut harness = Harness::new(StaticAnalyzer::scripted(vec![suggestion(95)]));
        {
            let mut ctx = harness.ctx(&page);
            let err = recover(Step::WorkItems, &mut ctx).await.unwrap_err();
            assert!(matches!(err, PortalError::StepVerificationFailed { step: Step::WorkItems, .. }));
        }
        assert!(harness.analyzer.calls().is_empty());
    }
}
