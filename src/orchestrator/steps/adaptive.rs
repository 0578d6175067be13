//! Adaptive wizard steps 7-9 and the post-payment pass
//!
//! These pages differ between permit classes and portal releases. Each
//! handler tries direct heuristics first and only asks the vision model when
//! they fail; model suggestions run only above the confidence threshold.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{StepContext, StepHandler, CONTINUE};
use crate::browser::{ElementHandle, ElementRef, TextMatch};
use crate::core::{keys, PortalError, Step, StepResult};
use crate::orchestrator::permit::{classify_page, fee_text, PermitNumberExtractor, SubmitClassification};

pub struct WorkItems;

impl WorkItems {
    /// Known spellings of the cost input, most likely first
    fn cost_candidates() -> Vec<ElementRef> {
        vec![
            ElementRef::label("Job Value"),
            ElementRef::label("Estimated Cost"),
            ElementRef::placeholder("0.00"),
            ElementRef::selector("input[id*='JobValue']"),
        ]
    }
}

#[async_trait]
impl StepHandler for WorkItems {
    fn step(&self) -> Step {
        Step::WorkItems
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let value = ctx.request.valuation_text();

        let mut filled = false;
        for candidate in WorkItems::cost_candidates() {
            let Some(handle) = exec.peek(&candidate).await? else { continue };
            if !exec.inspect(&handle).await?.editable {
                continue;
            }
            info!(field = %candidate, "Cost field matched");
            exec.fill(&candidate, &value).await?;
            filled = true;
            break;
        }

        if !filled {
            let context = format!(
                "None of the known cost inputs matched. Find the job value / valuation input on this \
                 work items page and fill it with {}.",
                value
            );
            ctx.vision_fallback(self.step(), &context).await?;
        }

        ctx.advance(self.step()).await
    }
}

pub struct Documents;

#[async_trait]
impl StepHandler for Documents {
    fn step(&self) -> Step {
        Step::Documents
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let body = ctx.body_text().await?.to_lowercase();
        let no_docs = ctx
            .config
            .portal
            .no_documents_markers
            .iter()
            .any(|m| body.contains(&m.to_lowercase()));

        if no_docs {
            info!("No documents required; skipping uploads");
            ctx.state.set(keys::DOCUMENTS_SKIPPED, "true");
            return ctx.advance(self.step()).await;
        }

        let advance = ElementRef::button(CONTINUE);
        if !exec.wait_enabled(&advance, ctx.timing().enable_wait()).await? {
            warn!("Continue stays disabled on the documents step; asking vision");
            let context = "The Continue button stays disabled on the documents step. Express permits need no \
                           plans; find the control or acknowledgement that lets the wizard continue.";
            ctx.vision_fallback(self.step(), context).await?;

            if !exec.wait_enabled(&advance, ctx.timing().enable_wait()).await? {
                return Err(PortalError::ElementNotInteractable {
                    target: advance.to_string(),
                    action: "click".into(),
                    reason: "still disabled after vision fallback".into(),
                });
            }
        }

        ctx.advance(self.step()).await
    }
}

pub struct ReviewSubmit;

impl ReviewSubmit {
    async fn find_submit(ctx: &StepContext<'_>) -> Result<Option<(ElementRef, ElementHandle)>, PortalError> {
        let exec = ctx.executor();
        let matchers = [
            (ElementRef::button("Submit Application"), TextMatch::Exact),
            (ElementRef::button("Submit"), TextMatch::Contains),
            (ElementRef::link("Submit"), TextMatch::Contains),
        ];
        for (target, matching) in matchers {
            if let Some(handle) = exec.poll(&target, Some(matching), ctx.timing().peek_wait()).await? {
                return Ok(Some((target, handle)));
            }
        }

        // Brand-styled primary buttons
        for selector in &ctx.config.portal.primary_button_selectors {
            let target = ElementRef::selector(selector);
            if let Some(handle) = ctx.page.find(&target, TextMatch::Exact).await? {
                return Ok(Some((target, handle)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StepHandler for ReviewSubmit {
    fn step(&self) -> Step {
        Step::ReviewSubmit
    }

    fn advance_control(&self) -> Option<ElementRef> {
        Some(ElementRef::button("Submit Application"))
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();

        // The submit control sits below the fold on the review page
        if let Err(e) = ctx.page.evaluate("window.scrollTo(0, document.body.scrollHeight)").await {
            warn!("Scroll failed: {}", e);
        }

        match ReviewSubmit::find_submit(ctx).await? {
            Some((target, handle)) => {
                info!(control = %target, "Submitting application");
                exec.click_handle(&target, &handle).await?;
            }
            None => {
                let analysis = ctx
                    .vision_fallback(self.step(), "No submit control matched on the review page. Identify it.")
                    .await?;
                let target = analysis.submit_reference.clone().ok_or_else(|| PortalError::ElementNotFound {
                    target: "submit control".into(),
                    waited_ms: ctx.timing().peek_wait_ms,
                })?;
                info!(control = %target, "Submitting application via vision reference");
                exec.click(&target).await?;
            }
        }
        ctx.settle().await;
        ctx.capture("after-submit").await;

        let body = ctx.body_text().await?;
        let url = ctx.page.current_url().await?;
        let classification = classify_page(&body, &url, &ctx.config.portal);
        let permit = PermitNumberExtractor::extract(&body);
        info!(classification = classification.as_str(), permit = ?permit, "Submission result page");
        ctx.state.set(keys::SUBMIT_CLASSIFICATION, classification.as_str());

        match (classification, permit) {
            (SubmitClassification::RedirectedToPayment, permit) => {
                ctx.state.set(keys::PAYMENT_URL, url);
                if let Some(fee) = fee_text(&body) {
                    ctx.state.set(keys::FEE_TEXT, fee);
                }
                // Fee pages usually name the record being paid for
                if let Some(record) = permit {
                    ctx.state.set(keys::RECORD_NUMBER, record);
                }
                Ok(StepResult::advance(Step::AwaitingPayment))
            }
            (_, Some(permit)) => {
                ctx.state.set(keys::RECORD_URL, url);
                ctx.state.set(keys::RECORD_NUMBER, permit.clone());
                ctx.state.set(keys::PERMIT_NUMBER, permit);
                Ok(StepResult::advance(Step::Complete))
            }
            (classification, None) => {
                // Submitted but no number yet: park it instead of re-submitting
                if classification == SubmitClassification::Ambiguous {
                    warn!(url = %url, "Result page not recognized; parking as pending");
                }
                ctx.state.set(keys::RECORD_URL, url);
                Ok(StepResult::advance(Step::AwaitingPayment))
            }
        }
    }
}

/// After out-of-band payment: open the record and read the permit number
pub struct PostPayment;

impl PostPayment {
    /// Open `record` from the current page. Only that record counts; other
    /// numbers on a records list belong to other applications.
    async fn open_record(ctx: &StepContext<'_>, record: &str) -> Result<Option<String>, PortalError> {
        let exec = ctx.executor();
        let link = ElementRef::link(record);
        if exec.peek(&link).await?.is_some() {
            exec.click(&link).await?;
            ctx.settle().await;
            let detail = PermitNumberExtractor::extract(&ctx.body_text().await?);
            return Ok(Some(detail.unwrap_or_else(|| record.to_string())));
        }

        let body = ctx.body_text().await?;
        Ok(body.contains(record).then(|| record.to_string()))
    }

    /// Number on the records-list line for this property, if exactly one
    /// line mentions it
    fn match_address(body: &str, street: &str) -> Option<String> {
        let street = street.to_lowercase();
        let mut matches = body
            .lines()
            .filter(|line| line.to_lowercase().contains(&street))
            .filter_map(PermitNumberExtractor::extract);
        let first = matches.next()?;
        match matches.next() {
            None => Some(first),
            Some(other) => {
                warn!(first = %first, other = %other, "Several records match the property; not guessing");
                None
            }
        }
    }
}

#[async_trait]
impl StepHandler for PostPayment {
    fn step(&self) -> Step {
        Step::PostPayment
    }

    fn advance_control(&self) -> Option<ElementRef> {
        None
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let record_url = ctx.state.get(keys::RECORD_URL).map(String::from);
        let record = ctx.state.get(keys::RECORD_NUMBER).map(String::from);
        let on_record_page = record_url.is_some();
        let url = record_url.unwrap_or_else(|| ctx.config.portal.records_url());
        ctx.goto(&url).await?;
        ctx.settle().await;

        let permit = match &record {
            Some(record) => PostPayment::open_record(ctx, record).await?,
            None if on_record_page => PermitNumberExtractor::extract(&ctx.body_text().await?),
            None => {
                let street = ctx.request.property.search_text();
                PostPayment::match_address(&ctx.body_text().await?, &street)
            }
        };

        match permit {
            Some(permit) => {
                info!(permit = %permit, "Permit number captured");
                ctx.state.set(keys::PERMIT_NUMBER, permit);
                Ok(StepResult::advance(Step::Complete))
            }
            None => {
                ctx.capture("post-payment-missing-number").await;
                Err(PortalError::StepVerificationFailed {
                    step: Step::PostPayment,
                    expected: match record {
                        Some(record) => format!("record {} on the records page", record),
                        None => "permit number for this property on the records page".into(),
                    },
                })
            }
        }
    }
}
