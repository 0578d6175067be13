//! Scripted wizard steps 0-6
//!
//! These pages are stable, so each handler is a fixed sequence of typed
//! references. The address step is the one exception to "structured
//! references first": its result rows are re-rendered under a third-party
//! guidance overlay, so the first row is clicked by coordinates.

use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{StepContext, StepHandler};
use crate::browser::{BrowserError, ElementRef};
use crate::core::{keys, PortalError, Step, StepResult};

pub struct StartApplication;

#[async_trait]
impl StepHandler for StartApplication {
    fn step(&self) -> Step {
        Step::StartApplication
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let portal = &ctx.config.portal;
        ctx.goto(&portal.start_url()).await?;
        ctx.settle().await;

        let body = ctx.body_text().await?.to_lowercase();
        let url = ctx.page.current_url().await?.to_lowercase();
        if url.contains("login") || portal.login_markers.iter().any(|m| body.contains(&m.to_lowercase())) {
            return Err(PortalError::SessionExpired(format!("login page shown at {}", url)));
        }

        let exec = ctx.executor();
        exec.click(&ElementRef::link("Create an Application")).await?;
        ctx.settle().await;

        exec.set_checked(&ElementRef::label("I have read and accepted the above terms"), true).await?;
        ctx.advance(self.step()).await
    }
}

pub struct PermitType;

#[async_trait]
impl StepHandler for PermitType {
    fn step(&self) -> Step {
        Step::PermitType
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        exec.set_checked(&ElementRef::label(&ctx.config.portal.record_type), true).await?;
        ctx.advance(self.step()).await
    }
}

pub struct Address;

impl Address {
    fn search_box() -> ElementRef {
        ElementRef::label("Property Address")
    }

    /// Removes the guidance overlay nodes and stubs its globals
    fn overlay_cleanup_script(selectors: &[String], globals: &[String]) -> String {
        let selectors = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
        let globals = serde_json::to_string(globals).unwrap_or_else(|_| "[]".into());
        format!(
            r#"// guidance overlay cleanup
(() => {{
  for (const sel of {selectors}) {{
    document.querySelectorAll(sel).forEach(el => el.remove());
  }}
  for (const name of {globals}) {{
    try {{
      const g = window[name];
      if (g && typeof g === 'object') {{
        for (const k of Object.keys(g)) {{ if (typeof g[k] === 'function') g[k] = () => {{}}; }}
      }}
      window[name] = undefined;
    }} catch (e) {{}}
  }}
  return true;
}})()"#
        )
    }
}

#[async_trait]
impl StepHandler for Address {
    fn step(&self) -> Step {
        Step::Address
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let timing = ctx.timing();
        let portal = &ctx.config.portal;
        let property = &ctx.request.property;

        // The autocomplete matches poorly on full addresses
        exec.type_into(&Address::search_box(), &property.search_text()).await?;

        let rows = ElementRef::selector(&portal.address_result_selector);
        let row = exec.wait_for(&rows, timing.element_wait()).await?;
        ctx.settle().await;

        let script = Address::overlay_cleanup_script(&portal.guidance_overlay_selectors, &portal.guidance_globals);
        if let Err(e) = ctx.page.evaluate(&script).await {
            warn!("Guidance overlay cleanup failed: {}", e);
        }

        let info = match exec.inspect(&row).await {
            Ok(info) => info,
            // Overlay cleanup can re-render the list
            Err(PortalError::Browser(BrowserError::Stale(_))) => {
                let fresh = exec.wait_for(&rows, timing.element_wait()).await?;
                exec.inspect(&fresh).await?
            }
            Err(e) => return Err(e),
        };
        let bounds = info.bounds.ok_or_else(|| PortalError::ElementNotInteractable {
            target: rows.to_string(),
            action: "click".into(),
            reason: "result row has no layout box".into(),
        })?;

        let (x, y) = (bounds.x + (bounds.width / 2.0).min(20.0), bounds.y + bounds.height / 2.0);
        debug!(x, y, "Clicking first address candidate");
        ctx.page.click_at(x, y).await.map_err(|e| PortalError::ElementNotInteractable {
            target: rows.to_string(),
            action: "click".into(),
            reason: e.to_string(),
        })?;
        ctx.settle().await;

        // Selection must show up in the page before advancing
        let number = property.street_number.trim().to_lowercase();
        let street = property.street_name.trim().to_lowercase();
        let street_word = street.split_whitespace().next().unwrap_or_default().to_string();
        let confirmed = ctx
            .wait_until(timing.element_wait(), |body| {
                let body = body.to_lowercase();
                body.contains("selected") && body.contains(&number) && body.contains(&street_word)
            })
            .await?;
        if !confirmed {
            return Err(PortalError::StepVerificationFailed {
                step: Step::Address,
                expected: format!("address {} selected", property.search_text()),
            });
        }

        info!(address = %property, "Address selected");
        ctx.state.set(keys::SELECTED_ADDRESS, property.to_string());
        ctx.advance(self.step()).await
    }
}

pub struct Contractor;

#[async_trait]
impl StepHandler for Contractor {
    fn step(&self) -> Step {
        Step::Contractor
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let contractor = &ctx.request.contractor;

        exec.select(&ElementRef::label("License Type"), &contractor.license_type).await?;
        exec.fill(&ElementRef::label("License Number"), &contractor.license_number).await?;
        exec.click(&ElementRef::button("Look Up")).await?;
        ctx.settle().await;

        // The lookup fills the company block; a miss here is not fatal
        let company = contractor.company_name.to_lowercase();
        let start = Instant::now();
        let found = ctx
            .wait_until(ctx.timing().peek_wait(), |body| body.to_lowercase().contains(&company))
            .await?;
        if !found {
            warn!(
                license = %contractor.license_number,
                waited_ms = start.elapsed().as_millis() as u64,
                "License lookup did not show the company name"
            );
        }

        ctx.advance(self.step()).await
    }
}

pub struct Applicant;

#[async_trait]
impl StepHandler for Applicant {
    fn step(&self) -> Step {
        Step::Applicant
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let contractor = &ctx.request.contractor;

        exec.fill(&ElementRef::label("Contact Name"), &contractor.contact_name).await?;
        exec.fill(&ElementRef::label("Phone Number"), &contractor.phone).await?;
        exec.fill(&ElementRef::label("Email Address"), &contractor.email).await?;
        ctx.advance(self.step()).await
    }
}

pub struct ProjectScope;

#[async_trait]
impl StepHandler for ProjectScope {
    fn step(&self) -> Step {
        Step::ProjectScope
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let request = ctx.request;

        exec.select(&ElementRef::label("Type of Work"), request.installation_type.portal_label())
            .await?;
        ctx.settle().await;
        exec.fill(&ElementRef::label("Project Description"), &request.description()).await?;
        ctx.advance(self.step()).await
    }
}

pub struct Equipment;

#[async_trait]
impl StepHandler for Equipment {
    fn step(&self) -> Step {
        Step::Equipment
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepResult, PortalError> {
        let exec = ctx.executor();
        let request = ctx.request;
        let equipment = &request.equipment;

        exec.fill(&ElementRef::label("Manufacturer"), &equipment.manufacturer).await?;
        exec.fill(&ElementRef::label("Model Number"), &equipment.model_number).await?;
        exec.fill(&ElementRef::label("Tonnage"), &request.tonnage_text()).await?;

        // Optional on the request and not present on every portal variant
        let optional = [
            ("Serial Number", equipment.serial_number.clone()),
            ("BTU Rating", equipment.btu_rating.map(|b| b.to_string())),
        ];
        for (label, value) in optional {
            let Some(value) = value else { continue };
            let target = ElementRef::label(label);
            if exec.peek(&target).await?.is_some() {
                exec.fill(&target, &value).await?;
            } else {
                debug!(field = label, "Optional equipment field not on page");
            }
        }
        if let Some(fuel) = &equipment.fuel_type {
            let target = ElementRef::label("Fuel Type");
            if exec.peek(&target).await?.is_some() {
                exec.select(&target, fuel).await?;
            }
        }

        ctx.advance(self.step()).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::browser::fixture::{Effect, FixtureElement, FixturePage, FixtureScreen};
    use crate::orchestrator::vision::StaticAnalyzer;

    fn next_screen() -> FixtureScreen {
        FixtureScreen::new("next", "https://portal.test/next", "Next page")
    }

    fn continue_btn() -> FixtureElement {
        FixtureElement::button("Continue Application »").on_click(Effect::Advance)
    }

    #[tokio::test]
    async fn test_start_detects_expired_session() {
        let page = FixturePage::new(vec![FixtureScreen::new(
            "login",
            "https://aca-prod.accela.com/OAKDALE/Cap/CapHome.aspx?module=Building",
            "Login to your account",
        )]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let mut ctx = harness.ctx(&page);
        let err = StartApplication.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PortalError::SessionExpired(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_start_accepts_terms_through_overlay() {
        let page = FixturePage::new(vec![
            FixtureScreen::new(
                "home",
                "https://aca-prod.accela.com/OAKDALE/Cap/CapHome.aspx?module=Building",
                "Building Permits",
            )
            .with(FixtureElement::link("Create an Application").on_click(Effect::Advance)),
            FixtureScreen::new("terms", "https://portal.test/terms", "General Disclaimer")
                .with(FixtureElement::checkbox("I have read and accepted the above terms").intercepted())
                .with(continue_btn()),
            next_screen(),
        ]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let mut ctx = harness.ctx(&page);
        let result = StartApplication.run(&mut ctx).await.unwrap();
        assert_eq!(result, StepResult::advance(Step::PermitType));
        assert_eq!(page.current_screen(), "next");
        assert!(page.actions().iter().any(|a| a.contains("(forced)")));
    }

    #[tokio::test]
    async fn test_address_clears_overlay_and_clicks_first_row() {
        let page = FixturePage::new(vec![
            FixtureScreen::new("address", "https://portal.test/address", "Property Address")
                .with(FixtureElement::input("Property Address").on_input(Effect::Reveal("results".into())).on_input(
                    Effect::ShowOverlay("pendo-guide".into()),
                ))
                .with(
                    FixtureElement::new("option", "1420 PALM RIDGE DR, OAKDALE FL 33410")
                        .selector(".address-search-results .result-row")
                        .hidden_in("results")
                        .at(100.0, 300.0, 400.0, 30.0)
                        .on_click(Effect::AppendText("Selected: 1420 PALM RIDGE DR".into())),
                )
                .with(continue_btn()),
            next_screen(),
        ])
        .on_script("guidance overlay cleanup", vec![Effect::ClearOverlay]);

        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let result = {
            let mut ctx = harness.ctx(&page);
            Address.run(&mut ctx).await.unwrap()
        };
        assert_eq!(result.next_step, Step::Contractor);
        assert!(!page.overlay_active());
        let actions = page.actions();
        assert!(actions.contains(&"click_at 120,315".to_string()));
        assert!(actions.contains(&"hit option:1420 PALM RIDGE DR, OAKDALE FL 33410".to_string()));
        assert!(harness.state.get(keys::SELECTED_ADDRESS).is_some());
    }

    #[tokio::test]
    async fn test_address_without_confirmation_fails_verification() {
        let page = FixturePage::new(vec![FixtureScreen::new("address", "https://portal.test/address", "Property Address")
            .with(FixtureElement::input("Property Address").on_input(Effect::Reveal("results".into())))
            .with(
                FixtureElement::new("option", "No match")
                    .selector(".address-search-results .result-row")
                    .hidden_in("results")
                    .at(0.0, 0.0, 100.0, 20.0),
            )]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let mut ctx = harness.ctx(&page);
        let err = Address.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PortalError::StepVerificationFailed { step: Step::Address, .. }));
    }

    #[tokio::test]
    async fn test_equipment_skips_absent_optional_fields() {
        let page = FixturePage::new(vec![
            FixtureScreen::new("equipment", "https://portal.test/equipment", "Equipment Information")
                .with(FixtureElement::input("Manufacturer"))
                .with(FixtureElement::input("Model Number"))
                .with(FixtureElement::input("Tonnage"))
                .with(FixtureElement::input("Serial Number"))
                .with(continue_btn()),
            next_screen(),
        ]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let mut ctx = harness.ctx(&page);
        Equipment.run(&mut ctx).await.unwrap();
        assert_eq!(page.value_of("Tonnage").as_deref(), Some("3"));
        assert_eq!(page.value_of("Serial Number").as_deref(), Some("2519E12345"));
        assert!(!page.mutations().iter().any(|m| m.contains("BTU")));
    }

    #[tokio::test]
    async fn test_project_scope_uses_portal_label() {
        let page = FixturePage::new(vec![
            FixtureScreen::new("scope", "https://portal.test/scope", "Project Description")
                .with(FixtureElement::select(
                    "Type of Work",
                    &["Replace Air Conditioner", "Replace Furnace and Air Conditioner"],
                ))
                .with(FixtureElement::input("Project Description"))
                .with(continue_btn()),
            next_screen(),
        ]);
        let mut harness = Harness::new(StaticAnalyzer::disabled());
        let mut ctx = harness.ctx(&page);
        ProjectScope.run(&mut ctx).await.unwrap();
        assert_eq!(page.value_of("Type of Work").as_deref(), Some("Replace Furnace and Air Conditioner"));
        assert!(page.value_of("Project Description").unwrap().starts_with("Like-for-like"));
    }
}
