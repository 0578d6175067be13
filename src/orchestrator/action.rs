//! Action descriptors and their executor
//!
//! An [`ActionDescriptor`] is the only form in which a UI action travels
//! between the vision model and the page. Model output is parsed into it
//! strictly; anything that looks like code is rejected rather than run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::browser::{BrowserError, ElementHandle, ElementInfo, ElementRef, PortalPage, TextMatch};
use crate::core::{PortalError, TimingPolicy};

/// Operation performed on a resolved element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementAction {
    Fill,
    Select,
    Check,
    Click,
}

impl ElementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementAction::Fill => "fill",
            ElementAction::Select => "select",
            ElementAction::Check => "check",
            ElementAction::Click => "click",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "fill" | "type" | "input" | "enter" => Some(ElementAction::Fill),
            "select" | "choose" => Some(ElementAction::Select),
            "check" | "tick" => Some(ElementAction::Check),
            "click" | "press" => Some(ElementAction::Click),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has no usable element reference")]
    MissingReference,

    #[error("unknown element action '{0}'")]
    UnknownAction(String),

    #[error("{action} on {target} is required but has no value")]
    MissingValue { target: String, action: String },

    #[error("selector looks like code and was rejected: {0}")]
    CodeLikeSelector(String),

    #[error("malformed descriptor: {0}")]
    Malformed(String),
}

/// Normalized unit of work against the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub target: ElementRef,
    pub action: ElementAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
}

impl ActionDescriptor {
    pub fn fill(target: ElementRef, value: impl Into<String>) -> Self {
        Self { target, action: ElementAction::Fill, value: Some(value.into()), required: true, current_value: None }
    }

    pub fn select(target: ElementRef, option: impl Into<String>) -> Self {
        Self { target, action: ElementAction::Select, value: Some(option.into()), required: true, current_value: None }
    }

    pub fn check(target: ElementRef) -> Self {
        Self { target, action: ElementAction::Check, value: None, required: true, current_value: None }
    }

    pub fn click(target: ElementRef) -> Self {
        Self { target, action: ElementAction::Click, value: None, required: true, current_value: None }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.target.name().trim().is_empty() {
            return Err(DescriptorError::MissingReference);
        }
        if let ElementRef::Selector { name } = &self.target {
            if looks_like_code(name) {
                return Err(DescriptorError::CodeLikeSelector(name.clone()));
            }
        }
        let needs_value = matches!(self.action, ElementAction::Fill | ElementAction::Select);
        let has_value = self.value.as_deref().is_some_and(|v| !v.trim().is_empty());
        if needs_value && self.required && !has_value {
            return Err(DescriptorError::MissingValue {
                target: self.target.to_string(),
                action: self.action.as_str().into(),
            });
        }
        Ok(())
    }

    /// Parse one field object from model output.
    ///
    /// Accepts either a tagged `"reference": {"kind": ..., "name": ...}` or
    /// flat candidate keys (`role`+`name`, `label`, `placeholder`, `text`,
    /// `selector`); with several candidates the most stable kind wins.
    pub fn from_model(raw: &Value) -> Result<Self, DescriptorError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| DescriptorError::Malformed("field is not an object".into()))?;

        let action_raw = obj
            .get("action")
            .or_else(|| obj.get("element_action"))
            .and_then(Value::as_str)
            .ok_or_else(|| DescriptorError::Malformed("missing action".into()))?;
        let action = ElementAction::parse(action_raw)
            .ok_or_else(|| DescriptorError::UnknownAction(action_raw.to_string()))?;

        let target = match obj.get("reference") {
            Some(reference) => reference_from_model(reference)?,
            None => reference_from_model(raw)?,
        };

        let text = |key: &str| -> Option<String> {
            match obj.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                Some(Value::Bool(b)) => Some(b.to_string()),
                _ => None,
            }
        };

        let descriptor = Self {
            target,
            action,
            value: text("value"),
            required: obj.get("required").and_then(Value::as_bool).unwrap_or(false),
            current_value: text("current_value"),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Parse a reference from either the tagged form or flat candidate keys
pub fn reference_from_model(raw: &Value) -> Result<ElementRef, DescriptorError> {
    if raw.get("kind").is_some() {
        let target: ElementRef =
            serde_json::from_value(raw.clone()).map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        if let ElementRef::Selector { name } = &target {
            if looks_like_code(name) {
                return Err(DescriptorError::CodeLikeSelector(name.clone()));
            }
        }
        return Ok(target);
    }

    let get = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    let mut candidates = Vec::new();
    if let (Some(role), Some(name)) = (get("role"), get("name")) {
        candidates.push(ElementRef::Role { role, name });
    }
    if let Some(name) = get("label") {
        candidates.push(ElementRef::Label { name });
    }
    if let Some(name) = get("placeholder") {
        candidates.push(ElementRef::Placeholder { name });
    }
    if let Some(name) = get("text") {
        candidates.push(ElementRef::Text { name });
    }
    if let Some(name) = get("selector") {
        if looks_like_code(&name) {
            if candidates.is_empty() {
                return Err(DescriptorError::CodeLikeSelector(name));
            }
        } else {
            candidates.push(ElementRef::Selector { name });
        }
    }
    from_candidates(candidates).ok_or(DescriptorError::MissingReference)
}

/// Pick the most stable reference among candidates
pub fn from_candidates(candidates: Vec<ElementRef>) -> Option<ElementRef> {
    candidates.into_iter().min_by_key(|c| c.kind())
}

/// Reject strings that are script rather than CSS
fn looks_like_code(selector: &str) -> bool {
    const MARKERS: [&str; 8] = ["=>", "page.", ";", "await ", "function", "document.", "eval(", "()"];
    MARKERS.iter().any(|m| selector.contains(m))
}

fn interaction_error(target: &ElementRef, action: &str, err: BrowserError) -> PortalError {
    match err {
        BrowserError::Intercepted(by) => PortalError::ElementNotInteractable {
            target: target.to_string(),
            action: action.into(),
            reason: format!("intercepted by {}", by),
        },
        BrowserError::NotInteractable { reason, .. } => PortalError::ElementNotInteractable {
            target: target.to_string(),
            action: action.into(),
            reason,
        },
        BrowserError::Stale(_) => PortalError::ElementNotInteractable {
            target: target.to_string(),
            action: action.into(),
            reason: "element was re-rendered".into(),
        },
        other => PortalError::Browser(other),
    }
}

/// Resolves references against the live page and performs actions
pub struct ActionExecutor<'a> {
    page: &'a dyn PortalPage,
    timing: &'a TimingPolicy,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(page: &'a dyn PortalPage, timing: &'a TimingPolicy) -> Self {
        Self { page, timing }
    }

    pub fn page(&self) -> &'a dyn PortalPage {
        self.page
    }

    pub fn timing(&self) -> &'a TimingPolicy {
        self.timing
    }

    /// One immediate lookup, exact name first then substring
    pub async fn try_find(&self, target: &ElementRef) -> Result<Option<ElementHandle>, PortalError> {
        if let Some(handle) = self.page.find(target, TextMatch::Exact).await? {
            return Ok(Some(handle));
        }
        Ok(self.page.find(target, TextMatch::Contains).await?)
    }

    /// Poll a single match mode until the reference resolves or `wait` passes
    pub async fn poll(
        &self,
        target: &ElementRef,
        matching: Option<TextMatch>,
        wait: Duration,
    ) -> Result<Option<ElementHandle>, PortalError> {
        let start = Instant::now();
        loop {
            let found = match matching {
                Some(m) => self.page.find(target, m).await?,
                None => self.try_find(target).await?,
            };
            if found.is_some() {
                return Ok(found);
            }
            if start.elapsed() >= wait {
                return Ok(None);
            }
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
    }

    /// Bounded wait for a reference; no fallback to other reference kinds
    pub async fn wait_for(&self, target: &ElementRef, wait: Duration) -> Result<ElementHandle, PortalError> {
        self.poll(target, None, wait).await?.ok_or_else(|| PortalError::ElementNotFound {
            target: target.to_string(),
            waited_ms: wait.as_millis() as u64,
        })
    }

    /// Short lookup for heuristics that expect misses
    pub async fn peek(&self, target: &ElementRef) -> Result<Option<ElementHandle>, PortalError> {
        self.poll(target, None, self.timing.peek_wait()).await
    }

    pub async fn inspect(&self, handle: &ElementHandle) -> Result<ElementInfo, PortalError> {
        Ok(self.page.inspect(handle).await?)
    }

    pub async fn execute(&self, descriptor: &ActionDescriptor) -> Result<(), PortalError> {
        descriptor.validate().map_err(|e| PortalError::ElementNotInteractable {
            target: descriptor.target.to_string(),
            action: descriptor.action.as_str().into(),
            reason: e.to_string(),
        })?;

        debug!(target = %descriptor.target, action = descriptor.action.as_str(), "Executing action");
        match (descriptor.action, descriptor.value.as_deref()) {
            (ElementAction::Fill, Some(value)) => self.fill(&descriptor.target, value).await,
            (ElementAction::Select, Some(option)) => self.select(&descriptor.target, option).await,
            (ElementAction::Fill | ElementAction::Select, None) => {
                debug!(target = %descriptor.target, "Optional field without value; skipped");
                Ok(())
            }
            (ElementAction::Check, value) => {
                let checked = !matches!(
                    value.map(|v| v.trim().to_lowercase()).as_deref(),
                    Some("false" | "no" | "unchecked" | "off")
                );
                self.set_checked(&descriptor.target, checked).await
            }
            (ElementAction::Click, _) => self.click(&descriptor.target).await,
        }
    }

    pub async fn fill(&self, target: &ElementRef, value: &str) -> Result<(), PortalError> {
        let handle = self.wait_for(target, self.timing.element_wait()).await?;
        let info = self.page.inspect(&handle).await?;
        if !info.editable {
            return Err(PortalError::ElementNotInteractable {
                target: target.to_string(),
                action: "fill".into(),
                reason: if info.enabled { "element is read-only".into() } else { "element is disabled".into() },
            });
        }
        self.page.fill(&handle, value).await.map_err(|e| interaction_error(target, "fill", e))
    }

    /// Clear and type key by key, for inputs that search as you type
    pub async fn type_into(&self, target: &ElementRef, text: &str) -> Result<(), PortalError> {
        let handle = self.wait_for(target, self.timing.element_wait()).await?;
        self.page.fill(&handle, "").await.map_err(|e| interaction_error(target, "type", e))?;
        self.page
            .type_text(&handle, text, self.timing.typing_delay_ms)
            .await
            .map_err(|e| interaction_error(target, "type", e))
    }

    /// Choose an option by visible text: exact match first, then substring
    pub async fn select(&self, target: &ElementRef, option: &str) -> Result<(), PortalError> {
        let handle = self.wait_for(target, self.timing.element_wait()).await?;
        let info = self.page.inspect(&handle).await?;

        if info.tag == "select" {
            for matching in [TextMatch::Exact, TextMatch::Contains] {
                if self
                    .page
                    .select_native(&handle, option, matching)
                    .await
                    .map_err(|e| interaction_error(target, "select", e))?
                {
                    return Ok(());
                }
            }
        } else {
            // Custom dropdown: open it and let the option list render
            self.page.click(&handle, false).await.map_err(|e| interaction_error(target, "open", e))?;
            tokio::time::sleep(self.timing.select_settle()).await;

            for matching in [TextMatch::Exact, TextMatch::Contains] {
                for candidate in [ElementRef::role("option", option), ElementRef::text(option)] {
                    if let Some(opt) = self.page.find(&candidate, matching).await? {
                        return self
                            .page
                            .click(&opt, false)
                            .await
                            .map_err(|e| interaction_error(&candidate, "select", e));
                    }
                }
            }
        }

        Err(PortalError::ElementNotFound {
            target: format!("option \"{}\" of {}", option, target),
            waited_ms: self.timing.select_settle_ms,
        })
    }

    /// Set a checkbox/radio, forcing it when an overlay intercepts the click
    pub async fn set_checked(&self, target: &ElementRef, checked: bool) -> Result<(), PortalError> {
        let handle = self.wait_for(target, self.timing.element_wait()).await?;
        let info = self.page.inspect(&handle).await?;
        if info.checked == checked {
            return Ok(());
        }
        match self.page.set_checked(&handle, checked, false).await {
            Ok(()) => Ok(()),
            Err(BrowserError::Intercepted(by)) => {
                warn!(target = %target, "Check intercepted by {}; forcing", by);
                self.page
                    .set_checked(&handle, checked, true)
                    .await
                    .map_err(|e| interaction_error(target, "check", e))
            }
            Err(e) => Err(interaction_error(target, "check", e)),
        }
    }

    pub async fn click(&self, target: &ElementRef) -> Result<(), PortalError> {
        let handle = self.wait_for(target, self.timing.element_wait()).await?;
        self.click_handle(target, &handle).await
    }

    pub async fn click_handle(&self, target: &ElementRef, handle: &ElementHandle) -> Result<(), PortalError> {
        self.page.click(handle, false).await.map_err(|e| interaction_error(target, "click", e))
    }

    /// Wait until the control is enabled; false when it stays disabled
    pub async fn wait_enabled(&self, target: &ElementRef, wait: Duration) -> Result<bool, PortalError> {
        let start = Instant::now();
        loop {
            if let Some(handle) = self.try_find(target).await? {
                if self.page.inspect(&handle).await?.enabled {
                    return Ok(true);
                }
            }
            if start.elapsed() >= wait {
                return Ok(false);
            }
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{Effect, FixtureElement, FixturePage, FixtureScreen};
    use serde_json::json;

    fn form_page() -> FixturePage {
        FixturePage::new(vec![FixtureScreen::new("form", "https://portal.test/form", "Work Items")
            .with(FixtureElement::input("Job Value"))
            .with(FixtureElement::input("Record Number").read_only())
            .with(FixtureElement::select("Type of Work", &["Replace Furnace", "Replace Furnace and Air Conditioner"]))
            .with(FixtureElement::checkbox("I agree").intercepted())
            .with(FixtureElement::button("Continue Application »").on_click(Effect::AppendText("clicked".into())))
            .with(FixtureElement::new("combobox", "Fuel Type").labeled("Fuel Type").tag("div"))
            .with(FixtureElement::new("option", "Natural Gas"))
            .with(FixtureElement::new("option", "Propane"))])
    }

    #[test]
    fn test_parse_flat_candidates_prefers_role() {
        let raw = json!({
            "action": "fill", "value": "8450.00", "required": true,
            "role": "textbox", "name": "Job Value", "label": "Job Value", "selector": "#ctl00_JobValue"
        });
        let d = ActionDescriptor::from_model(&raw).unwrap();
        assert_eq!(d.target, ElementRef::role("textbox", "Job Value"));
        assert_eq!(d.value.as_deref(), Some("8450.00"));

        let raw = json!({"action": "click", "text": "Continue", "selector": "a.btn"});
        assert_eq!(ActionDescriptor::from_model(&raw).unwrap().target, ElementRef::text("Continue"));
    }

    #[test]
    fn test_parse_rejects_code_and_missing_values() {
        let code = json!({"action": "click", "selector": "page.locator('#x').click();"});
        assert!(matches!(ActionDescriptor::from_model(&code), Err(DescriptorError::CodeLikeSelector(_))));

        let tagged = json!({"action": "click", "reference": {"kind": "selector", "name": "() => document.body"}});
        assert!(matches!(ActionDescriptor::from_model(&tagged), Err(DescriptorError::CodeLikeSelector(_))));

        let no_value = json!({"action": "fill", "label": "Job Value", "required": true});
        assert!(matches!(ActionDescriptor::from_model(&no_value), Err(DescriptorError::MissingValue { .. })));

        let unknown = json!({"action": "hover", "label": "Job Value"});
        assert!(matches!(ActionDescriptor::from_model(&unknown), Err(DescriptorError::UnknownAction(_))));

        let optional = json!({"action": "fill", "label": "Notes", "required": false});
        assert!(ActionDescriptor::from_model(&optional).is_ok());
    }

    #[test]
    fn test_numeric_values_are_stringified() {
        let raw = json!({"action": "fill", "label": "Tonnage", "value": 3, "required": true});
        assert_eq!(ActionDescriptor::from_model(&raw).unwrap().value.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_role_miss_is_element_not_found() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        // A label "Job Value" exists, but a role lookup must not fall back to it
        let err = exec
            .execute(&ActionDescriptor::fill(ElementRef::role("spinbutton", "Job Value"), "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::ElementNotFound { .. }));
        assert!(page.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_fill_and_read_only() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        exec.fill(&ElementRef::label("Job Value"), "8450.00").await.unwrap();
        assert_eq!(page.value_of("Job Value").as_deref(), Some("8450.00"));

        let err = exec.fill(&ElementRef::label("Record Number"), "x").await.unwrap_err();
        assert!(matches!(err, PortalError::ElementNotInteractable { .. }));
    }

    #[tokio::test]
    async fn test_select_exact_before_partial() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        exec.select(&ElementRef::label("Type of Work"), "Replace Furnace").await.unwrap();
        assert_eq!(page.value_of("Type of Work").as_deref(), Some("Replace Furnace"));

        exec.select(&ElementRef::label("Type of Work"), "Air Conditioner").await.unwrap();
        assert_eq!(page.value_of("Type of Work").as_deref(), Some("Replace Furnace and Air Conditioner"));

        let err = exec.select(&ElementRef::label("Type of Work"), "Geothermal").await.unwrap_err();
        assert!(matches!(err, PortalError::ElementNotFound { .. }));
    }

    #[tokio::test]
    async fn test_custom_dropdown_opens_then_picks_option() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        exec.select(&ElementRef::label("Fuel Type"), "Gas").await.unwrap();
        let mutations = page.mutations();
        assert_eq!(mutations, vec!["click combobox:Fuel Type", "click option:Natural Gas"]);
    }

    #[tokio::test]
    async fn test_check_forces_through_overlay() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        exec.execute(&ActionDescriptor::check(ElementRef::label("I agree"))).await.unwrap();
        assert_eq!(page.mutations(), vec!["check checkbox:I agree=true (forced)"]);
    }

    #[tokio::test]
    async fn test_click_matches_partial_name() {
        let page = form_page();
        let timing = TimingPolicy::fast();
        let exec = ActionExecutor::new(&page, &timing);

        exec.click(&ElementRef::button("Continue Application")).await.unwrap();
        assert!(page.body_text().await.unwrap().contains("clicked"));
    }
}
