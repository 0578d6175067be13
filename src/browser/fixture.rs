//! Scripted in-memory portal
//!
//! `FixturePage` models the portal as a list of screens. Each screen has body
//! text and elements; clicking or typing into an element can trigger
//! [`Effect`]s (advance to the next screen, reveal an autocomplete list,
//! enable a button, ...). Overlays that swallow clicks and busy indicators
//! that stay up for a number of polls are modeled too, which is enough to
//! drive every step handler without a browser.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    BrowserError, BrowserResult, ElementHandle, ElementInfo, ElementRef, PortalPage, PortalSession, Rect,
    SessionFactory, TextMatch,
};

/// Side effect of interacting with a fixture element
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Move to the next screen
    Advance,
    /// Jump to a screen by name
    GoTo(String),
    /// Show elements of a group on the current screen
    Reveal(String),
    Hide(String),
    AppendText(String),
    /// Enable elements with this name on the current screen
    Enable(String),
    /// Put up an overlay that swallows unforced clicks
    ShowOverlay(String),
    /// Remove the click-swallowing overlay
    ClearOverlay,
    /// Show a busy indicator for a number of polls
    Busy { selector: String, polls: u32 },
    /// Set the value of the element with this label
    SetValue { label: String, value: String },
}

#[derive(Debug, Clone)]
pub struct FixtureElement {
    pub role: String,
    pub name: String,
    pub label: Option<String>,
    pub placeholder: Option<String>,
    pub selector: Option<String>,
    pub tag: String,
    pub enabled: bool,
    pub editable: bool,
    pub visible: bool,
    pub checked: bool,
    /// Normal clicks hit an overlay; only forced interaction works
    pub intercepted: bool,
    pub value: String,
    pub options: Vec<String>,
    pub bounds: Rect,
    pub group: Option<String>,
    pub on_click: Vec<Effect>,
    pub on_input: Vec<Effect>,
}

impl FixtureElement {
    pub fn new(role: &str, name: &str) -> Self {
        let tag = match role {
            "button" => "button",
            "link" => "a",
            "textbox" | "checkbox" | "radio" => "input",
            "combobox" => "select",
            _ => "div",
        };
        let editable = role == "textbox";
        Self {
            role: role.into(),
            name: name.into(),
            label: None,
            placeholder: None,
            selector: None,
            tag: tag.into(),
            enabled: true,
            editable,
            visible: true,
            checked: false,
            intercepted: false,
            value: String::new(),
            options: vec![],
            bounds: Rect::new(0.0, 0.0, 0.0, 0.0),
            group: None,
            on_click: vec![],
            on_input: vec![],
        }
    }

    pub fn button(name: &str) -> Self {
        Self::new("button", name)
    }

    pub fn link(name: &str) -> Self {
        Self::new("link", name)
    }

    /// Text input bound to a `<label>`
    pub fn input(label: &str) -> Self {
        Self::new("textbox", label).labeled(label)
    }

    pub fn checkbox(label: &str) -> Self {
        Self::new("checkbox", label).labeled(label)
    }

    pub fn radio(label: &str) -> Self {
        Self::new("radio", label).labeled(label)
    }

    /// Native `<select>` with options
    pub fn select(label: &str, options: &[&str]) -> Self {
        let mut el = Self::new("combobox", label).labeled(label);
        el.options = options.iter().map(|o| o.to_string()).collect();
        el
    }

    pub fn labeled(mut self, label: &str) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn placeholder(mut self, text: &str) -> Self {
        self.placeholder = Some(text.into());
        self
    }

    pub fn selector(mut self, css: &str) -> Self {
        self.selector = Some(css.into());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.editable = false;
        self
    }

    pub fn intercepted(mut self) -> Self {
        self.intercepted = true;
        self
    }

    /// Hidden until an effect reveals `group`
    pub fn hidden_in(mut self, group: &str) -> Self {
        self.group = Some(group.into());
        self.visible = false;
        self
    }

    pub fn at(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.bounds = Rect::new(x, y, width, height);
        self
    }

    pub fn on_click(mut self, effect: Effect) -> Self {
        self.on_click.push(effect);
        self
    }

    pub fn on_input(mut self, effect: Effect) -> Self {
        self.on_input.push(effect);
        self
    }

    fn matches(&self, target: &ElementRef, matching: TextMatch) -> bool {
        match target {
            ElementRef::Role { role, name } => {
                self.role.eq_ignore_ascii_case(role) && matching.matches(&self.name, name)
            }
            ElementRef::Label { name } => self.label.as_deref().is_some_and(|l| matching.matches(l, name)),
            ElementRef::Text { name } => matching.matches(&self.name, name),
            ElementRef::Placeholder { name } => {
                self.placeholder.as_deref().is_some_and(|p| matching.matches(p, name))
            }
            ElementRef::Selector { name } => self.selector.as_deref() == Some(name.trim()),
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.role, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct FixtureScreen {
    pub name: String,
    pub url: String,
    pub text: String,
    pub elements: Vec<FixtureElement>,
}

impl FixtureScreen {
    pub fn new(name: &str, url: &str, text: &str) -> Self {
        Self { name: name.into(), url: url.into(), text: text.into(), elements: vec![] }
    }

    pub fn with(mut self, element: FixtureElement) -> Self {
        self.elements.push(element);
        self
    }
}

#[derive(Debug, Default)]
struct FixtureState {
    screens: Vec<FixtureScreen>,
    current: usize,
    overlay: Option<String>,
    busy: HashMap<String, u32>,
    script_hooks: Vec<(String, Vec<Effect>)>,
    routes: Vec<(String, String)>,
    actions: Vec<String>,
    screenshots: usize,
}

impl FixtureState {
    fn screen(&self) -> BrowserResult<&FixtureScreen> {
        self.screens
            .get(self.current)
            .ok_or_else(|| BrowserError::Driver("fixture has no screens".into()))
    }

    fn element_mut(&mut self, handle: &ElementHandle) -> BrowserResult<&mut FixtureElement> {
        let (screen, index) = parse_handle(handle)?;
        if screen != self.current {
            return Err(BrowserError::Stale(handle.0.clone()));
        }
        self.screens
            .get_mut(screen)
            .and_then(|s| s.elements.get_mut(index))
            .ok_or_else(|| BrowserError::Stale(handle.0.clone()))
    }

    fn screen_index(&self, name: &str) -> Option<usize> {
        self.screens.iter().position(|s| s.name == name)
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Advance => {
                    if self.current + 1 < self.screens.len() {
                        self.current += 1;
                    }
                }
                Effect::GoTo(name) => {
                    if let Some(idx) = self.screen_index(&name) {
                        self.current = idx;
                    }
                }
                Effect::Reveal(group) => self.set_group_visible(&group, true),
                Effect::Hide(group) => self.set_group_visible(&group, false),
                Effect::AppendText(text) => {
                    if let Some(screen) = self.screens.get_mut(self.current) {
                        screen.text.push('\n');
                        screen.text.push_str(&text);
                    }
                }
                Effect::Enable(name) => {
                    if let Some(screen) = self.screens.get_mut(self.current) {
                        for el in screen.elements.iter_mut().filter(|e| e.name == name) {
                            el.enabled = true;
                        }
                    }
                }
                Effect::ShowOverlay(name) => self.overlay = Some(name),
                Effect::ClearOverlay => self.overlay = None,
                Effect::Busy { selector, polls } => {
                    self.busy.insert(selector, polls);
                }
                Effect::SetValue { label, value } => {
                    if let Some(screen) = self.screens.get_mut(self.current) {
                        for el in screen.elements.iter_mut().filter(|e| e.label.as_deref() == Some(label.as_str())) {
                            el.value = value.clone();
                        }
                    }
                }
            }
        }
    }

    fn set_group_visible(&mut self, group: &str, visible: bool) {
        if let Some(screen) = self.screens.get_mut(self.current) {
            for el in screen.elements.iter_mut().filter(|e| e.group.as_deref() == Some(group)) {
                el.visible = visible;
            }
        }
    }

    fn check_clickable(&self, el: &FixtureElement, action: &str, force: bool) -> BrowserResult<()> {
        if !el.enabled {
            return Err(BrowserError::NotInteractable { action: action.into(), reason: "element is disabled".into() });
        }
        if !force {
            if let Some(overlay) = &self.overlay {
                return Err(BrowserError::Intercepted(overlay.clone()));
            }
            if el.intercepted {
                return Err(BrowserError::Intercepted(format!("layer above {}", el.describe())));
            }
        }
        Ok(())
    }
}

fn parse_handle(handle: &ElementHandle) -> BrowserResult<(usize, usize)> {
    let mut parts = handle.0.splitn(2, '#');
    let screen = parts.next().and_then(|s| s.parse().ok());
    let index = parts.next().and_then(|s| s.parse().ok());
    match (screen, index) {
        (Some(s), Some(i)) => Ok((s, i)),
        _ => Err(BrowserError::Stale(handle.0.clone())),
    }
}

/// In-memory `PortalPage`
#[derive(Debug, Default)]
pub struct FixturePage {
    state: Mutex<FixtureState>,
}

impl FixturePage {
    pub fn new(screens: Vec<FixtureScreen>) -> Self {
        Self { state: Mutex::new(FixtureState { screens, ..Default::default() }) }
    }

    /// Overlay that intercepts every unforced click until cleared
    pub fn with_overlay(self, name: &str) -> Self {
        self.lock().overlay = Some(name.into());
        self
    }

    pub fn with_busy(self, selector: &str, polls: u32) -> Self {
        self.lock().busy.insert(selector.into(), polls);
        self
    }

    /// Run effects when an evaluated script contains `fragment`
    pub fn on_script(self, fragment: &str, effects: Vec<Effect>) -> Self {
        self.lock().script_hooks.push((fragment.into(), effects));
        self
    }

    /// `goto` on a URL containing `fragment` lands on `screen`
    pub fn route(self, fragment: &str, screen: &str) -> Self {
        self.lock().routes.push((fragment.into(), screen.into()));
        self
    }

    /// Human-readable log of every interaction, in order
    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    /// Interactions that change the page (fills, clicks, checks, selects)
    pub fn mutations(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|a| {
                ["fill ", "type ", "click ", "check ", "select ", "click_at "]
                    .iter()
                    .any(|p| a.starts_with(p))
            })
            .collect()
    }

    pub fn current_screen(&self) -> String {
        let state = self.lock();
        state.screens.get(state.current).map(|s| s.name.clone()).unwrap_or_default()
    }

    pub fn screenshots_taken(&self) -> usize {
        self.lock().screenshots
    }

    pub fn overlay_active(&self) -> bool {
        self.lock().overlay.is_some()
    }

    /// Value currently held by the element with this label
    pub fn value_of(&self, label: &str) -> Option<String> {
        let state = self.lock();
        state
            .screens
            .iter()
            .flat_map(|s| s.elements.iter())
            .find(|e| e.label.as_deref() == Some(label))
            .map(|e| e.value.clone())
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PortalPage for FixturePage {
    async fn goto(&self, url: &str, _timeout_ms: u64) -> BrowserResult<()> {
        let mut state = self.lock();
        state.actions.push(format!("goto {}", url));
        let routed = state
            .routes
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, screen)| screen.clone());
        let target = match routed {
            Some(name) => state.screen_index(&name),
            None => state.screens.iter().position(|s| s.url == url),
        };
        match target {
            Some(idx) => {
                state.current = idx;
                Ok(())
            }
            None => Err(BrowserError::NavigationTimeout(url.into())),
        }
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.lock().screen()?.url.clone())
    }

    async fn find(&self, target: &ElementRef, matching: TextMatch) -> BrowserResult<Option<ElementHandle>> {
        let state = self.lock();
        let current = state.current;
        let screen = state.screen()?;
        Ok(screen
            .elements
            .iter()
            .position(|el| el.visible && el.matches(target, matching))
            .map(|idx| ElementHandle(format!("{}#{}", current, idx))))
    }

    async fn inspect(&self, element: &ElementHandle) -> BrowserResult<ElementInfo> {
        let mut state = self.lock();
        let el = state.element_mut(element)?;
        Ok(ElementInfo {
            tag: el.tag.clone(),
            enabled: el.enabled,
            editable: el.editable && el.enabled,
            checked: el.checked,
            value: el.value.clone(),
            bounds: Some(el.bounds),
        })
    }

    async fn fill(&self, element: &ElementHandle, value: &str) -> BrowserResult<()> {
        let mut state = self.lock();
        let el = state.element_mut(element)?;
        if !el.editable || !el.enabled {
            return Err(BrowserError::NotInteractable { action: "fill".into(), reason: "element is not editable".into() });
        }
        el.value = value.to_string();
        let effects = el.on_input.clone();
        let entry = format!("fill {}={}", el.describe(), value);
        state.actions.push(entry);
        state.apply(effects);
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str, _delay_ms: u64) -> BrowserResult<()> {
        let mut state = self.lock();
        let el = state.element_mut(element)?;
        if !el.editable || !el.enabled {
            return Err(BrowserError::NotInteractable { action: "type".into(), reason: "element is not editable".into() });
        }
        el.value.push_str(text);
        let effects = el.on_input.clone();
        let entry = format!("type {}={}", el.describe(), text);
        state.actions.push(entry);
        state.apply(effects);
        Ok(())
    }

    async fn click(&self, element: &ElementHandle, force: bool) -> BrowserResult<()> {
        let mut state = self.lock();
        let el = state.element_mut(element)?.clone();
        state.check_clickable(&el, "click", force)?;
        let toggles = matches!(el.role.as_str(), "checkbox" | "radio");
        if toggles {
            let target = state.element_mut(element)?;
            target.checked = el.role == "radio" || !target.checked;
        }
        state.actions.push(format!("click {}{}", el.describe(), if force { " (forced)" } else { "" }));
        state.apply(el.on_click);
        Ok(())
    }

    async fn set_checked(&self, element: &ElementHandle, checked: bool, force: bool) -> BrowserResult<()> {
        let mut state = self.lock();
        let el = state.element_mut(element)?.clone();
        if !matches!(el.role.as_str(), "checkbox" | "radio") {
            return Err(BrowserError::NotInteractable { action: "check".into(), reason: format!("{} is not checkable", el.role) });
        }
        state.check_clickable(&el, "check", force)?;
        state.element_mut(element)?.checked = checked;
        state.actions.push(format!("check {}={}{}", el.describe(), checked, if force { " (forced)" } else { "" }));
        if el.checked != checked {
            state.apply(el.on_click);
        }
        Ok(())
    }

    async fn select_native(&self, element: &ElementHandle, option: &str, matching: TextMatch) -> BrowserResult<bool> {
        let mut state = self.lock();
        let el = state.element_mut(element)?;
        if el.tag != "select" {
            return Err(BrowserError::NotInteractable { action: "select".into(), reason: "not a native select".into() });
        }
        if !el.enabled {
            return Err(BrowserError::NotInteractable { action: "select".into(), reason: "element is disabled".into() });
        }
        let Some(chosen) = el.options.iter().find(|o| matching.matches(o, option)).cloned() else {
            return Ok(false);
        };
        el.value = chosen.clone();
        let effects = el.on_input.clone();
        let entry = format!("select {}={}", el.describe(), chosen);
        state.actions.push(entry);
        state.apply(effects);
        Ok(true)
    }

    async fn click_at(&self, x: f64, y: f64) -> BrowserResult<()> {
        let mut state = self.lock();
        if let Some(overlay) = &state.overlay {
            return Err(BrowserError::Intercepted(overlay.clone()));
        }
        let current = state.current;
        let hit = state.screen()?.elements.iter().position(|el| el.visible && el.bounds.contains(x, y));
        state.actions.push(format!("click_at {:.0},{:.0}", x, y));
        if let Some(idx) = hit {
            let effects = state.screens[current].elements[idx].on_click.clone();
            let entry = format!("hit {}", state.screens[current].elements[idx].describe());
            state.actions.push(entry);
            state.apply(effects);
        }
        Ok(())
    }

    async fn press(&self, key: &str) -> BrowserResult<()> {
        self.lock().actions.push(format!("press {}", key));
        Ok(())
    }

    async fn is_visible(&self, selector: &str) -> BrowserResult<bool> {
        let mut state = self.lock();
        if let Some(remaining) = state.busy.get_mut(selector) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(true);
            }
        }
        Ok(state
            .screen()?
            .elements
            .iter()
            .any(|el| el.visible && el.selector.as_deref() == Some(selector)))
    }

    async fn body_text(&self) -> BrowserResult<String> {
        let state = self.lock();
        let screen = state.screen()?;
        let mut text = screen.text.clone();
        for el in screen.elements.iter().filter(|e| e.visible) {
            text.push('\n');
            text.push_str(&el.name);
        }
        Ok(text)
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let mut state = self.lock();
        state.screenshots += 1;
        Ok(b"\x89PNG\r\n\x1a\nfixture".to_vec())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value> {
        let mut state = self.lock();
        let first_line = script.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default().to_string();
        state.actions.push(format!("evaluate {}", first_line));
        let effects: Vec<Effect> = state
            .script_hooks
            .iter()
            .filter(|(fragment, _)| script.contains(fragment.as_str()))
            .flat_map(|(_, effects)| effects.clone())
            .collect();
        state.apply(effects);
        Ok(serde_json::Value::Null)
    }
}

/// Session over a shared fixture page
pub struct FixtureSession {
    page: Arc<FixturePage>,
}

#[async_trait]
impl PortalSession for FixtureSession {
    fn page(&self) -> &dyn PortalPage {
        self.page.as_ref()
    }

    async fn close(&self) -> BrowserResult<()> {
        Ok(())
    }
}

/// Hands out sessions built by a closure, one per submission
pub struct FixtureSessionFactory<F>
where
    F: Fn(&str) -> Arc<FixturePage> + Send + Sync,
{
    build: F,
    opened: Mutex<Vec<String>>,
}

impl<F> FixtureSessionFactory<F>
where
    F: Fn(&str) -> Arc<FixturePage> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self { build, opened: Mutex::new(vec![]) }
    }

    /// Submission ids sessions were opened for, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl<F> SessionFactory for FixtureSessionFactory<F>
where
    F: Fn(&str) -> Arc<FixturePage> + Send + Sync,
{
    async fn open(&self, submission_id: &str) -> BrowserResult<Box<dyn PortalSession>> {
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).push(submission_id.to_string());
        Ok(Box::new(FixtureSession { page: (self.build)(submission_id) }))
    }
}
