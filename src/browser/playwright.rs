//! Playwright-backed portal page
//!
//! Typed references are resolved by an in-page script that tags the match
//! with a `data-pp-ref` attribute; every interaction after that goes through
//! Playwright's own actionability checks on `[data-pp-ref="..."]`, so an
//! overlay stealing the click surfaces as `BrowserError::Intercepted`.

use async_trait::async_trait;
use playwright::api::{Browser, BrowserContext, Page, StorageState};
use playwright::Playwright;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session::SessionStore;
use super::{
    BrowserError, BrowserResult, ElementHandle, ElementInfo, ElementRef, PortalPage, PortalSession, Rect,
    SessionFactory, TextMatch,
};

const RESOLVE_SCRIPT: &str = r#"
([kind, role, name, exact]) => {
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const want = norm(name);
  const hit = s => want.length > 0 && (exact ? norm(s) === want : norm(s).includes(want));
  const visible = el => {
    const r = el.getBoundingClientRect();
    const st = window.getComputedStyle(el);
    return r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none';
  };
  const implicitRole = el => {
    const explicit = el.getAttribute('role');
    if (explicit) return explicit;
    const tag = el.tagName;
    if (tag === 'A' && el.hasAttribute('href')) return 'link';
    if (tag === 'BUTTON') return 'button';
    if (tag === 'SELECT') return 'combobox';
    if (tag === 'TEXTAREA') return 'textbox';
    if (tag === 'OPTION') return 'option';
    if (tag === 'INPUT') {
      const t = (el.getAttribute('type') || 'text').toLowerCase();
      if (t === 'checkbox' || t === 'radio') return t;
      if (t === 'submit' || t === 'button') return 'button';
      return 'textbox';
    }
    return '';
  };
  const accName = el => el.getAttribute('aria-label')
    || (el.labels && el.labels.length ? el.labels[0].innerText : '')
    || el.innerText || el.value || el.getAttribute('title') || '';
  const all = Array.from(document.querySelectorAll('*')).filter(visible);
  let found = null;
  if (kind === 'role') {
    found = all.find(el => implicitRole(el) === role && hit(accName(el)));
  } else if (kind === 'label') {
    const label = Array.from(document.querySelectorAll('label')).find(l => hit(l.innerText));
    if (label) {
      found = label.control
        || (label.htmlFor ? document.getElementById(label.htmlFor) : null)
        || label.querySelector('input,select,textarea');
    }
    if (!found) found = all.find(el => hit(el.getAttribute('aria-label')));
  } else if (kind === 'placeholder') {
    found = all.find(el => hit(el.getAttribute('placeholder')));
  } else if (kind === 'text') {
    const matches = all.filter(el => hit(el.innerText));
    found = matches.length ? matches[matches.length - 1] : null;
  } else if (kind === 'selector') {
    found = Array.from(document.querySelectorAll(name)).find(visible) || null;
  }
  if (!found) return null;
  const id = 'pp-' + Math.random().toString(36).slice(2, 10);
  found.setAttribute('data-pp-ref', id);
  return id;
}
"#;

const INSPECT_SCRIPT: &str = r#"
(ref) => {
  const el = document.querySelector(`[data-pp-ref="${ref}"]`);
  if (!el) return null;
  const r = el.getBoundingClientRect();
  const tag = el.tagName.toLowerCase();
  const editable = !el.disabled && !el.readOnly
    && (tag === 'textarea' || el.isContentEditable
      || (tag === 'input' && !['checkbox', 'radio', 'submit', 'button'].includes((el.type || '').toLowerCase())));
  return {
    tag,
    enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
    editable,
    checked: !!el.checked,
    value: el.value || '',
    bounds: { x: r.x, y: r.y, width: r.width, height: r.height },
  };
}
"#;

const SELECT_SCRIPT: &str = r#"
([ref, wanted, exact]) => {
  const el = document.querySelector(`[data-pp-ref="${ref}"]`);
  if (!el || el.tagName !== 'SELECT') return false;
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const want = norm(wanted);
  const opt = Array.from(el.options).find(o => exact ? norm(o.text) === want : norm(o.text).includes(want));
  if (!opt) return false;
  el.value = opt.value;
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
}
"#;

const VISIBLE_SCRIPT: &str = r#"
(selector) => Array.from(document.querySelectorAll(selector)).some(el => {
  const r = el.getBoundingClientRect();
  const st = window.getComputedStyle(el);
  return r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none';
})
"#;

fn ref_selector(element: &ElementHandle) -> String {
    format!("[data-pp-ref=\"{}\"]", element.0)
}

fn driver_err(e: impl std::fmt::Display) -> BrowserError {
    let msg = e.to_string();
    if msg.contains("intercepts pointer events") {
        BrowserError::Intercepted(msg)
    } else if msg.contains("not editable") || msg.contains("not enabled") || msg.contains("disabled") {
        BrowserError::NotInteractable { action: "interact".into(), reason: msg }
    } else {
        BrowserError::Driver(msg)
    }
}

pub struct PlaywrightPage {
    page: Page,
}

impl PlaywrightPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl PortalPage for PlaywrightPage {
    async fn goto(&self, url: &str, timeout_ms: u64) -> BrowserResult<()> {
        info!(url, "Navigating");
        self.page
            .goto_builder(url)
            .timeout(timeout_ms as f64)
            .goto()
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Timeout") || msg.contains("timeout") {
                    BrowserError::NavigationTimeout(format!("{}: {}", url, msg))
                } else {
                    BrowserError::Driver(msg)
                }
            })
    }

    async fn current_url(&self) -> BrowserResult<String> {
        self.page.url().map_err(driver_err)
    }

    async fn find(&self, target: &ElementRef, matching: TextMatch) -> BrowserResult<Option<ElementHandle>> {
        let (kind, role) = match target {
            ElementRef::Role { role, .. } => ("role", role.as_str()),
            ElementRef::Label { .. } => ("label", ""),
            ElementRef::Text { .. } => ("text", ""),
            ElementRef::Placeholder { .. } => ("placeholder", ""),
            ElementRef::Selector { .. } => ("selector", ""),
        };
        let arg = json!([kind, role, target.name(), matching == TextMatch::Exact]);
        let id: Option<String> = self.page.evaluate(RESOLVE_SCRIPT, arg).await.map_err(driver_err)?;
        debug!(target = %target, found = id.is_some(), "Resolved reference");
        Ok(id.map(ElementHandle))
    }

    async fn inspect(&self, element: &ElementHandle) -> BrowserResult<ElementInfo> {
        let info: Option<ElementInfo> = self
            .page
            .evaluate(INSPECT_SCRIPT, element.0.clone())
            .await
            .map_err(driver_err)?;
        info.ok_or_else(|| BrowserError::Stale(element.0.clone()))
    }

    async fn fill(&self, element: &ElementHandle, value: &str) -> BrowserResult<()> {
        self.page
            .fill_builder(&ref_selector(element), value)
            .fill()
            .await
            .map_err(driver_err)
    }

    async fn type_text(&self, element: &ElementHandle, text: &str, delay_ms: u64) -> BrowserResult<()> {
        let focus = format!("() => document.querySelector('{}').focus()", ref_selector(element).replace('\'', "\\'"));
        let _: Value = self.page.evaluate(&focus, ()).await.map_err(driver_err)?;
        self.page
            .keyboard
            .r#type(text, Some(delay_ms as f64))
            .await
            .map_err(driver_err)
    }

    async fn click(&self, element: &ElementHandle, force: bool) -> BrowserResult<()> {
        self.page
            .click_builder(&ref_selector(element))
            .force(force)
            .click()
            .await
            .map_err(driver_err)
    }

    async fn set_checked(&self, element: &ElementHandle, checked: bool, force: bool) -> BrowserResult<()> {
        let selector = ref_selector(element);
        if checked {
            self.page.check_builder(&selector).force(force).check().await.map_err(driver_err)
        } else {
            self.page.uncheck_builder(&selector).force(force).uncheck().await.map_err(driver_err)
        }
    }

    async fn select_native(&self, element: &ElementHandle, option: &str, matching: TextMatch) -> BrowserResult<bool> {
        let arg = json!([element.0, option, matching == TextMatch::Exact]);
        self.page.evaluate(SELECT_SCRIPT, arg).await.map_err(driver_err)
    }

    async fn click_at(&self, x: f64, y: f64) -> BrowserResult<()> {
        self.page.mouse.click_builder(x, y).click().await.map_err(driver_err)
    }

    async fn press(&self, key: &str) -> BrowserResult<()> {
        self.page.keyboard.press(key, None).await.map_err(driver_err)
    }

    async fn is_visible(&self, selector: &str) -> BrowserResult<bool> {
        self.page.evaluate(VISIBLE_SCRIPT, selector.to_string()).await.map_err(driver_err)
    }

    async fn body_text(&self) -> BrowserResult<String> {
        self.page
            .evaluate("() => document.body ? document.body.innerText : ''", ())
            .await
            .map_err(driver_err)
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        self.page.screenshot_builder().screenshot().await.map_err(driver_err)
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        self.page.evaluate(script, ()).await.map_err(driver_err)
    }
}

/// One Chromium instance with the saved portal login loaded
pub struct PlaywrightSession {
    _playwright: Playwright,
    browser: Browser,
    context: BrowserContext,
    page: PlaywrightPage,
    store: Arc<dyn SessionStore>,
}

impl PlaywrightSession {
    pub async fn launch(headless: bool, store: Arc<dyn SessionStore>) -> BrowserResult<Self> {
        let playwright = Playwright::initialize().await.map_err(driver_err)?;
        playwright.install_chromium().map_err(driver_err)?;

        let browser = playwright
            .chromium()
            .launcher()
            .headless(headless)
            .launch()
            .await
            .map_err(driver_err)?;

        let mut builder = browser.context_builder();
        match store.load() {
            Ok(Some(saved)) => match serde_json::from_value::<StorageState>(saved) {
                Ok(state) => builder = builder.storage_state(state),
                Err(e) => warn!("Ignoring unreadable portal session: {}", e),
            },
            Ok(None) => warn!("No saved portal session; the start step will report an expired session"),
            Err(e) => warn!("Could not load portal session: {}", e),
        }
        let context = builder.build().await.map_err(driver_err)?;
        let page = context.new_page().await.map_err(driver_err)?;

        Ok(Self { _playwright: playwright, browser, context, page: PlaywrightPage::new(page), store })
    }
}

#[async_trait]
impl PortalSession for PlaywrightSession {
    fn page(&self) -> &dyn PortalPage {
        &self.page
    }

    async fn close(&self) -> BrowserResult<()> {
        match self.context.storage_state().await {
            Ok(state) => match serde_json::to_value(&state) {
                Ok(value) => {
                    if let Err(e) = self.store.save(&value) {
                        warn!("Could not persist portal session: {}", e);
                    }
                }
                Err(e) => warn!("Could not serialize portal session: {}", e),
            },
            Err(e) => warn!("Could not read storage state: {}", e),
        }
        self.browser.close().await.map_err(driver_err)
    }
}

/// Launches one browser per submission
pub struct PlaywrightSessionFactory {
    headless: bool,
    store: Arc<dyn SessionStore>,
}

impl PlaywrightSessionFactory {
    pub fn new(headless: bool, store: Arc<dyn SessionStore>) -> Self {
        Self { headless, store }
    }
}

#[async_trait]
impl SessionFactory for PlaywrightSessionFactory {
    async fn open(&self, submission_id: &str) -> BrowserResult<Box<dyn PortalSession>> {
        info!(submission_id, headless = self.headless, "Launching browser session");
        let session = PlaywrightSession::launch(self.headless, self.store.clone()).await?;
        Ok(Box::new(session))
    }
}
