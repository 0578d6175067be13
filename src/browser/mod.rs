//! Browser seam
//!
//! Everything the orchestrator does to the portal goes through the
//! [`PortalPage`] trait. Two implementations ship:
//! - `PlaywrightPage` (feature `browser`): a real Chromium via Playwright
//! - [`fixture::FixturePage`]: a scripted in-memory portal
//!
//! Element references are typed. Role/label/placeholder/text lookups survive
//! incidental markup changes on the portal; raw selectors do not, so they are
//! the last resort everywhere.

pub mod fixture;
pub mod session;

#[cfg(feature = "browser")]
pub mod playwright;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrowserError {
    /// Another element (usually a transient overlay) received the click
    #[error("click intercepted: {0}")]
    Intercepted(String),

    #[error("cannot {action}: {reason}")]
    NotInteractable { action: String, reason: String },

    #[error("element handle {0} is no longer attached")]
    Stale(String),

    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error("driver error: {0}")]
    Driver(String),
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// A typed reference to a control on the page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementRef {
    /// ARIA role plus accessible name, e.g. button "Continue Application"
    Role { role: String, name: String },
    /// Text of the `<label>` bound to the control
    Label { name: String },
    /// Visible text of the element itself
    Text { name: String },
    Placeholder { name: String },
    /// CSS selector; brittle, used only when nothing structured fits
    Selector { name: String },
}

impl ElementRef {
    pub fn role(role: &str, name: &str) -> Self {
        ElementRef::Role { role: role.into(), name: name.into() }
    }

    pub fn button(name: &str) -> Self {
        Self::role("button", name)
    }

    pub fn link(name: &str) -> Self {
        Self::role("link", name)
    }

    pub fn label(name: &str) -> Self {
        ElementRef::Label { name: name.into() }
    }

    pub fn text(name: &str) -> Self {
        ElementRef::Text { name: name.into() }
    }

    pub fn placeholder(name: &str) -> Self {
        ElementRef::Placeholder { name: name.into() }
    }

    pub fn selector(css: &str) -> Self {
        ElementRef::Selector { name: css.into() }
    }

    pub fn kind(&self) -> ReferenceKind {
        match self {
            ElementRef::Role { .. } => ReferenceKind::Role,
            ElementRef::Label { .. } => ReferenceKind::Label,
            ElementRef::Text { .. } => ReferenceKind::Text,
            ElementRef::Placeholder { .. } => ReferenceKind::Placeholder,
            ElementRef::Selector { .. } => ReferenceKind::RawSelector,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ElementRef::Role { name, .. }
            | ElementRef::Label { name }
            | ElementRef::Text { name }
            | ElementRef::Placeholder { name }
            | ElementRef::Selector { name } => name,
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementRef::Role { role, name } => write!(f, "{} \"{}\"", role, name),
            ElementRef::Label { name } => write!(f, "label \"{}\"", name),
            ElementRef::Text { name } => write!(f, "text \"{}\"", name),
            ElementRef::Placeholder { name } => write!(f, "placeholder \"{}\"", name),
            ElementRef::Selector { name } => write!(f, "selector `{}`", name),
        }
    }
}

/// Reference kinds in resolution preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Role,
    Label,
    Placeholder,
    Text,
    RawSelector,
}

/// How names are compared during lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatch {
    /// Whitespace-normalized, case-insensitive equality
    Exact,
    /// Whitespace-normalized, case-insensitive substring
    Contains,
}

impl TextMatch {
    pub fn matches(&self, candidate: &str, wanted: &str) -> bool {
        let c = normalize(candidate);
        let w = normalize(wanted);
        if w.is_empty() {
            return false;
        }
        match self {
            TextMatch::Exact => c == w,
            TextMatch::Contains => c.contains(&w),
        }
    }
}

/// Collapse whitespace and lowercase
pub fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Opaque handle to a resolved element; valid until the page re-renders
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }
}

/// Live facts about a resolved element
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Lowercase tag name
    pub tag: String,
    pub enabled: bool,
    pub editable: bool,
    pub checked: bool,
    pub value: String,
    pub bounds: Option<Rect>,
}

/// The live portal page
#[async_trait]
pub trait PortalPage: Send + Sync {
    async fn goto(&self, url: &str, timeout_ms: u64) -> BrowserResult<()>;

    async fn current_url(&self) -> BrowserResult<String>;

    /// Immediate lookup of the first visible match; `None` when absent
    async fn find(&self, target: &ElementRef, matching: TextMatch) -> BrowserResult<Option<ElementHandle>>;

    async fn inspect(&self, element: &ElementHandle) -> BrowserResult<ElementInfo>;

    async fn fill(&self, element: &ElementHandle, value: &str) -> BrowserResult<()>;

    /// Key-by-key typing, for inputs that react to keystrokes
    async fn type_text(&self, element: &ElementHandle, text: &str, delay_ms: u64) -> BrowserResult<()>;

    async fn click(&self, element: &ElementHandle, force: bool) -> BrowserResult<()>;

    async fn set_checked(&self, element: &ElementHandle, checked: bool, force: bool) -> BrowserResult<()>;

    /// Choose an option of a native `<select>` by visible text.
    /// Returns false when no option matched.
    async fn select_native(&self, element: &ElementHandle, option: &str, matching: TextMatch) -> BrowserResult<bool>;

    async fn click_at(&self, x: f64, y: f64) -> BrowserResult<()>;

    async fn press(&self, key: &str) -> BrowserResult<()>;

    /// Whether any element matching the CSS selector is currently visible
    async fn is_visible(&self, selector: &str) -> BrowserResult<bool>;

    async fn body_text(&self) -> BrowserResult<String>;

    /// PNG bytes of the viewport
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;

    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value>;
}

/// One exclusive browser session for one submission
#[async_trait]
pub trait PortalSession: Send + Sync {
    fn page(&self) -> &dyn PortalPage;

    /// Persist session artifacts and release the browser
    async fn close(&self) -> BrowserResult<()>;
}

/// Opens sessions for the batch runner
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, submission_id: &str) -> BrowserResult<Box<dyn PortalSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_match() {
        assert!(TextMatch::Exact.matches("  Continue   Application ", "continue application"));
        assert!(!TextMatch::Exact.matches("Continue Application »", "Continue Application"));
        assert!(TextMatch::Contains.matches("Continue Application »", "Continue Application"));
        assert!(!TextMatch::Contains.matches("anything", ""));
    }

    #[test]
    fn test_element_ref_serde_is_tagged() {
        let r = ElementRef::button("Submit Application");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "role");
        assert_eq!(json["role"], "button");
        let back: ElementRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);

        let label: ElementRef = serde_json::from_str(r#"{"kind":"label","name":"Job Value"}"#).unwrap();
        assert_eq!(label.kind(), ReferenceKind::Label);
        assert_eq!(label.to_string(), "label \"Job Value\"");
    }

    #[test]
    fn test_reference_kind_preference_order() {
        assert!(ReferenceKind::Role < ReferenceKind::Label);
        assert!(ReferenceKind::Text < ReferenceKind::RawSelector);
    }
}
