use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

/// Portal vocabulary and selectors that are not tied to a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    /// Path of the page that starts a new application
    pub start_path: String,
    /// Path of the contractor's "My Records" list, used after payment
    pub records_path: String,
    /// Record type chosen on the permit type step
    pub record_type: String,
    /// Text that only appears when the portal wants a fresh login
    pub login_markers: Vec<String>,
    /// Busy/loading indicators polled by the stability gate
    pub busy_indicators: Vec<String>,
    /// Third-party guidance overlay that swallows clicks on the address step
    pub guidance_overlay_selectors: Vec<String>,
    /// JS globals of the guidance library to neutralize
    pub guidance_globals: Vec<String>,
    /// Rows of the address autocomplete list
    pub address_result_selector: String,
    /// Brand-styled primary buttons, last resort for the submit control
    pub primary_button_selectors: Vec<String>,
    pub payment_markers: Vec<String>,
    pub confirmation_markers: Vec<String>,
    pub no_documents_markers: Vec<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://aca-prod.accela.com/OAKDALE".into(),
            start_path: "/Cap/CapHome.aspx?module=Building".into(),
            records_path: "/Cap/CapHome.aspx?module=Building&TabName=Building&mode=myrecords".into(),
            record_type: "Mechanical Express Permit".into(),
            login_markers: vec![
                "Login to your account".into(),
                "Sign in to continue".into(),
                "Your session has expired".into(),
            ],
            busy_indicators: vec![
                "#divGlobalLoading".into(),
                ".ACA_Loading_Message".into(),
                ".loading-spinner".into(),
                "[aria-busy='true']".into(),
            ],
            guidance_overlay_selectors: vec![
                "#pendo-guide-container".into(),
                "._pendo-backdrop_".into(),
                "#pendo-base".into(),
            ],
            guidance_globals: vec!["pendo".into()],
            address_result_selector: ".address-search-results .result-row".into(),
            primary_button_selectors: vec![
                "a.ACA_LgButton.ACA_LgButton_FontSize".into(),
                "button.btn-primary".into(),
            ],
            payment_markers: vec![
                "Pay Fees".into(),
                "Payment Information".into(),
                "Checkout".into(),
                "Amount Due".into(),
            ],
            confirmation_markers: vec![
                "has been received".into(),
                "successfully submitted".into(),
                "Receipt/Record Issuance".into(),
                "Your record number is".into(),
            ],
            no_documents_markers: vec![
                "No plans required".into(),
                "No documents are required".into(),
            ],
        }
    }
}

impl PortalConfig {
    pub fn start_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.start_path)
    }

    pub fn records_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.records_path)
    }
}

/// Stability gate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Upper bound for one gate call
    pub max_wait_ms: u64,
    /// Bound on waiting for one active indicator to clear
    pub busy_timeout_ms: u64,
    /// Consecutive clean polls required before returning
    pub stable_polls: u32,
    pub poll_interval_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 15_000,
            busy_timeout_ms: 8_000,
            stable_polls: 3,
            poll_interval_ms: 250,
        }
    }
}

impl StabilityConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The single timeout/backoff policy passed through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    /// Bounded wait for an element reference to resolve
    pub element_wait_ms: u64,
    /// Short lookup used by heuristics that expect misses
    pub peek_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// Bounded wait for a step's anchor text
    pub anchor_wait_ms: u64,
    pub navigation_timeout_ms: u64,
    /// Pause between opening a dropdown and matching its options
    pub select_settle_ms: u64,
    /// Per-character delay when typing into autocomplete inputs
    pub typing_delay_ms: u64,
    /// How long the advance control may stay disabled
    pub enable_wait_ms: u64,
    /// Last-resort sleep when no condition can be observed
    pub fallback_sleep_ms: u64,
    pub stability: StabilityConfig,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            element_wait_ms: 10_000,
            peek_wait_ms: 1_500,
            poll_interval_ms: 200,
            anchor_wait_ms: 20_000,
            navigation_timeout_ms: 45_000,
            select_settle_ms: 400,
            typing_delay_ms: 60,
            enable_wait_ms: 15_000,
            fallback_sleep_ms: 1_000,
            stability: StabilityConfig::default(),
        }
    }
}

impl TimingPolicy {
    pub fn element_wait(&self) -> Duration {
        Duration::from_millis(self.element_wait_ms)
    }

    pub fn peek_wait(&self) -> Duration {
        Duration::from_millis(self.peek_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn anchor_wait(&self) -> Duration {
        Duration::from_millis(self.anchor_wait_ms)
    }

    pub fn select_settle(&self) -> Duration {
        Duration::from_millis(self.select_settle_ms)
    }

    pub fn enable_wait(&self) -> Duration {
        Duration::from_millis(self.enable_wait_ms)
    }

    pub fn fallback_sleep(&self) -> Duration {
        Duration::from_millis(self.fallback_sleep_ms)
    }

    /// Millisecond timings small enough for fixture-driven tests
    pub fn fast() -> Self {
        Self {
            element_wait_ms: 40,
            peek_wait_ms: 10,
            poll_interval_ms: 2,
            anchor_wait_ms: 40,
            navigation_timeout_ms: 100,
            select_settle_ms: 1,
            typing_delay_ms: 0,
            enable_wait_ms: 20,
            fallback_sleep_ms: 1,
            stability: StabilityConfig {
                max_wait_ms: 60,
                busy_timeout_ms: 30,
                stable_polls: 2,
                poll_interval_ms: 1,
            },
        }
    }
}

/// Vision model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionSettings {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Minimum confidence (0-100) before recommended actions run
    pub min_confidence: u8,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".into(),
            model: "claude-sonnet-4-5-20250514".into(),
            api_key_env: "PERMIT_PILOT_VISION_KEY".into(),
            timeout_secs: 60,
            min_confidence: 50,
        }
    }
}

impl VisionSettings {
    /// Configured key, then the provider's conventional variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .or_else(|| {
                if self.endpoint.contains("anthropic.com") {
                    std::env::var("ANTHROPIC_API_KEY").ok()
                } else {
                    std::env::var("OPENAI_API_KEY").ok()
                }
            })
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub session_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".permit-pilot");
        Self {
            database_path: base.join("permit_pilot.db"),
            artifacts_dir: base.join("artifacts"),
            session_path: base.join("portal_session.json"),
        }
    }
}

/// Caller-side policy for the batch runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub default_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_secs: 45,
            default_limit: 10,
        }
    }
}

impl BatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Full permit-pilot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub portal: PortalConfig,
    pub timing: TimingPolicy,
    pub vision: VisionSettings,
    pub storage: StorageConfig,
    pub batch: BatchConfig,
}

pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("permit-pilot")
            .join("config.toml");
        Self { path }
    }

    pub fn at(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config file; a missing file means defaults
    pub fn load(&self) -> std::io::Result<OrchestratorConfig> {
        if !self.path.exists() {
            return Ok(OrchestratorConfig::default());
        }
        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {}", self.path.display(), e),
            )
        })
    }

    pub fn save(&self, config: &OrchestratorConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData,
                format!("Failed to serialize config to TOML: {}", e)))?;
        fs::write(&self.path, content)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
