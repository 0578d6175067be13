//! Stability gate
//!
//! The portal chains several asynchronous loads per transition and its
//! loading indicators flicker between them, so "no spinner right now" is not
//! enough. The gate wants several consecutive clean polls. Hitting the upper
//! bound is not an error: some indicators never clear even though the page
//! works, and the next step's own checks will fail fast if it really is stuck.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::browser::PortalPage;
use crate::core::config::StabilityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Stable { waited: Duration },
    TimedOut { waited: Duration },
}

impl GateOutcome {
    pub fn is_stable(&self) -> bool {
        matches!(self, GateOutcome::Stable { .. })
    }
}

pub struct StabilityGate<'a> {
    page: &'a dyn PortalPage,
    indicators: &'a [String],
    config: &'a StabilityConfig,
}

impl<'a> StabilityGate<'a> {
    pub fn new(page: &'a dyn PortalPage, indicators: &'a [String], config: &'a StabilityConfig) -> Self {
        Self { page, indicators, config }
    }

    /// Wait with the configured upper bound
    pub async fn settle(&self) -> GateOutcome {
        self.wait(self.config.max_wait()).await
    }

    pub async fn wait(&self, max_wait: Duration) -> GateOutcome {
        let start = Instant::now();
        let mut clean_polls = 0u32;

        loop {
            if start.elapsed() >= max_wait {
                warn!(waited_ms = start.elapsed().as_millis() as u64, "Page did not settle; proceeding");
                return GateOutcome::TimedOut { waited: start.elapsed() };
            }

            match self.active_indicator().await {
                Some(selector) => {
                    clean_polls = 0;
                    let remaining = max_wait.saturating_sub(start.elapsed());
                    self.wait_cleared(selector, remaining.min(self.config.busy_timeout())).await;
                }
                None => {
                    clean_polls += 1;
                    if clean_polls >= self.config.stable_polls.max(1) {
                        debug!(waited_ms = start.elapsed().as_millis() as u64, "Page stable");
                        return GateOutcome::Stable { waited: start.elapsed() };
                    }
                }
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn active_indicator(&self) -> Option<&'a str> {
        for selector in self.indicators {
            match self.page.is_visible(selector).await {
                Ok(true) => return Some(selector.as_str()),
                Ok(false) => {}
                Err(e) => debug!(selector = %selector, "Busy check failed: {}", e),
            }
        }
        None
    }

    async fn wait_cleared(&self, selector: &str, bound: Duration) {
        let start = Instant::now();
        while start.elapsed() < bound {
            tokio::time::sleep(self.config.poll_interval()).await;
            if !self.page.is_visible(selector).await.unwrap_or(false) {
                return;
            }
        }
        debug!(selector, "Busy indicator outlived its timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{FixturePage, FixtureScreen};
    use crate::core::TimingPolicy;

    fn page() -> FixturePage {
        FixturePage::new(vec![FixtureScreen::new("one", "https://portal.test/", "Ready")])
    }

    fn indicators() -> Vec<String> {
        vec!["#divGlobalLoading".into(), ".loading-spinner".into()]
    }

    #[tokio::test]
    async fn test_quiet_page_is_stable() {
        let page = page();
        let timing = TimingPolicy::fast();
        let ind = indicators();
        let gate = StabilityGate::new(&page, &ind, &timing.stability);
        assert!(gate.settle().await.is_stable());
    }

    #[tokio::test]
    async fn test_flickering_indicator_is_absorbed() {
        let page = page().with_busy("#divGlobalLoading", 3).with_busy(".loading-spinner", 2);
        let timing = TimingPolicy::fast();
        let ind = indicators();
        let gate = StabilityGate::new(&page, &ind, &timing.stability);
        assert!(gate.wait(Duration::from_secs(2)).await.is_stable());
        assert!(!page.is_visible("#divGlobalLoading").await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_indicator_times_out_without_error() {
        let page = page().with_busy("#divGlobalLoading", u32::MAX);
        let timing = TimingPolicy::fast();
        let ind = indicators();
        let gate = StabilityGate::new(&page, &ind, &timing.stability);
        let outcome = gate.wait(Duration::from_millis(30)).await;
        assert!(matches!(outcome, GateOutcome::TimedOut { .. }));
    }
}
