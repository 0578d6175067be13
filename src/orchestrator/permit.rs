//! Confirmation-page reading
//!
//! Finding no permit number is a normal outcome (the portal often redirects
//! to payment first), so extraction returns `Option`, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::config::PortalConfig;

/// Most specific first
static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // CTR-2025-004821
        r"\b([A-Z]{2,4}-\d{4}-\d{3,})\b",
        // BLD25-01234
        r"\b([A-Z]{2,4}\d{2,4}-\d{3,})\b",
        r"(?i)\b(?:permit|record)\s*(?:number|no\.?|#)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{4,})",
        r"(?i)\b(?:application|confirmation)\s*(?:number|no\.?|#)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{4,})",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static LEADING_ALNUM: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{2,}").ok());

const MIN_LEN: usize = 6;

/// Ordered-pattern permit number scanner
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitNumberExtractor;

impl PermitNumberExtractor {
    pub fn extract(page_text: &str) -> Option<String> {
        PATTERNS.iter().find_map(|re| {
            re.captures_iter(page_text)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().trim_end_matches('-').to_string())
                .find(|candidate| Self::is_plausible(candidate))
        })
    }

    /// Minimum length, alphanumeric prefix, at least one digit
    pub fn is_plausible(candidate: &str) -> bool {
        candidate.len() >= MIN_LEN
            && LEADING_ALNUM.as_ref().is_some_and(|re| re.is_match(candidate))
            && candidate.chars().any(|c| c.is_ascii_digit())
    }
}

/// What the page after "Submit" turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitClassification {
    RedirectedToPayment,
    SubmittedWithConfirmation,
    Ambiguous,
}

impl SubmitClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitClassification::RedirectedToPayment => "redirected_to_payment",
            SubmitClassification::SubmittedWithConfirmation => "submitted_with_confirmation",
            SubmitClassification::Ambiguous => "ambiguous",
        }
    }
}

/// Classify by page text; payment markers win over confirmation wording
pub fn classify_page(text: &str, url: &str, portal: &PortalConfig) -> SubmitClassification {
    let lower = text.to_lowercase();
    let has = |markers: &[String]| markers.iter().any(|m| lower.contains(&m.to_lowercase()));

    if has(&portal.payment_markers) || url.to_lowercase().contains("payment") {
        SubmitClassification::RedirectedToPayment
    } else if has(&portal.confirmation_markers) {
        SubmitClassification::SubmittedWithConfirmation
    } else {
        SubmitClassification::Ambiguous
    }
}

/// First line mentioning a fee amount, for the pending-payment context
pub fn fee_text(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| l.contains('$') && (l.to_lowercase().contains("fee") || l.to_lowercase().contains("due") || l.to_lowercase().contains("total")))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_sequence_number() {
        assert_eq!(
            PermitNumberExtractor::extract("Your application CTR-2025-004821 has been received"),
            Some("CTR-2025-004821".to_string())
        );
    }

    #[test]
    fn test_payment_redirect_has_no_number() {
        assert_eq!(PermitNumberExtractor::extract("Redirected to payment"), None);
    }

    #[test]
    fn test_pattern_order() {
        let text = "Confirmation Number: 88812345\nRecord BLD25-01234 created";
        assert_eq!(PermitNumberExtractor::extract(text), Some("BLD25-01234".to_string()));

        let text = "Thank you. Permit Number: MECH7781234";
        assert_eq!(PermitNumberExtractor::extract(text), Some("MECH7781234".to_string()));

        let text = "Application # 2025-55102 received";
        assert_eq!(PermitNumberExtractor::extract(text), Some("2025-55102".to_string()));
    }

    #[test]
    fn test_rejects_implausible_tokens() {
        assert_eq!(PermitNumberExtractor::extract("Permit number: PENDING"), None);
        assert_eq!(PermitNumberExtractor::extract("Confirmation # 12"), None);
        assert!(!PermitNumberExtractor::is_plausible("-12345"));
    }

    #[test]
    fn test_classify_page() {
        let portal = PortalConfig::default();
        assert_eq!(
            classify_page("Pay Fees\nAmount Due: $142.50", "https://portal/Cap/Pay.aspx", &portal),
            SubmitClassification::RedirectedToPayment
        );
        assert_eq!(
            classify_page("Your application CTR-2025-004821 has been received", "https://portal/done", &portal),
            SubmitClassification::SubmittedWithConfirmation
        );
        assert_eq!(classify_page("Please wait", "https://portal/x", &portal), SubmitClassification::Ambiguous);
    }

    #[test]
    fn test_fee_text() {
        assert_eq!(fee_text("Pay Fees\n  Total Fees Due: $142.50 \nCheckout"), Some("Total Fees Due: $142.50".to_string()));
        assert_eq!(fee_text("Checkout"), None);
    }
}
