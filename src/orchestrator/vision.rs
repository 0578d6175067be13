//! Vision-assisted step analysis
//!
//! A screenshot plus task context goes to a vision model, which must answer
//! with one JSON object. The answer is parsed defensively: anything that
//! does not parse degrades to a zero-confidence analysis with no fields, so
//! callers never see an error from here and the confidence gate stays the
//! single decision point.

use async_trait::async_trait;
use base64_lib::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::action::{reference_from_model, ActionDescriptor};
use crate::browser::ElementRef;
use crate::core::config::VisionSettings;
use crate::core::{Step, SubmissionRequest};

const ADVANCE_WORDS: [&str; 5] = ["continue", "next", "advance", "proceed", "submit"];

/// Normalized model answer for one screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionAnalysis {
    pub step_number: u8,
    pub step_name: String,
    pub fields: Vec<ActionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_reference: Option<ElementRef>,
    pub has_errors: bool,
    pub error_messages: Vec<String>,
    pub is_loading: bool,
    pub recommendations: Vec<String>,
    /// 0-100
    pub confidence: u8,
    /// Field suggestions dropped by descriptor validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl VisionAnalysis {
    /// Zero-confidence analysis used whenever the model cannot be trusted
    pub fn degraded(step: Step, reason: &str) -> Self {
        Self {
            step_number: step_index(step),
            step_name: step.title().to_string(),
            fields: vec![],
            submit_reference: None,
            has_errors: false,
            error_messages: vec![],
            is_loading: false,
            recommendations: vec![format!("Manual review recommended: {}", reason)],
            confidence: 0,
            rejected: vec![],
        }
    }

    /// Whether the model wants the step's advance control pressed
    pub fn suggests_advance(&self) -> bool {
        self.submit_reference.is_some()
            || self.recommendations.iter().any(|r| {
                let r = r.to_lowercase();
                ADVANCE_WORDS.iter().any(|w| r.contains(w))
            })
    }

    pub fn clears(&self, threshold: u8) -> bool {
        self.confidence >= threshold
    }
}

fn step_index(step: Step) -> u8 {
    step.number().unwrap_or_else(|| step.ordinal())
}

/// Anything that can look at a screenshot and describe the step
#[async_trait]
pub trait StepAnalyzer: Send + Sync {
    /// Never fails; problems degrade to zero confidence
    async fn analyze_step(
        &self,
        screenshot: &[u8],
        step: Step,
        request: &SubmissionRequest,
        context: &str,
    ) -> VisionAnalysis;
}

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vision API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("No API key in ${0}")]
    MissingKey(String),

    #[error("Unparseable model answer: {0}")]
    Parse(String),
}

const SYSTEM_PROMPT: &str = r#"You analyze screenshots of a government permit portal wizard for an automation engine.
OUTPUT ONLY RAW JSON. NO MARKDOWN. NO EXPLANATION. NO CODE BLOCKS.

Schema:
{"step_number":7,"step_name":"Work Items","fields":[{"action":"fill","reference":{"kind":"label","name":"Job Value"},"value":"8450.00","required":true,"current_value":""}],"submit_reference":{"kind":"role","role":"button","name":"Continue Application"},"has_errors":false,"error_messages":[],"is_loading":false,"recommendations":["Fill Job Value then continue"],"confidence":80}

Rules:
- action is one of fill, select, check, click
- reference kind is one of role (with role and name), label, placeholder, text, selector
- prefer role, then label, then placeholder, then text; use selector only as a last resort and never write code
- fill and select need a value taken from the submission data
- confidence is 0-100 and reflects how sure you are the actions are correct

CRITICAL: Your entire response must be a single JSON object starting with { and ending with }. Nothing else."#;

/// HTTP client for Anthropic or OpenAI-compatible vision endpoints
pub struct VisionAnalyzer {
    settings: VisionSettings,
    client: reqwest::Client,
    is_anthropic: bool,
    api_key: Option<String>,
}

impl VisionAnalyzer {
    pub fn new(settings: VisionSettings) -> Result<Self, VisionError> {
        let is_anthropic = settings.endpoint.contains("anthropic.com");
        let api_key = settings.api_key();
        if is_anthropic && api_key.is_none() {
            return Err(VisionError::MissingKey(settings.api_key_env.clone()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self { settings, client, is_anthropic, api_key })
    }

    fn build_prompt(step: Step, request: &SubmissionRequest, context: &str) -> String {
        format!(
            "Portal step {} ({}).\n\nSubmission data:\n{}\n\nTask context:\n{}\n\n\
             List the fields that still need input on this screen, the control that advances \
             the wizard, any validation errors, and whether the page is still loading.",
            step_index(step),
            step.title(),
            request.prompt_summary(),
            context,
        )
    }

    async fn complete(&self, png: &[u8], prompt: &str) -> Result<String, VisionError> {
        let image = base64_lib::engine::general_purpose::STANDARD.encode(png);

        let response = if self.is_anthropic {
            let request = serde_json::json!({
                "model": self.settings.model,
                "max_tokens": 2000,
                "system": SYSTEM_PROMPT,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": image}},
                        {"type": "text", "text": prompt}
                    ]
                }]
            });

            let mut req = self.client.post(&self.settings.endpoint).json(&request);
            if let Some(ref key) = self.api_key {
                req = req.header("x-api-key", key).header("anthropic-version", "2023-06-01");
            }
            req.send().await?
        } else {
            let request = serde_json::json!({
                "model": self.settings.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": [
                        {"type": "text", "text": prompt},
                        {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{}", image)}}
                    ]}
                ],
                "temperature": 0.1,
                "max_tokens": 2000
            });

            let mut req = self.client.post(&self.settings.endpoint).json(&request);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }
            req.send().await?
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Api { status, body });
        }

        let json: Value = response.json().await?;
        let content = if self.is_anthropic {
            json["content"][0]["text"].as_str().unwrap_or_default()
        } else {
            // Reasoning models may leave content empty
            let msg = &json["choices"][0]["message"];
            match msg["content"].as_str() {
                Some(c) if !c.is_empty() => c,
                _ => msg["reasoning_content"].as_str().unwrap_or_default(),
            }
        };
        Ok(content.to_string())
    }
}

#[async_trait]
impl StepAnalyzer for VisionAnalyzer {
    async fn analyze_step(
        &self,
        screenshot: &[u8],
        step: Step,
        request: &SubmissionRequest,
        context: &str,
    ) -> VisionAnalysis {
        let prompt = Self::build_prompt(step, request, context);
        let analysis = match self.complete(screenshot, &prompt).await {
            Ok(content) => parse_analysis(step, &content).unwrap_or_else(|e| {
                warn!(step = %step, "Vision answer rejected: {}", e);
                VisionAnalysis::degraded(step, "model answer could not be parsed")
            }),
            Err(e) => {
                warn!(step = %step, "Vision request failed: {}", e);
                VisionAnalysis::degraded(step, "vision request failed")
            }
        };
        info!(
            step = %step,
            confidence = analysis.confidence,
            fields = analysis.fields.len(),
            "Vision analysis"
        );
        analysis
    }
}

/// Parse the model's answer; missing keys take safe defaults
pub fn parse_analysis(step: Step, content: &str) -> Result<VisionAnalysis, VisionError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => return Err(VisionError::Parse("no JSON object in answer".into())),
    };
    let parsed: Value = serde_json::from_str(json_str).map_err(|e| VisionError::Parse(e.to_string()))?;
    if !parsed.is_object() {
        return Err(VisionError::Parse("answer is not an object".into()));
    }

    let mut fields = Vec::new();
    let mut rejected = Vec::new();
    for raw in parsed["fields"].as_array().into_iter().flatten() {
        match ActionDescriptor::from_model(raw) {
            Ok(d) => fields.push(d),
            Err(e) => {
                debug!("Dropping field suggestion: {}", e);
                rejected.push(e.to_string());
            }
        }
    }

    let strings = |key: &str| -> Vec<String> {
        parsed[key]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    };

    Ok(VisionAnalysis {
        step_number: parsed["step_number"]
            .as_u64()
            .map(|n| n.min(u8::MAX as u64) as u8)
            .unwrap_or_else(|| step_index(step)),
        step_name: parsed["step_name"].as_str().unwrap_or(step.title()).to_string(),
        fields,
        submit_reference: parsed.get("submit_reference").filter(|v| !v.is_null()).and_then(|v| {
            reference_from_model(v)
                .map_err(|e| debug!("Dropping submit reference: {}", e))
                .ok()
        }),
        has_errors: parsed["has_errors"].as_bool().unwrap_or(false),
        error_messages: strings("error_messages"),
        is_loading: parsed["is_loading"].as_bool().unwrap_or(false),
        recommendations: strings("recommendations"),
        confidence: normalize_confidence(&parsed["confidence"]),
        rejected,
    })
}

/// 0-1 fractions are scaled to 0-100; missing means no confidence
fn normalize_confidence(raw: &Value) -> u8 {
    let Some(value) = raw.as_f64() else {
        return 0;
    };
    let scaled = if value > 0.0 && value <= 1.0 && !raw.is_u64() { value * 100.0 } else { value };
    scaled.round().clamp(0.0, 100.0) as u8
}

/// Fixed answers: disabled vision, or scripted analyses in tests
pub struct StaticAnalyzer {
    scripted: Mutex<VecDeque<VisionAnalysis>>,
    calls: Mutex<Vec<(Step, String)>>,
}

impl StaticAnalyzer {
    /// Always answers with a zero-confidence analysis
    pub fn disabled() -> Self {
        Self::scripted(vec![])
    }

    /// Answers in order, then degrades
    pub fn scripted(answers: Vec<VisionAnalysis>) -> Self {
        Self { scripted: Mutex::new(answers.into()), calls: Mutex::new(vec![]) }
    }

    /// Steps and contexts analyzed so far
    pub fn calls(&self) -> Vec<(Step, String)> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl StepAnalyzer for StaticAnalyzer {
    async fn analyze_step(
        &self,
        _screenshot: &[u8],
        step: Step,
        _request: &SubmissionRequest,
        context: &str,
    ) -> VisionAnalysis {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push((step, context.to_string()));
        self.scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| VisionAnalysis::degraded(step, "vision disabled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::sample_request;

    #[test]
    fn test_parse_fenced_answer() {
        let answer = r#"Here you go:
```json
{"step_number": 7, "step_name": "Work Items",
 "fields": [
   {"action": "fill", "reference": {"kind": "label", "name": "Job Value"}, "value": "8450.00", "required": true},
   {"action": "click", "selector": "page.click('#go');"}
 ],
 "submit_reference": {"kind": "role", "role": "button", "name": "Continue Application"},
 "recommendations": ["Fill the job value and continue"],
 "confidence": 0.85}
```"#;
        let a = parse_analysis(Step::WorkItems, answer).unwrap();
        assert_eq!(a.step_number, 7);
        assert_eq!(a.fields.len(), 1);
        assert_eq!(a.rejected.len(), 1);
        assert_eq!(a.confidence, 85);
        assert_eq!(a.submit_reference, Some(ElementRef::button("Continue Application")));
        assert!(a.suggests_advance());
        assert!(!a.has_errors);
    }

    #[test]
    fn test_confidence_scales() {
        assert_eq!(normalize_confidence(&serde_json::json!(72)), 72);
        assert_eq!(normalize_confidence(&serde_json::json!(0.4)), 40);
        assert_eq!(normalize_confidence(&serde_json::json!(1)), 1);
        assert_eq!(normalize_confidence(&serde_json::json!(250)), 100);
        assert_eq!(normalize_confidence(&serde_json::json!("high")), 0);
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(parse_analysis(Step::Documents, "I cannot see the screen").is_err());
        assert!(parse_analysis(Step::Documents, "{not json}").is_err());
    }

    #[test]
    fn test_degraded_is_zero_confidence() {
        let a = VisionAnalysis::degraded(Step::ReviewSubmit, "timeout");
        assert_eq!(a.confidence, 0);
        assert_eq!(a.step_number, 9);
        assert!(a.fields.is_empty());
        assert!(!a.clears(50));
        assert!(!a.suggests_advance());
    }

    #[tokio::test]
    async fn test_static_analyzer_records_calls() {
        let analyzer = StaticAnalyzer::disabled();
        let a = analyzer
            .analyze_step(b"png", Step::WorkItems, &sample_request("v-1"), "no cost field matched")
            .await;
        assert_eq!(a.confidence, 0);
        assert_eq!(analyzer.calls(), vec![(Step::WorkItems, "no cost field matched".to_string())]);
    }

    #[test]
    fn test_local_endpoint_runs_without_key() {
        let settings = VisionSettings {
            api_key_env: "PERMIT_PILOT_TEST_UNSET_KEY".into(),
            endpoint: "http://localhost:1234/v1/chat/completions".into(),
            ..VisionSettings::default()
        };
        // Local OpenAI-compatible servers run without a key
        assert!(VisionAnalyzer::new(settings).is_ok());
    }
}
