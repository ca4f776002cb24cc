use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::services::feed::SourceRecord;

// Vendor analysis client.
//
// One request per record; the engine decides what to do with the outcome.
// Transient vendor failures (timeouts, 429, 5xx) get a bounded in-call retry;
// everything else surfaces immediately and becomes a Failed report upstream.

const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_ATTEMPTS: usize = 2;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Errors from a single analysis attempt.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("no vendor api key configured")]
    MissingApiKey,

    #[error("vendor request timed out")]
    Timeout,

    #[error("vendor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vendor returned {status}: {body}")]
    Vendor {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("vendor response had no usable content")]
    MalformedResponse,
}

impl AnalyzerError {
    fn is_retryable(&self) -> bool {
        match self {
            AnalyzerError::Timeout => true,
            AnalyzerError::Vendor { status, .. } => {
                *status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// Produces one scoring document per source record.
#[async_trait]
pub trait CallAnalyzer: Send + Sync {
    async fn analyze(&self, record: &SourceRecord) -> Result<Value, AnalyzerError>;
}

/// Gemini-backed analyzer. The rubric lives in the prompt; the response is
/// expected to contain a single JSON object, possibly wrapped in prose.
pub struct GeminiAnalyzer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_attempts: usize,
}

impl GeminiAnalyzer {
    pub fn new(api_key: impl Into<String>) -> Result<Self, AnalyzerError> {
        Self::builder(api_key).build()
    }

    pub fn builder(api_key: impl Into<String>) -> GeminiAnalyzerBuilder {
        GeminiAnalyzerBuilder {
            api_key: api_key.into(),
            model: None,
            base_url: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Resolve an API key from the environment when none is configured.
    pub fn key_from_env() -> Option<String> {
        ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]
            .iter()
            .find_map(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty())
    }

    async fn request_once(&self, record: &SourceRecord) -> Result<Value, AnalyzerError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let payload = json!({
            "contents": [{
                "parts": [{ "text": scoring_prompt(record) }]
            }],
            "generationConfig": {
                "temperature": 0.7,
                "maxOutputTokens": 4000
            }
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Vendor { status, body });
        }

        let body: Value = response.json().await.map_err(classify_transport)?;
        let text = candidate_text(&body).ok_or(AnalyzerError::MalformedResponse)?;
        Ok(extract_document(&text, record))
    }
}

#[async_trait]
impl CallAnalyzer for GeminiAnalyzer {
    async fn analyze(&self, record: &SourceRecord) -> Result<Value, AnalyzerError> {
        if self.api_key.trim().is_empty() {
            return Err(AnalyzerError::MissingApiKey);
        }
        debug_assert!(self.max_attempts >= 1);

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.request_once(record).await {
                Ok(document) => return Ok(document),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        event = "analyzer.retry",
                        key = %record.key,
                        attempt,
                        error = %error,
                    );
                    last_error = Some(error);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(error) => return Err(error),
            }
        }
        // Reachable only when every attempt was retryable.
        Err(last_error.unwrap_or(AnalyzerError::MalformedResponse))
    }
}

pub struct GeminiAnalyzerBuilder {
    api_key: String,
    model: Option<String>,
    base_url: Option<String>,
    timeout: Duration,
    max_attempts: usize,
}

impl GeminiAnalyzerBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn build(self) -> Result<GeminiAnalyzer, AnalyzerError> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        Ok(GeminiAnalyzer {
            client,
            api_key: self.api_key,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_attempts: self.max_attempts,
        })
    }
}

fn classify_transport(error: reqwest::Error) -> AnalyzerError {
    if error.is_timeout() {
        AnalyzerError::Timeout
    } else {
        AnalyzerError::Http(error)
    }
}

fn candidate_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// Pull the first balanced JSON object out of the model's reply. Models wrap
/// their answer in prose or code fences often enough that a plain parse is
/// not enough.
fn extract_document(text: &str, record: &SourceRecord) -> Value {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str(text.trim()) {
        return value;
    }

    if let Some(candidate) = balanced_object(text)
        && let Ok(value @ Value::Object(_)) = serde_json::from_str(candidate)
    {
        return value;
    }

    // No parseable object: keep the raw reply so nothing is lost, but mark
    // the document so readers know scoring fields are absent.
    json!({
        "Functional": {
            "Call_ID": record.key,
            "Store_Location": record.store_name,
        },
        "raw_response": text,
        "parse_error": true,
    })
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn scoring_prompt(record: &SourceRecord) -> String {
    format!(
        r#"You are a sales-call quality analyst. Analyze the sales call recorded at {url} for the store "{store}" and return ONLY a JSON object, no prose, with exactly this shape:

{{
  "Functional": {{
    "Call_ID": "{key}",
    "Store_Location": "{store}",
    "Call_Duration": "<duration if determinable>",
    "Customer_Intent": "<what the customer wanted>"
  }},
  "Scoring": {{
    "Greeting": {{ "score": <0-10>, "notes": "<observations>" }},
    "Needs_Discovery": {{ "score": <0-10>, "notes": "<observations>" }},
    "Product_Knowledge": {{ "score": <0-10>, "notes": "<observations>" }},
    "Objection_Handling": {{ "score": <0-10>, "notes": "<observations>" }},
    "Closing": {{ "score": <0-10>, "notes": "<observations>" }},
    "Overall": {{ "score": <0-10>, "summary": "<two sentences>" }}
  }},
  "Recommendations": ["<concrete coaching point>", "..."]
}}

Score each dimension 0-10. Base every observation on what is actually said in the call. If the recording is inaccessible, say so in Overall.summary and score conservatively."#,
        url = record.recording_url,
        store = record.store_name,
        key = record.key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SourceRecord {
        SourceRecord {
            key: "video_0".to_string(),
            store_name: "Indiranagar".to_string(),
            recording_url: "https://example.com/a.mp4".to_string(),
            duration: Some("312".to_string()),
            is_converted: true,
            call_date: Some("2025-10-21".to_string()),
        }
    }

    #[test]
    fn extracts_bare_json_object() {
        let doc = extract_document(r#"{"Scoring": {"Overall": {"score": 7}}}"#, &record());
        assert_eq!(doc["Scoring"]["Overall"]["score"], 7);
    }

    #[test]
    fn extracts_object_wrapped_in_prose_and_fences() {
        let text = "Here is the analysis:\n```json\n{\"Scoring\": {\"Overall\": {\"score\": 5, \"summary\": \"ok {braces} inside\"}}}\n```\nHope that helps.";
        let doc = extract_document(text, &record());
        assert_eq!(doc["Scoring"]["Overall"]["score"], 5);
    }

    #[test]
    fn braces_inside_strings_do_not_break_extraction() {
        let text = r#"prefix {"note": "a } inside a string", "n": 1} suffix"#;
        let doc = extract_document(text, &record());
        assert_eq!(doc["n"], 1);
    }

    #[test]
    fn unparseable_reply_is_preserved_with_marker() {
        let doc = extract_document("I could not access the recording.", &record());
        assert_eq!(doc["parse_error"], true);
        assert_eq!(doc["Functional"]["Call_ID"], "video_0");
        assert_eq!(doc["raw_response"], "I could not access the recording.");
    }

    #[test]
    fn candidate_text_joins_parts() {
        let body = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"a\":" }, { "text": " 1}" }] }
            }]
        });
        assert_eq!(candidate_text(&body).as_deref(), Some("{\"a\": 1}"));
        assert_eq!(candidate_text(&serde_json::json!({})), None);
    }

    #[test]
    fn retryability_classification() {
        assert!(AnalyzerError::Timeout.is_retryable());
        assert!(
            AnalyzerError::Vendor {
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                body: String::new(),
            }
            .is_retryable()
        );
        assert!(
            AnalyzerError::Vendor {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !AnalyzerError::Vendor {
                status: reqwest::StatusCode::BAD_REQUEST,
                body: String::new(),
            }
            .is_retryable()
        );
        assert!(!AnalyzerError::MissingApiKey.is_retryable());
    }
}
