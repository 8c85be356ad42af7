//! LLM arbitration for borderline item matches
//!
//! Items whose best semantic similarity lands in the configured band are
//! sent to a local chat model for a JSON verdict. A malformed or
//! low-confidence response triggers exactly one retry on the secondary
//! model; if both fail the arbiter returns a non-match verdict instead of
//! raising. Verdicts are memoized per (bill item, tie-up item) pair for the
//! life of the process.

use crate::config::ArbiterConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Options for one chat completion call
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Local, stateless chat backend
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str, opts: &GenerateOptions) -> Result<String>;
}

/// Chat backend speaking the local `/api/generate` protocol
pub struct HttpChatBackend {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateRequestOptions,
}

#[derive(Serialize)]
struct GenerateRequestOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpChatBackend {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::ChatBackend(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn generate(&self, model: &str, prompt: &str, opts: &GenerateOptions) -> Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateRequestOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
        };
        let response = self
            .client
            .post(&url)
            .timeout(opts.timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ChatBackend(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response)
    }
}

/// Match verdict returned by the arbiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "match")]
    pub is_match: bool,

    /// Model confidence in `[0, 1]`
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_name: Option<String>,

    /// Why both models failed, when they did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verdict {
    fn failed(reason: String) -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            normalized_name: None,
            error: Some(reason),
        }
    }
}

/// Memoizing arbiter over a [`ChatBackend`]
pub struct Arbiter {
    backend: Box<dyn ChatBackend>,
    config: ArbiterConfig,
    cache: Mutex<HashMap<(String, String), Verdict>>,
}

impl Arbiter {
    pub fn new(backend: Box<dyn ChatBackend>, config: ArbiterConfig) -> Self {
        Self {
            backend,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ask whether a normalized bill item and a normalized tie-up item name
    /// the same billable thing. Never returns an error; a double backend
    /// failure yields a non-match verdict carrying the reason.
    pub async fn decide(&self, bill_item: &str, tieup_item: &str) -> Verdict {
        let key = (bill_item.to_string(), tieup_item.to_string());
        if let Some(hit) = self.cache_get(&key) {
            debug!(bill_item, tieup_item, "arbiter cache hit");
            return hit;
        }

        let prompt = build_prompt(bill_item, tieup_item);
        let opts = GenerateOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: Duration::from_secs(self.config.timeout_secs),
        };

        let verdict = match self.try_model(&self.config.primary_model, &prompt, &opts).await {
            Ok(v) => v,
            Err(primary_err) => {
                warn!(
                    model = %self.config.primary_model,
                    "primary arbiter attempt failed: {}; trying secondary",
                    primary_err
                );
                match self
                    .try_model(&self.config.secondary_model, &prompt, &opts)
                    .await
                {
                    Ok(v) => v,
                    Err(secondary_err) => Verdict::failed(format!(
                        "primary: {}; secondary: {}",
                        primary_err, secondary_err
                    )),
                }
            }
        };

        self.cache_put(key, verdict.clone());
        verdict
    }

    /// One model attempt. Errs when the call fails, the response is not
    /// JSON, or the confidence is below the configured floor.
    async fn try_model(&self, model: &str, prompt: &str, opts: &GenerateOptions) -> Result<Verdict> {
        let raw = self.backend.generate(model, prompt, opts).await?;
        let verdict = parse_verdict(&raw)
            .ok_or_else(|| Error::ChatBackend(format!("unparseable verdict: {:.120}", raw)))?;
        if verdict.confidence < self.config.min_confidence {
            return Err(Error::ChatBackend(format!(
                "confidence {} below floor {}",
                verdict.confidence, self.config.min_confidence
            )));
        }
        Ok(verdict)
    }

    fn cache_get(&self, key: &(String, String)) -> Option<Verdict> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_put(&self, key: (String, String), verdict: Verdict) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, verdict);
    }
}

fn build_prompt(bill_item: &str, tieup_item: &str) -> String {
    format!(
        "You compare hospital bill line items against a rate sheet.\n\
         Bill item: {:?}\n\
         Rate sheet item: {:?}\n\
         Do these name the same billable item or service?\n\
         Answer with strict JSON only, no prose:\n\
         {{\"match\": <bool>, \"confidence\": <float 0..1>, \"normalized_name\": <string>}}",
        bill_item, tieup_item
    )
}

/// Pull the first JSON object out of a model response; models wrap JSON in
/// prose and code fences often enough that plain `from_str` is not enough.
fn parse_verdict(raw: &str) -> Option<Verdict> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let verdict: Verdict = serde_json::from_str(&raw[start..=end]).ok()?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return None;
    }
    Some(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: responses keyed by model name.
    struct Scripted {
        by_model: HashMap<String, std::result::Result<String, String>>,
        calls: std::sync::Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(entries: &[(&str, std::result::Result<&str, &str>)]) -> Self {
            Self {
                by_model: entries
                    .iter()
                    .map(|(m, r)| {
                        (
                            m.to_string(),
                            r.map(str::to_string).map_err(str::to_string),
                        )
                    })
                    .collect(),
                calls: std::sync::Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn generate(
            &self,
            model: &str,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.by_model.get(model) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(reason)) => Err(Error::ChatBackend(reason.clone())),
                None => Err(Error::ChatBackend(format!("unknown model {}", model))),
            }
        }
    }

    fn config() -> ArbiterConfig {
        ArbiterConfig {
            primary_model: "primary".to_string(),
            secondary_model: "secondary".to_string(),
            ..ArbiterConfig::default()
        }
    }

    #[test]
    fn test_parse_verdict_strict_json() {
        let v = parse_verdict(r#"{"match": true, "confidence": 0.93, "normalized_name": "mri brain"}"#)
            .unwrap();
        assert!(v.is_match);
        assert!((v.confidence - 0.93).abs() < 1e-9);
    }

    #[test]
    fn test_parse_verdict_with_fences_and_prose() {
        let raw = "Sure, here you go:\n```json\n{\"match\": false, \"confidence\": 0.8}\n```";
        let v = parse_verdict(raw).unwrap();
        assert!(!v.is_match);
    }

    #[test]
    fn test_parse_verdict_rejects_garbage_and_bad_confidence() {
        assert!(parse_verdict("no json here").is_none());
        assert!(parse_verdict(r#"{"match": true, "confidence": 3.5}"#).is_none());
    }

    #[tokio::test]
    async fn test_primary_verdict_accepted() {
        let backend = Scripted::new(&[(
            "primary",
            Ok(r#"{"match": true, "confidence": 0.9, "normalized_name": "mri brain"}"#),
        )]);
        let arbiter = Arbiter::new(Box::new(backend), config());
        let v = arbiter.decide("mri brain scan", "mri brain").await;
        assert!(v.is_match);
        assert!(v.error.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_falls_back_to_secondary() {
        let backend = Scripted::new(&[
            ("primary", Ok(r#"{"match": true, "confidence": 0.3}"#)),
            ("secondary", Ok(r#"{"match": true, "confidence": 0.85}"#)),
        ]);
        let arbiter = Arbiter::new(Box::new(backend), config());
        let v = arbiter.decide("a", "b").await;
        assert!(v.is_match);
        assert!((v.confidence - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_both_models_failing_yields_non_match() {
        let backend = Scripted::new(&[
            ("primary", Err("connection refused")),
            ("secondary", Ok("not json at all")),
        ]);
        let arbiter = Arbiter::new(Box::new(backend), config());
        let v = arbiter.decide("a", "b").await;
        assert!(!v.is_match);
        assert_eq!(v.confidence, 0.0);
        assert!(v.error.as_deref().unwrap().contains("primary"));
    }

    #[tokio::test]
    async fn test_verdicts_are_memoized() {
        let backend = Scripted::new(&[(
            "primary",
            Ok(r#"{"match": true, "confidence": 0.9}"#),
        )]);
        let calls = std::sync::Arc::clone(&backend.calls);
        let arbiter = Arbiter::new(Box::new(backend), config());
        let first = arbiter.decide("x", "y").await;
        let second = arbiter.decide("x", "y").await;
        assert!(first.is_match && second.is_match);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_backend_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "{\"match\": true, \"confidence\": 0.9}"}"#)
            .create_async()
            .await;

        let backend = HttpChatBackend::new(&server.url()).unwrap();
        let opts = GenerateOptions {
            temperature: 0.1,
            max_tokens: 128,
            timeout: Duration::from_secs(5),
        };
        let raw = backend.generate("primary", "prompt", &opts).await.unwrap();
        assert!(parse_verdict(&raw).unwrap().is_match);
        mock.assert_async().await;
    }
}
