//! OpenAI-compatible chat-completions client
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! (hosted APIs, llama.cpp, vLLM, proxies).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};
use crate::ledger::cost::{TokenEstimator, WordCountEstimator};

/// Endpoint configuration for [`OpenAiCompatProvider`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Bearer token. Local servers accept any placeholder value.
    pub api_key: Option<String>,
    pub model: String,
    /// Hard timeout for a single call.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Chat-completions client
pub struct OpenAiCompatProvider {
    config: ProviderConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build a client. Fails when no API key is configured.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingCredentials(config.base_url.clone()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let start = Instant::now();

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt}
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.timeout)
                } else {
                    ProviderError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body, retry_after));
        }

        let resp_json: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout)
            } else {
                ProviderError::Parse(e.to_string())
            }
        })?;

        let completion = parse_chat_response(&resp_json, &self.config.model, request)?;

        debug!(
            kind = %request.kind,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Completion finished"
        );

        Ok(completion)
    }
}

/// Map a non-success HTTP status to a classified error.
pub fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Unauthorized(body),
        408 => ProviderError::Timeout(Duration::ZERO),
        500..=599 => ProviderError::Server {
            status,
            message: body,
        },
        _ => ProviderError::InvalidRequest {
            status,
            message: body,
        },
    }
}

/// Extract text and usage from a chat-completions response body.
///
/// Servers that omit `usage` are billed on an estimate of prompt and output
/// length.
pub fn parse_chat_response(
    resp_json: &serde_json::Value,
    default_model: &str,
    request: &CompletionRequest,
) -> Result<Completion, ProviderError> {
    let text = resp_json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::Parse("response has no choices[0].message.content".into()))?
        .to_string();

    if text.trim().is_empty() {
        return Err(ProviderError::Parse("empty completion".into()));
    }

    let usage = match (
        resp_json["usage"]["prompt_tokens"].as_u64(),
        resp_json["usage"]["completion_tokens"].as_u64(),
    ) {
        (Some(p), Some(c)) => TokenUsage::new(p as u32, c as u32),
        _ => {
            let estimator = WordCountEstimator::default();
            TokenUsage::new(
                estimator.estimate(&request.system) + estimator.estimate(&request.prompt),
                estimator.estimate(&text),
            )
        }
    };

    let model = resp_json["model"]
        .as_str()
        .unwrap_or(default_model)
        .to_string();

    Ok(Completion { text, usage, model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CallKind;

    fn request() -> CompletionRequest {
        CompletionRequest::new(CallKind::Drafting, "system words", "write a chapter")
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let err = OpenAiCompatProvider::new(ProviderConfig::default())
            .err()
            .expect("should fail without key");
        assert!(err.is_fatal());

        let blank = ProviderConfig {
            api_key: Some("  ".into()),
            ..Default::default()
        };
        assert!(OpenAiCompatProvider::new(blank).is_err());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let provider = OpenAiCompatProvider::new(ProviderConfig {
            base_url: "http://localhost:8080/v1/".into(),
            api_key: Some("not-needed".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_parse_response_with_usage() {
        let body = serde_json::json!({
            "model": "served-model",
            "choices": [{"message": {"role": "assistant", "content": "It was night."}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 45}
        });
        let completion = parse_chat_response(&body, "fallback", &request()).unwrap();
        assert_eq!(completion.text, "It was night.");
        assert_eq!(completion.usage, TokenUsage::new(120, 45));
        assert_eq!(completion.model, "served-model");
    }

    #[test]
    fn test_parse_response_estimates_missing_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "one two three four five six seven eight nine ten"}}]
        });
        let completion = parse_chat_response(&body, "fallback", &request()).unwrap();
        assert_eq!(completion.model, "fallback");
        assert_eq!(completion.usage.completion_tokens, 13);
        assert!(completion.usage.prompt_tokens > 0);
    }

    #[test]
    fn test_parse_response_rejects_empty_content() {
        let body = serde_json::json!({"choices": [{"message": {"content": "   "}}]});
        assert!(matches!(
            parse_chat_response(&body, "m", &request()),
            Err(ProviderError::Parse(_))
        ));
        let body = serde_json::json!({"error": "nope"});
        assert!(parse_chat_response(&body, "m", &request()).is_err());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, String::new(), Some(Duration::from_secs(3))),
            ProviderError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(classify_status(502, "bad gateway".into(), None).is_transient());
        assert!(classify_status(401, "no".into(), None).is_fatal());
        assert!(!classify_status(400, "bad".into(), None).is_transient());
    }
}
