use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::prompts::TOOL_NAME;
use crate::{OracleError, ScoringOracle, ScoringRequest};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20241022";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct AnthropicConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_url: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }
}

impl AnthropicConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model: env::var("ASTN_ORACLE_MODEL").unwrap_or(defaults.model),
            max_tokens: env::var("ASTN_ORACLE_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tokens),
            timeout: env::var("ASTN_ORACLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            api_url: defaults.api_url,
        }
    }
}

/// Scores batches through the Anthropic Messages API with a forced tool call.
pub struct AnthropicOracle {
    client: Client,
    api_key: String,
    config: AnthropicConfig,
}

impl AnthropicOracle {
    /// Reads `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(config: AnthropicConfig) -> Result<Self, OracleError> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .map_err(|_| OracleError::Other("ANTHROPIC_API_KEY is not set".to_string()))?;
        Self::with_api_key(api_key, config)
    }

    pub fn with_api_key(api_key: impl Into<String>, config: AnthropicConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| OracleError::Transport(format!("building http client: {err}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    fn build_body(&self, request: &ScoringRequest) -> JsonValue {
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": request.system_prompt,
            "tools": [request.tool],
            "tool_choice": { "type": "tool", "name": TOOL_NAME },
            "messages": [
                { "role": "user", "content": request.user_message() }
            ]
        })
    }
}

impl std::fmt::Debug for AnthropicOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicOracle")
            .field("model", &self.config.model)
            .field("max_tokens", &self.config.max_tokens)
            .finish()
    }
}

#[async_trait]
impl ScoringOracle for AnthropicOracle {
    fn model_version(&self) -> &str {
        &self.config.model
    }

    async fn score(&self, request: &ScoringRequest) -> Result<JsonValue, OracleError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::RateLimited {
                message,
                retry_after,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|err| OracleError::MalformedResponse(err.to_string()))?;
        debug!(
            model = %self.config.model,
            stop_reason = body["stop_reason"].as_str().unwrap_or(""),
            "oracle response received"
        );
        extract_tool_input(&body)
    }
}

/// Pulls the `score_opportunities` input out of a Messages API response body.
pub fn extract_tool_input(body: &JsonValue) -> Result<JsonValue, OracleError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| OracleError::MalformedResponse("response has no content array".to_string()))?;
    blocks
        .iter()
        .find(|block| block["type"] == "tool_use" && block["name"] == TOOL_NAME)
        .map(|block| block["input"].clone())
        .ok_or(OracleError::MissingToolUse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = AnthropicConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn body_forces_the_scoring_tool() {
        let oracle = AnthropicOracle::with_api_key("test-key", AnthropicConfig::default()).unwrap();
        let request = ScoringRequest::for_batch(&astn_core::Profile::default(), &[]);
        let body = oracle.build_body(&request);
        assert_eq!(body["tool_choice"], json!({ "type": "tool", "name": "score_opportunities" }));
        assert_eq!(body["tools"][0]["name"], "score_opportunities");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(oracle.model_version(), DEFAULT_MODEL);
    }

    #[test]
    fn extracts_tool_input_after_text_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Scoring now." },
                { "type": "tool_use", "id": "tu_1", "name": "score_opportunities", "input": { "matches": [] } }
            ],
            "stop_reason": "tool_use"
        });
        assert_eq!(extract_tool_input(&body).unwrap(), json!({ "matches": [] }));
    }

    #[test]
    fn missing_tool_block_is_reported() {
        let body = json!({ "content": [{ "type": "text", "text": "no tool" }] });
        assert!(matches!(extract_tool_input(&body), Err(OracleError::MissingToolUse)));
        assert!(matches!(
            extract_tool_input(&json!({})),
            Err(OracleError::MalformedResponse(_))
        ));
    }
}
