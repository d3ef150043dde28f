//! Scoring-oracle contract, failure classification, prompt context, and output validation.

use std::time::Duration;

use astn_core::{Opportunity, Profile};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod anthropic;
pub mod prompts;
pub mod validation;

pub use anthropic::{extract_tool_input, AnthropicConfig, AnthropicOracle, DEFAULT_MODEL};
pub use validation::{
    resolve_matches, validate_scoring_response, ResolvedBatch, ScoringResponse, ValidatedResponse,
};

pub const CRATE_NAME: &str = "astn-oracle";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("rate limited by oracle (429): {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("oracle returned http {status}: {message}")]
    Api { status: u16, message: String },
    #[error("oracle request failed: {0}")]
    Transport(String),
    #[error("oracle response could not be decoded: {0}")]
    MalformedResponse(String),
    #[error("oracle response contained no tool_use block")]
    MissingToolUse,
    #[error("{0}")]
    Other(String),
}

impl OracleError {
    /// Structured HTTP-like status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Throttling; retried with exponential backoff.
    RateLimited,
    /// Anything else; retried blindly once.
    Other,
}

/// Message mentions "rate" or "429" (any case), or the status is 429.
pub fn looks_rate_limited(message: &str, status: Option<u16>) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("rate") || message.contains("429") || status == Some(429)
}

pub fn classify_failure(err: &OracleError) -> FailureKind {
    if looks_rate_limited(&err.to_string(), err.status()) {
        FailureKind::RateLimited
    } else {
        FailureKind::Other
    }
}

/// One forced structured-output call for a batch of opportunities.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRequest {
    pub system_prompt: String,
    pub profile_context: String,
    pub opportunities_context: String,
    pub tool: JsonValue,
}

impl ScoringRequest {
    pub fn for_batch(profile: &Profile, batch: &[Opportunity]) -> Self {
        Self {
            system_prompt: prompts::MATCHING_SYSTEM_PROMPT.to_string(),
            profile_context: prompts::build_profile_context(profile),
            opportunities_context: prompts::build_opportunities_context(batch),
            tool: prompts::score_opportunities_tool(),
        }
    }

    pub fn user_message(&self) -> String {
        format!(
            "{}\n\n---\n\n{}\n\nScore all opportunities for this candidate. Include only opportunities with tier great, good, or exploring - skip any that have no reasonable fit.",
            self.profile_context, self.opportunities_context
        )
    }
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Recorded on every match this oracle produces.
    fn model_version(&self) -> &str;

    /// Returns the raw tool input; callers validate it.
    async fn score(&self, request: &ScoringRequest) -> Result<JsonValue, OracleError>;
}
