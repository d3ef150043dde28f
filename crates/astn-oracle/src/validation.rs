//! Shadow validation of raw `score_opportunities` tool input.
//!
//! Oracle output is parsed leniently into the best shape available. Every deviation from the
//! tool contract is recorded as an issue instead of failing the batch, and the caller gets a
//! [`ValidatedResponse`] telling it whether the data was clean.

use std::collections::HashSet;

use astn_core::{
    GrowthArea, MatchExplanation, MatchProbability, MatchTier, Opportunity, Priority,
    Recommendation, RecommendationKind, ScoredMatch,
};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

const INTERVIEW_CHANCES: [&str; 3] = ["Strong chance", "Good chance", "Moderate chance"];
const CONFIDENCE_LEVELS: [&str; 3] = ["HIGH", "MEDIUM", "LOW"];

/// One match as the oracle phrased it. The id is still unresolved text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMatch {
    pub opportunity_id: String,
    pub tier: MatchTier,
    pub score: f64,
    pub strengths: Vec<String>,
    pub gap: Option<String>,
    pub interview_chance: String,
    pub ranking: String,
    pub confidence: String,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScoringResponse {
    pub matches: Vec<RawMatch>,
    pub growth_areas: Vec<GrowthArea>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedResponse {
    Validated(ScoringResponse),
    /// Best-effort parse of output that broke the tool contract.
    RawFallback {
        response: ScoringResponse,
        issues: Vec<String>,
    },
}

impl ValidatedResponse {
    pub fn response(&self) -> &ScoringResponse {
        match self {
            Self::Validated(response) | Self::RawFallback { response, .. } => response,
        }
    }

    pub fn into_response(self) -> ScoringResponse {
        match self {
            Self::Validated(response) | Self::RawFallback { response, .. } => response,
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(self, Self::Validated(_))
    }

    pub fn issues(&self) -> &[String] {
        match self {
            Self::Validated(_) => &[],
            Self::RawFallback { issues, .. } => issues,
        }
    }
}

pub fn validate_scoring_response(input: &JsonValue) -> ValidatedResponse {
    let mut issues = Vec::new();
    let mut response = ScoringResponse::default();

    let Some(root) = input.as_object() else {
        issues.push("tool input is not an object".to_string());
        return ValidatedResponse::RawFallback { response, issues };
    };

    match root.get("matches").and_then(JsonValue::as_array) {
        Some(items) => {
            for (idx, item) in items.iter().enumerate() {
                if let Some(raw) = parse_match(idx, item, &mut issues) {
                    response.matches.push(raw);
                }
            }
        }
        None => issues.push("matches: missing or not an array".to_string()),
    }

    match root.get("growthAreas") {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Array(areas)) => {
            for (idx, area) in areas.iter().enumerate() {
                if let Some(area) = parse_growth_area(idx, area, &mut issues) {
                    response.growth_areas.push(area);
                }
            }
        }
        Some(_) => issues.push("growthAreas: not an array".to_string()),
    }

    if issues.is_empty() {
        ValidatedResponse::Validated(response)
    } else {
        ValidatedResponse::RawFallback { response, issues }
    }
}

fn parse_match(idx: usize, item: &JsonValue, issues: &mut Vec<String>) -> Option<RawMatch> {
    let Some(obj) = item.as_object() else {
        issues.push(format!("matches[{idx}]: not an object"));
        return None;
    };

    let Some(opportunity_id) = string_field(obj, "opportunityId") else {
        issues.push(format!("matches[{idx}].opportunityId: missing"));
        return None;
    };

    let tier = match string_field(obj, "tier").as_deref().and_then(MatchTier::parse) {
        Some(tier) => tier,
        None => {
            issues.push(format!("matches[{idx}].tier: missing or unknown"));
            return None;
        }
    };

    let score = match obj.get("score").and_then(coerce_number) {
        Some(score) if (0.0..=100.0).contains(&score) => score,
        Some(score) => {
            issues.push(format!("matches[{idx}].score: {score} outside 0-100"));
            score.clamp(0.0, 100.0)
        }
        None => {
            issues.push(format!("matches[{idx}].score: missing or not numeric"));
            return None;
        }
    };

    let strengths = match obj.get("strengths").and_then(JsonValue::as_array) {
        Some(values) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>(),
        None => Vec::new(),
    };
    if !(2..=4).contains(&strengths.len()) {
        issues.push(format!(
            "matches[{idx}].strengths: expected 2-4 items, got {}",
            strengths.len()
        ));
    }

    let interview_chance = string_field(obj, "interviewChance").unwrap_or_default();
    if !INTERVIEW_CHANCES.contains(&interview_chance.as_str()) {
        issues.push(format!("matches[{idx}].interviewChance: {interview_chance:?}"));
    }

    let ranking = string_field(obj, "ranking").unwrap_or_default();
    if ranking.is_empty() {
        issues.push(format!("matches[{idx}].ranking: missing"));
    }

    let confidence = string_field(obj, "confidence").unwrap_or_default();
    if !CONFIDENCE_LEVELS.contains(&confidence.as_str()) {
        issues.push(format!("matches[{idx}].confidence: {confidence:?}"));
    }

    let mut recommendations = Vec::new();
    match obj.get("recommendations") {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Array(values)) => {
            for (ridx, value) in values.iter().enumerate() {
                match parse_recommendation(value) {
                    Some(rec) => recommendations.push(rec),
                    None => issues.push(format!("matches[{idx}].recommendations[{ridx}]: invalid")),
                }
            }
        }
        Some(_) => issues.push(format!("matches[{idx}].recommendations: not an array")),
    }
    if recommendations.is_empty() {
        issues.push(format!("matches[{idx}].recommendations: empty"));
    }

    Some(RawMatch {
        opportunity_id,
        tier,
        score,
        strengths,
        gap: string_field(obj, "gap").filter(|gap| !gap.trim().is_empty()),
        interview_chance,
        ranking,
        confidence,
        recommendations,
    })
}

fn parse_recommendation(value: &JsonValue) -> Option<Recommendation> {
    let obj = value.as_object()?;
    Some(Recommendation {
        kind: RecommendationKind::parse(obj.get("type")?.as_str()?)?,
        action: obj.get("action")?.as_str()?.to_string(),
        priority: Priority::parse(obj.get("priority")?.as_str()?)?,
    })
}

fn parse_growth_area(idx: usize, value: &JsonValue, issues: &mut Vec<String>) -> Option<GrowthArea> {
    let obj = value.as_object();
    let theme = obj.and_then(|o| string_field(o, "theme"));
    let items = obj
        .and_then(|o| o.get("items"))
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        });
    match (theme, items) {
        (Some(theme), Some(items)) => Some(GrowthArea { theme, items }),
        _ => {
            issues.push(format!("growthAreas[{idx}]: needs theme and items"));
            None
        }
    }
}

fn string_field(obj: &Map<String, JsonValue>, key: &str) -> Option<String> {
    obj.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

/// Numbers pass through; numeric strings are coerced.
fn coerce_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Matches whose ids resolved to an opportunity of the batch that was sent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedBatch {
    pub matches: Vec<ScoredMatch>,
    /// Ids that were not in the batch, did not parse, or repeated an earlier match.
    pub dropped_ids: Vec<String>,
}

pub fn resolve_matches(response: &ScoringResponse, batch: &[Opportunity]) -> ResolvedBatch {
    let sent: HashSet<Uuid> = batch.iter().map(|opp| opp.id).collect();
    let mut seen = HashSet::new();
    let mut resolved = ResolvedBatch::default();

    for raw in &response.matches {
        let id = match Uuid::parse_str(raw.opportunity_id.trim()) {
            Ok(id) if sent.contains(&id) && seen.insert(id) => id,
            _ => {
                resolved.dropped_ids.push(raw.opportunity_id.clone());
                continue;
            }
        };
        resolved.matches.push(ScoredMatch {
            opportunity_id: id,
            tier: raw.tier,
            score: raw.score,
            explanation: MatchExplanation {
                strengths: raw.strengths.clone(),
                gap: raw.gap.clone(),
            },
            probability: MatchProbability {
                interview_chance: raw.interview_chance.clone(),
                ranking: raw.ranking.clone(),
                confidence: raw.confidence.clone(),
            },
            recommendations: raw.recommendations.clone(),
        });
    }

    resolved
}
