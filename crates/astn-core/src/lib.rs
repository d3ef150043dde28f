//! Core domain model and run-state contracts for ASTN matching.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "astn-core";

/// Opportunities scored per oracle call.
pub const BATCH_SIZE: usize = 15;
/// Upper bound on the candidate pool of a single run.
pub const CANDIDATE_LIMIT: usize = 50;
/// Rate-limited attempts allowed per batch before it is skipped.
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrivacySettings {
    /// Organizations whose opportunities must never be matched for this profile.
    #[serde(default)]
    pub hidden_from_orgs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EducationEntry {
    pub institution: String,
    pub degree: Option<String>,
    pub field: Option<String>,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    #[serde(default)]
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkEntry {
    pub organization: String,
    pub title: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current: bool,
    pub description: Option<String>,
}

/// Candidate profile as read by the matching pipeline. Owned elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Profile {
    pub id: Uuid,
    pub name: Option<String>,
    pub pronouns: Option<String>,
    pub location: Option<String>,
    pub headline: Option<String>,
    #[serde(default)]
    pub education: Vec<EducationEntry>,
    #[serde(default)]
    pub work_history: Vec<WorkEntry>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub career_goals: Option<String>,
    #[serde(default)]
    pub ai_safety_interests: Vec<String>,
    pub seeking: Option<String>,
    pub enrichment_summary: Option<String>,
    #[serde(default)]
    pub privacy: PrivacySettings,
}

impl Profile {
    pub fn hidden_orgs(&self) -> &[String] {
        &self.privacy.hidden_from_orgs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    #[default]
    Active,
    Archived,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Open opportunity as read by the matching pipeline. Owned elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(default)]
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub organization: String,
    pub location: String,
    #[serde(default)]
    pub is_remote: bool,
    pub role_type: String,
    pub experience_level: Option<String>,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub status: OpportunityStatus,
    pub deadline: Option<DateTime<Utc>>,
}

impl Opportunity {
    /// Active opportunity with placeholder descriptive fields.
    pub fn active(id: Uuid, title: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            organization: organization.into(),
            location: "Remote".to_string(),
            is_remote: true,
            role_type: "full-time".to_string(),
            experience_level: None,
            description: String::new(),
            requirements: Vec::new(),
            status: OpportunityStatus::Active,
            deadline: None,
        }
    }

    /// Active, not past its deadline, and not from an organization the profile hides.
    pub fn is_candidate(&self, hidden_orgs: &[String], now: DateTime<Utc>) -> bool {
        if self.status != OpportunityStatus::Active {
            return false;
        }
        if hidden_orgs.iter().any(|org| org == &self.organization) {
            return false;
        }
        match self.deadline {
            Some(deadline) => deadline >= now,
            None => true,
        }
    }
}

/// Filters `opportunities` down to the candidate pool, preserving input order, capped at `limit`.
pub fn candidate_pool(
    opportunities: impl IntoIterator<Item = Opportunity>,
    hidden_orgs: &[String],
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<Opportunity> {
    opportunities
        .into_iter()
        .filter(|opp| opp.is_candidate(hidden_orgs, now))
        .take(limit)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Great,
    Good,
    Exploring,
}

impl MatchTier {
    pub const ALL: [MatchTier; 3] = [MatchTier::Great, MatchTier::Good, MatchTier::Exploring];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Great => "great",
            Self::Good => "good",
            Self::Exploring => "exploring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "great" => Some(Self::Great),
            "good" => Some(Self::Good),
            "exploring" => Some(Self::Exploring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationKind {
    Specific,
    Skill,
    Experience,
}

impl RecommendationKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "specific" => Some(Self::Specific),
            "skill" => Some(Self::Skill),
            "experience" => Some(Self::Experience),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub action: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchExplanation {
    pub strengths: Vec<String>,
    pub gap: Option<String>,
}

/// Interview-probability block. Labels are kept as the oracle phrased them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchProbability {
    pub interview_chance: String,
    pub ranking: String,
    pub confidence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Active,
    Saved,
    Dismissed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Saved => "saved",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "saved" => Some(Self::Saved),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }
}

/// One oracle judgment whose opportunity id has been resolved against the batch that was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    pub opportunity_id: Uuid,
    pub tier: MatchTier,
    pub score: f64,
    pub explanation: MatchExplanation,
    pub probability: MatchProbability,
    pub recommendations: Vec<Recommendation>,
}

/// Persisted match, keyed by `(profile_id, opportunity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub profile_id: Uuid,
    pub opportunity_id: Uuid,
    pub tier: MatchTier,
    pub score: f64,
    pub explanation: MatchExplanation,
    pub probability: MatchProbability,
    pub recommendations: Vec<Recommendation>,
    pub is_new: bool,
    pub computed_at: DateTime<Utc>,
    pub model_version: String,
    pub status: MatchStatus,
    /// Run that last wrote this record.
    pub run_seq: u64,
}

impl MatchRecord {
    pub fn from_scored(
        profile_id: Uuid,
        scored: ScoredMatch,
        is_new: bool,
        computed_at: DateTime<Utc>,
        model_version: impl Into<String>,
        run_seq: u64,
    ) -> Self {
        Self {
            profile_id,
            opportunity_id: scored.opportunity_id,
            tier: scored.tier,
            score: scored.score,
            explanation: scored.explanation,
            probability: scored.probability,
            recommendations: scored.recommendations,
            is_new,
            computed_at,
            model_version: model_version.into(),
            status: MatchStatus::default(),
            run_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthArea {
    pub theme: String,
    pub items: Vec<String>,
}

/// Number of batches needed to cover `pool_size` opportunities.
pub fn total_batches(pool_size: usize, batch_size: usize) -> usize {
    pool_size.div_ceil(batch_size.max(1))
}

/// Index range of batch `batch_index` within a pool of `pool_size`. Empty past the end.
/// A zero `batch_size` is treated as 1, as in [`total_batches`].
pub fn batch_range(batch_index: usize, batch_size: usize, pool_size: usize) -> Range<usize> {
    let batch_size = batch_size.max(1);
    let start = batch_index.saturating_mul(batch_size).min(pool_size);
    let end = batch_index
        .saturating_add(1)
        .saturating_mul(batch_size)
        .min(pool_size);
    start..end
}

/// Resume token carried between scheduled batch steps. Nothing else survives a handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub profile_id: Uuid,
    /// Per-profile fencing token handed out by the match store when the run began.
    pub run_seq: u64,
    pub batch_index: usize,
    pub total_batches: usize,
    pub retry_count: u32,
    pub previous_opp_ids: Vec<Uuid>,
    pub accumulated_growth_areas: Vec<GrowthArea>,
    pub run_timestamp: DateTime<Utc>,
    /// Ordered candidate ids captured at run start. `None` re-derives the pool every batch.
    #[serde(default)]
    pub candidate_ids: Option<Vec<Uuid>>,
}

impl RunState {
    pub fn first_batch(
        profile_id: Uuid,
        run_seq: u64,
        total_batches: usize,
        previous_opp_ids: Vec<Uuid>,
        run_timestamp: DateTime<Utc>,
        candidate_ids: Option<Vec<Uuid>>,
    ) -> Self {
        Self {
            profile_id,
            run_seq,
            batch_index: 0,
            total_batches,
            retry_count: 0,
            previous_opp_ids,
            accumulated_growth_areas: Vec::new(),
            run_timestamp,
            candidate_ids,
        }
    }

    pub fn is_last_batch(&self) -> bool {
        self.batch_index + 1 >= self.total_batches
    }

    /// Same batch, one more attempt. Everything else is carried unchanged.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    /// Next batch with a fresh retry budget and the updated growth areas.
    pub fn advanced(&self, accumulated_growth_areas: Vec<GrowthArea>) -> Self {
        Self {
            batch_index: self.batch_index + 1,
            retry_count: 0,
            accumulated_growth_areas,
            ..self.clone()
        }
    }

    pub fn was_previously_matched(&self, opportunity_id: &Uuid) -> bool {
        self.previous_opp_ids.contains(opportunity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn thirty_seven_candidates_make_three_batches() {
        assert_eq!(total_batches(37, BATCH_SIZE), 3);
        let sizes = (0..3)
            .map(|i| batch_range(i, BATCH_SIZE, 37).len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![15, 15, 7]);
        assert!(batch_range(3, BATCH_SIZE, 37).is_empty());
        assert_eq!(total_batches(0, BATCH_SIZE), 0);
        assert_eq!(total_batches(15, BATCH_SIZE), 1);
    }

    #[test]
    fn zero_batch_size_plans_single_item_batches() {
        assert_eq!(total_batches(3, 0), 3);
        assert_eq!(batch_range(0, 0, 3), 0..1);
        assert_eq!(batch_range(2, 0, 3), 2..3);
        assert!(batch_range(3, 0, 3).is_empty());
    }

    #[test]
    fn candidate_pool_drops_hidden_archived_and_expired() {
        let mut hidden = Opportunity::active(Uuid::new_v4(), "Researcher", "Acme Corp");
        hidden.deadline = Some(now() + Duration::days(3));
        let mut archived = Opportunity::active(Uuid::new_v4(), "Engineer", "Open Lab");
        archived.status = OpportunityStatus::Archived;
        let mut expired = Opportunity::active(Uuid::new_v4(), "Fellow", "Open Lab");
        expired.deadline = Some(now() - Duration::days(1));
        let mut upcoming = Opportunity::active(Uuid::new_v4(), "Analyst", "Open Lab");
        upcoming.deadline = Some(now() + Duration::days(1));
        let open = Opportunity::active(Uuid::new_v4(), "Policy Lead", "Gov Team");

        let pool = candidate_pool(
            vec![hidden, archived, expired, upcoming.clone(), open.clone()],
            &["Acme Corp".to_string()],
            now(),
            CANDIDATE_LIMIT,
        );
        assert_eq!(pool, vec![upcoming, open]);
    }

    #[test]
    fn candidate_pool_is_capped() {
        let opps = (0..60).map(|i| Opportunity::active(Uuid::new_v4(), format!("Role {i}"), "Org"));
        assert_eq!(candidate_pool(opps, &[], now(), CANDIDATE_LIMIT).len(), 50);
    }

    #[test]
    fn advancing_resets_retry_count() {
        let state = RunState::first_batch(Uuid::new_v4(), 1, 3, vec![], now(), None);
        let retried = state.retried().retried();
        assert_eq!(retried.retry_count, 2);
        assert_eq!(retried.batch_index, 0);

        let growth = vec![GrowthArea {
            theme: "Skills to build".into(),
            items: vec!["Interpretability".into()],
        }];
        let next = retried.advanced(growth.clone());
        assert_eq!(next.batch_index, 1);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.accumulated_growth_areas, growth);
        assert!(!next.is_last_batch());
        assert!(next.advanced(growth).is_last_batch());
    }

    #[test]
    fn resume_token_survives_json_handoff() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let state = RunState::first_batch(Uuid::new_v4(), 7, 1, vec![ids[0]], now(), Some(ids));
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn tier_parsing_is_lenient_about_case() {
        assert_eq!(MatchTier::parse(" Great "), Some(MatchTier::Great));
        assert_eq!(MatchTier::parse("stretch"), None);
    }
}
