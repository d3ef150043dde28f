//! Profile/opportunity readers and the match store used by the matching pipeline.

use std::collections::BTreeMap;

use astn_core::{GrowthArea, MatchRecord, MatchStatus, MatchTier, Opportunity, Profile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{connect_pool, PgStore};

pub const CRATE_NAME: &str = "astn-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ProfileReader: Send + Sync {
    /// `Ok(None)` when the profile does not exist.
    async fn fetch_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>>;

    async fn list_profile_ids(&self) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait OpportunityReader: Send + Sync {
    /// Active, non-expired opportunities outside `hidden_orgs`, in stable order, at most `limit`.
    async fn candidate_pool(
        &self,
        hidden_orgs: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>>;

    /// Current rows for `ids`, in the order given. Unknown ids are omitted.
    async fn fetch_opportunities(&self, ids: &[Uuid]) -> StoreResult<Vec<Opportunity>>;
}

/// Arguments of one batch-save call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveBatch {
    pub profile_id: Uuid,
    pub run_seq: u64,
    pub batch_index: usize,
    /// Already tagged with `is_new`.
    pub records: Vec<MatchRecord>,
    pub model_version: String,
    pub is_last_batch: bool,
    pub previous_opp_ids: Vec<Uuid>,
    pub accumulated_growth_areas: Vec<GrowthArea>,
    pub run_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied { saved: usize, removed: usize },
    /// A newer run for the same profile has begun; nothing was written.
    Superseded { latest_run_seq: u64 },
}

impl WriteOutcome {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Hands out the next fencing token for `profile_id`. Tokens strictly increase per profile.
    async fn begin_run(&self, profile_id: Uuid) -> StoreResult<u64>;

    /// Most recent token handed out for `profile_id`, 0 before the first run.
    async fn latest_run_seq(&self, profile_id: Uuid) -> StoreResult<u64>;

    /// Removes every match and growth area of the profile.
    async fn clear_all_for_profile(&self, profile_id: Uuid, run_seq: u64) -> StoreResult<WriteOutcome>;

    /// Upserts the batch's records, keeping any user-set status. On the last batch, also
    /// drops matches not written by this run and commits the accumulated growth areas.
    async fn save_batch_results(&self, batch: SaveBatch) -> StoreResult<WriteOutcome>;

    async fn list_matches(&self, profile_id: Uuid) -> StoreResult<Vec<MatchRecord>>;

    async fn growth_areas(&self, profile_id: Uuid) -> StoreResult<Vec<GrowthArea>>;

    /// Clears `is_new` on the profile's matches. Returns how many were flipped.
    async fn mark_matches_viewed(&self, profile_id: Uuid) -> StoreResult<usize>;

    /// Returns false when no such match exists.
    async fn set_match_status(
        &self,
        profile_id: Uuid,
        opportunity_id: Uuid,
        status: MatchStatus,
    ) -> StoreResult<bool>;
}

/// Read model of a profile's matches as shown to the candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOverview {
    pub profile_id: Uuid,
    pub tiers: BTreeMap<MatchTier, Vec<MatchRecord>>,
    pub new_match_count: usize,
    /// Oldest computation time among the profile's matches.
    pub computed_at: Option<DateTime<Utc>>,
    pub growth_areas: Vec<GrowthArea>,
    pub needs_computation: bool,
}

impl MatchOverview {
    pub fn from_records(
        profile_id: Uuid,
        records: Vec<MatchRecord>,
        growth_areas: Vec<GrowthArea>,
    ) -> Self {
        let needs_computation = records.is_empty();
        let new_match_count = records.iter().filter(|r| r.is_new).count();
        let computed_at = records.iter().map(|r| r.computed_at).min();

        let mut tiers: BTreeMap<MatchTier, Vec<MatchRecord>> =
            MatchTier::ALL.iter().map(|tier| (*tier, Vec::new())).collect();
        for record in records {
            tiers.entry(record.tier).or_default().push(record);
        }
        for bucket in tiers.values_mut() {
            bucket.sort_by(|a, b| b.score.total_cmp(&a.score));
        }

        Self {
            profile_id,
            tiers,
            new_match_count,
            computed_at,
            growth_areas,
            needs_computation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astn_core::{MatchExplanation, MatchProbability, ScoredMatch};
    use chrono::{Duration, TimeZone};

    fn record(tier: MatchTier, score: f64, is_new: bool, minutes: i64) -> MatchRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap() + Duration::minutes(minutes);
        MatchRecord::from_scored(
            Uuid::nil(),
            ScoredMatch {
                opportunity_id: Uuid::new_v4(),
                tier,
                score,
                explanation: MatchExplanation::default(),
                probability: MatchProbability::default(),
                recommendations: vec![],
            },
            is_new,
            at,
            "model-a",
            1,
        )
    }

    #[test]
    fn overview_groups_by_tier_and_sorts_by_score() {
        let overview = MatchOverview::from_records(
            Uuid::nil(),
            vec![
                record(MatchTier::Good, 61.0, false, 5),
                record(MatchTier::Great, 88.0, true, 3),
                record(MatchTier::Good, 74.0, true, 1),
                record(MatchTier::Great, 93.0, false, 2),
            ],
            vec![],
        );

        let great = &overview.tiers[&MatchTier::Great];
        assert_eq!(great.iter().map(|r| r.score).collect::<Vec<_>>(), vec![93.0, 88.0]);
        let good = &overview.tiers[&MatchTier::Good];
        assert_eq!(good.iter().map(|r| r.score).collect::<Vec<_>>(), vec![74.0, 61.0]);
        assert!(overview.tiers[&MatchTier::Exploring].is_empty());
        assert_eq!(overview.new_match_count, 2);
        assert_eq!(
            overview.computed_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 1, 0).single()
        );
        assert!(!overview.needs_computation);
    }

    #[test]
    fn empty_overview_needs_computation() {
        let overview = MatchOverview::from_records(Uuid::nil(), vec![], vec![]);
        assert!(overview.needs_computation);
        assert_eq!(overview.computed_at, None);
    }
}
