use std::collections::{BTreeMap, HashMap};

use astn_core::{candidate_pool, GrowthArea, MatchRecord, MatchStatus, Opportunity, Profile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{MatchStore, OpportunityReader, ProfileReader, SaveBatch, StoreResult, WriteOutcome};

#[derive(Debug, Default)]
struct InMemoryState {
    profiles: BTreeMap<Uuid, Profile>,
    /// Insertion order is the pool order.
    opportunities: Vec<Opportunity>,
    matches: BTreeMap<(Uuid, Uuid), MatchRecord>,
    growth_areas: HashMap<Uuid, Vec<GrowthArea>>,
    latest_run_seq: HashMap<Uuid, u64>,
    save_log: Vec<SaveBatch>,
    clear_log: Vec<Uuid>,
}

impl InMemoryState {
    fn check_fence(&self, profile_id: Uuid, run_seq: u64) -> Option<WriteOutcome> {
        let latest = self.latest_run_seq.get(&profile_id).copied().unwrap_or(0);
        (run_seq < latest).then_some(WriteOutcome::Superseded {
            latest_run_seq: latest,
        })
    }
}

/// Process-local store backing tests and single-node local runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: Profile) {
        self.state.lock().await.profiles.insert(profile.id, profile);
    }

    /// Replaces an opportunity with the same id in place, or appends it.
    pub async fn upsert_opportunity(&self, opportunity: Opportunity) {
        let mut state = self.state.lock().await;
        match state.opportunities.iter_mut().find(|o| o.id == opportunity.id) {
            Some(existing) => *existing = opportunity,
            None => state.opportunities.push(opportunity),
        }
    }

    pub async fn remove_opportunity(&self, opportunity_id: Uuid) {
        self.state
            .lock()
            .await
            .opportunities
            .retain(|o| o.id != opportunity_id);
    }

    pub async fn insert_match(&self, record: MatchRecord) {
        self.state
            .lock()
            .await
            .matches
            .insert((record.profile_id, record.opportunity_id), record);
    }

    /// Every batch-save call received, including superseded ones.
    pub async fn save_log(&self) -> Vec<SaveBatch> {
        self.state.lock().await.save_log.clone()
    }

    pub async fn clear_log(&self) -> Vec<Uuid> {
        self.state.lock().await.clear_log.clone()
    }
}

#[async_trait]
impl ProfileReader for InMemoryStore {
    async fn fetch_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>> {
        Ok(self.state.lock().await.profiles.get(&profile_id).cloned())
    }

    async fn list_profile_ids(&self) -> StoreResult<Vec<Uuid>> {
        Ok(self.state.lock().await.profiles.keys().copied().collect())
    }
}

#[async_trait]
impl OpportunityReader for InMemoryStore {
    async fn candidate_pool(
        &self,
        hidden_orgs: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>> {
        let state = self.state.lock().await;
        Ok(candidate_pool(
            state.opportunities.iter().cloned(),
            hidden_orgs,
            now,
            limit,
        ))
    }

    async fn fetch_opportunities(&self, ids: &[Uuid]) -> StoreResult<Vec<Opportunity>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.opportunities.iter().find(|o| &o.id == id).cloned())
            .collect())
    }
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn begin_run(&self, profile_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let seq = state.latest_run_seq.entry(profile_id).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn latest_run_seq(&self, profile_id: Uuid) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .latest_run_seq
            .get(&profile_id)
            .copied()
            .unwrap_or(0))
    }

    async fn clear_all_for_profile(&self, profile_id: Uuid, run_seq: u64) -> StoreResult<WriteOutcome> {
        let mut state = self.state.lock().await;
        state.clear_log.push(profile_id);
        if let Some(superseded) = state.check_fence(profile_id, run_seq) {
            return Ok(superseded);
        }
        let before = state.matches.len();
        state.matches.retain(|(pid, _), _| *pid != profile_id);
        let removed = before - state.matches.len();
        state.growth_areas.remove(&profile_id);
        Ok(WriteOutcome::Applied { saved: 0, removed })
    }

    async fn save_batch_results(&self, batch: SaveBatch) -> StoreResult<WriteOutcome> {
        let mut state = self.state.lock().await;
        state.save_log.push(batch.clone());
        if let Some(superseded) = state.check_fence(batch.profile_id, batch.run_seq) {
            return Ok(superseded);
        }

        let saved = batch.records.len();
        for mut record in batch.records {
            let key = (record.profile_id, record.opportunity_id);
            if let Some(existing) = state.matches.get(&key) {
                record.status = existing.status;
            }
            state.matches.insert(key, record);
        }

        let mut removed = 0;
        if batch.is_last_batch {
            let before = state.matches.len();
            state
                .matches
                .retain(|(pid, _), r| *pid != batch.profile_id || r.run_seq == batch.run_seq);
            removed = before - state.matches.len();
            state
                .growth_areas
                .insert(batch.profile_id, batch.accumulated_growth_areas);
        }

        Ok(WriteOutcome::Applied { saved, removed })
    }

    async fn list_matches(&self, profile_id: Uuid) -> StoreResult<Vec<MatchRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .matches
            .range((profile_id, Uuid::nil())..=(profile_id, Uuid::max()))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn growth_areas(&self, profile_id: Uuid) -> StoreResult<Vec<GrowthArea>> {
        Ok(self
            .state
            .lock()
            .await
            .growth_areas
            .get(&profile_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_matches_viewed(&self, profile_id: Uuid) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let mut marked = 0;
        for ((pid, _), record) in state.matches.iter_mut() {
            if *pid == profile_id && record.is_new {
                record.is_new = false;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn set_match_status(
        &self,
        profile_id: Uuid,
        opportunity_id: Uuid,
        status: MatchStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.matches.get_mut(&(profile_id, opportunity_id)) {
            Some(record) => {
                record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astn_core::{MatchExplanation, MatchProbability, MatchTier, ScoredMatch};

    fn scored(opportunity_id: Uuid) -> ScoredMatch {
        ScoredMatch {
            opportunity_id,
            tier: MatchTier::Good,
            score: 70.0,
            explanation: MatchExplanation {
                strengths: vec!["Relevant research".into(), "Strong writing".into()],
                gap: None,
            },
            probability: MatchProbability {
                interview_chance: "Good chance".into(),
                ranking: "Likely top 20%".into(),
                confidence: "MEDIUM".into(),
            },
            recommendations: vec![],
        }
    }

    fn batch(profile_id: Uuid, run_seq: u64, opps: &[Uuid], is_last_batch: bool) -> SaveBatch {
        SaveBatch {
            profile_id,
            run_seq,
            batch_index: 0,
            records: opps
                .iter()
                .map(|id| MatchRecord::from_scored(profile_id, scored(*id), true, Utc::now(), "m", run_seq))
                .collect(),
            model_version: "m".into(),
            is_last_batch,
            previous_opp_ids: vec![],
            accumulated_growth_areas: vec![GrowthArea {
                theme: "Knowledge to deepen".into(),
                items: vec!["Evals".into()],
            }],
            run_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stale_writes_are_fenced_off() {
        let store = InMemoryStore::new();
        let profile_id = Uuid::new_v4();
        assert_eq!(store.latest_run_seq(profile_id).await.unwrap(), 0);
        let old_run = store.begin_run(profile_id).await.unwrap();
        let new_run = store.begin_run(profile_id).await.unwrap();
        assert!(new_run > old_run);
        assert_eq!(store.latest_run_seq(profile_id).await.unwrap(), new_run);

        let outcome = store
            .save_batch_results(batch(profile_id, old_run, &[Uuid::new_v4()], true))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Superseded { latest_run_seq: new_run });
        assert!(store.list_matches(profile_id).await.unwrap().is_empty());

        let outcome = store.clear_all_for_profile(profile_id, old_run).await.unwrap();
        assert!(outcome.is_superseded());
    }

    #[tokio::test]
    async fn last_batch_drops_matches_from_earlier_runs_and_keeps_status() {
        let store = InMemoryStore::new();
        let profile_id = Uuid::new_v4();
        let kept = Uuid::new_v4();
        let stale = Uuid::new_v4();

        let first = store.begin_run(profile_id).await.unwrap();
        store
            .save_batch_results(batch(profile_id, first, &[kept, stale], true))
            .await
            .unwrap();
        assert!(store
            .set_match_status(profile_id, kept, MatchStatus::Saved)
            .await
            .unwrap());

        let second = store.begin_run(profile_id).await.unwrap();
        let outcome = store
            .save_batch_results(batch(profile_id, second, &[kept], true))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { saved: 1, removed: 1 });

        let matches = store.list_matches(profile_id).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].opportunity_id, kept);
        assert_eq!(matches[0].status, MatchStatus::Saved);
        assert_eq!(matches[0].run_seq, second);
        assert_eq!(store.growth_areas(profile_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn growth_areas_only_commit_on_last_batch() {
        let store = InMemoryStore::new();
        let profile_id = Uuid::new_v4();
        let run = store.begin_run(profile_id).await.unwrap();
        store
            .save_batch_results(batch(profile_id, run, &[Uuid::new_v4()], false))
            .await
            .unwrap();
        assert!(store.growth_areas(profile_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_viewed_flips_only_new_matches() {
        let store = InMemoryStore::new();
        let profile_id = Uuid::new_v4();
        let run = store.begin_run(profile_id).await.unwrap();
        store
            .save_batch_results(batch(profile_id, run, &[Uuid::new_v4(), Uuid::new_v4()], true))
            .await
            .unwrap();
        assert_eq!(store.mark_matches_viewed(profile_id).await.unwrap(), 2);
        assert_eq!(store.mark_matches_viewed(profile_id).await.unwrap(), 0);
        assert!(!store
            .set_match_status(profile_id, Uuid::new_v4(), MatchStatus::Dismissed)
            .await
            .unwrap());
    }
}
