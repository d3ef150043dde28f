//! One scheduled step of a match run.
//!
//! Each invocation scores at most one batch of the candidate pool and then hands the updated
//! [`RunState`] back to the scheduler: the same batch again after a failure, the next batch
//! after a courtesy delay, or nothing once the last batch is resolved. No memory survives
//! between invocations apart from the run state itself.

use std::sync::Arc;
use std::time::Duration;

use astn_core::{batch_range, GrowthArea, MatchRecord, Opportunity, Profile, RunState};
use astn_oracle::{
    classify_failure, resolve_matches, validate_scoring_response, FailureKind, OracleError,
    ScoringOracle, ScoringRequest,
};
use astn_storage::{SaveBatch, WriteOutcome};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::{MatchingConfig, MatchingContext, MatchingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadEnd {
    /// The batch's slice of the pool came back empty.
    EmptySlice,
    ProfileMissing,
}

/// What the oracle step contributed for a resolved batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Scoring {
    Scored {
        matches: usize,
        dropped_ids: Vec<String>,
        validated: bool,
    },
    /// Every snapshotted opportunity of the batch stopped being a candidate; the oracle was not called.
    Vacant,
    /// Retries were exhausted; the batch contributes no matches.
    Skipped(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    Next { batch_index: usize, delay: Duration },
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub batch_index: usize,
    pub scoring: Scoring,
    pub persisted: bool,
    pub next: ChainStep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    DeadEnd(DeadEnd),
    /// Same batch scheduled again.
    Rescheduled {
        failure: FailureKind,
        retry_count: u32,
        delay: Duration,
    },
    Resolved(BatchReport),
    /// A newer run owns the profile; this chain stops.
    Superseded { latest_run_seq: u64 },
}

enum BatchSlice {
    Opportunities(Vec<Opportunity>),
    Vacant,
    Empty,
}

pub struct BatchProcessor {
    config: MatchingConfig,
    ctx: MatchingContext,
    oracle: Arc<dyn ScoringOracle>,
}

impl BatchProcessor {
    pub fn new(config: MatchingConfig, ctx: MatchingContext, oracle: Arc<dyn ScoringOracle>) -> Self {
        Self { config, ctx, oracle }
    }

    fn model_version(&self) -> String {
        self.config
            .model_version
            .clone()
            .unwrap_or_else(|| self.oracle.model_version().to_string())
    }

    #[instrument(
        name = "match_batch",
        skip(self, state),
        fields(
            profile_id = %state.profile_id,
            run_seq = state.run_seq,
            batch_index = state.batch_index,
            retry_count = state.retry_count
        )
    )]
    pub async fn process(&self, state: RunState) -> Result<BatchOutcome, MatchingError> {
        let latest_run_seq = self.ctx.matches.latest_run_seq(state.profile_id).await?;
        if state.run_seq < latest_run_seq {
            info!(latest_run_seq, "newer run owns this profile, chain ends before scoring");
            return Ok(BatchOutcome::Superseded { latest_run_seq });
        }

        let Some(profile) = self.ctx.profiles.fetch_profile(state.profile_id).await? else {
            warn!("profile disappeared mid-run, chain ends");
            return Ok(BatchOutcome::DeadEnd(DeadEnd::ProfileMissing));
        };

        let batch = match self.load_slice(&profile, &state).await? {
            BatchSlice::Opportunities(batch) => batch,
            BatchSlice::Empty => {
                warn!(
                    total_batches = state.total_batches,
                    "batch slice is empty, pool shrank since planning; chain ends"
                );
                return Ok(BatchOutcome::DeadEnd(DeadEnd::EmptySlice));
            }
            BatchSlice::Vacant => {
                debug!("no snapshotted opportunity of this batch is still a candidate");
                let growth = state.accumulated_growth_areas.clone();
                return self
                    .persist_and_advance(&state, Vec::new(), growth, Scoring::Vacant)
                    .await;
            }
        };

        let request = ScoringRequest::for_batch(&profile, &batch);
        match self.oracle.score(&request).await {
            Ok(raw) => {
                let validated = validate_scoring_response(&raw);
                if !validated.is_validated() {
                    warn!(issues = ?validated.issues(), "oracle output failed validation, using best-effort parse");
                }
                let is_validated = validated.is_validated();
                let response = validated.into_response();
                let resolved = resolve_matches(&response, &batch);
                if !resolved.dropped_ids.is_empty() {
                    debug!(dropped = ?resolved.dropped_ids, "dropped matches for opportunities outside the batch");
                }

                let mut growth = state.accumulated_growth_areas.clone();
                growth.extend(response.growth_areas);

                let computed_at = Utc::now();
                let model_version = self.model_version();
                let records = resolved
                    .matches
                    .into_iter()
                    .map(|scored| {
                        let is_new = !state.was_previously_matched(&scored.opportunity_id);
                        MatchRecord::from_scored(
                            state.profile_id,
                            scored,
                            is_new,
                            computed_at,
                            model_version.clone(),
                            state.run_seq,
                        )
                    })
                    .collect::<Vec<_>>();

                let scoring = Scoring::Scored {
                    matches: records.len(),
                    dropped_ids: resolved.dropped_ids,
                    validated: is_validated,
                };
                self.persist_and_advance(&state, records, growth, scoring).await
            }
            Err(err) => self.handle_failure(&state, err).await,
        }
    }

    async fn load_slice(&self, profile: &Profile, state: &RunState) -> Result<BatchSlice, MatchingError> {
        let now = Utc::now();
        match &state.candidate_ids {
            Some(ids) => {
                let range = batch_range(state.batch_index, self.config.batch_size, ids.len());
                if range.is_empty() {
                    return Ok(BatchSlice::Empty);
                }
                let batch = self
                    .ctx
                    .opportunities
                    .fetch_opportunities(&ids[range])
                    .await?
                    .into_iter()
                    .filter(|opp| opp.is_candidate(profile.hidden_orgs(), now))
                    .collect::<Vec<_>>();
                Ok(if batch.is_empty() {
                    BatchSlice::Vacant
                } else {
                    BatchSlice::Opportunities(batch)
                })
            }
            None => {
                let pool = self
                    .ctx
                    .opportunities
                    .candidate_pool(profile.hidden_orgs(), now, self.config.candidate_limit)
                    .await?;
                let range = batch_range(state.batch_index, self.config.batch_size, pool.len());
                Ok(if range.is_empty() {
                    BatchSlice::Empty
                } else {
                    BatchSlice::Opportunities(pool[range].to_vec())
                })
            }
        }
    }

    async fn handle_failure(&self, state: &RunState, err: OracleError) -> Result<BatchOutcome, MatchingError> {
        let failure = classify_failure(&err);
        let backoff = self.config.backoff();

        let retry_delay = match failure {
            FailureKind::RateLimited if backoff.retries_left(state.retry_count) => {
                let mut delay = backoff.delay_for_attempt(state.retry_count);
                if let OracleError::RateLimited {
                    retry_after: Some(after),
                    ..
                } = &err
                {
                    delay = delay.max(*after).min(backoff.max_delay);
                }
                Some(delay)
            }
            FailureKind::Other if state.retry_count == 0 => Some(backoff.base_delay),
            _ => None,
        };

        match retry_delay {
            Some(delay) => {
                let next = state.retried();
                let retry_count = next.retry_count;
                self.ctx.scheduler.schedule_after(delay, next).await?;
                warn!(
                    error = %err,
                    ?failure,
                    next_retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "oracle call failed, batch rescheduled"
                );
                Ok(BatchOutcome::Rescheduled {
                    failure,
                    retry_count,
                    delay,
                })
            }
            None => {
                warn!(error = %err, ?failure, "oracle retries exhausted, batch skipped");
                self.persist_and_advance(
                    state,
                    Vec::new(),
                    state.accumulated_growth_areas.clone(),
                    Scoring::Skipped(failure),
                )
                .await
            }
        }
    }

    async fn persist_and_advance(
        &self,
        state: &RunState,
        records: Vec<MatchRecord>,
        growth: Vec<GrowthArea>,
        scoring: Scoring,
    ) -> Result<BatchOutcome, MatchingError> {
        let is_last_batch = state.is_last_batch();
        let persisted = !records.is_empty() || is_last_batch;

        if persisted {
            let outcome = self
                .ctx
                .matches
                .save_batch_results(SaveBatch {
                    profile_id: state.profile_id,
                    run_seq: state.run_seq,
                    batch_index: state.batch_index,
                    records,
                    model_version: self.model_version(),
                    is_last_batch,
                    previous_opp_ids: state.previous_opp_ids.clone(),
                    accumulated_growth_areas: growth.clone(),
                    run_timestamp: state.run_timestamp,
                })
                .await?;
            if let WriteOutcome::Superseded { latest_run_seq } = outcome {
                info!(latest_run_seq, "newer run owns this profile, chain ends");
                return Ok(BatchOutcome::Superseded { latest_run_seq });
            }
        }

        let next = if is_last_batch {
            info!(?scoring, persisted, "last batch resolved, match run complete");
            ChainStep::Done
        } else {
            let delay = self.config.inter_batch_delay();
            let next_state = state.advanced(growth);
            let batch_index = next_state.batch_index;
            self.ctx.scheduler.schedule_after(delay, next_state).await?;
            info!(?scoring, persisted, next_batch = batch_index, "batch resolved, next batch scheduled");
            ChainStep::Next { batch_index, delay }
        };

        Ok(BatchOutcome::Resolved(BatchReport {
            batch_index: state.batch_index,
            scoring,
            persisted,
            next,
        }))
    }
}
