use std::time::Duration;

use astn_core::{total_batches, RunState};
use astn_storage::WriteOutcome;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{MatchingConfig, MatchingContext, MatchingError, PoolStrategy};

/// Acknowledgment returned to whoever triggered a run. Completion is only observable through
/// persisted matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunSummary {
    /// Nothing to score; the profile's existing matches were cleared.
    NoCandidates { run_seq: u64, cleared: usize },
    Started {
        run_seq: u64,
        pool_size: usize,
        total_batches: usize,
    },
}

impl RunSummary {
    pub fn total_batches(&self) -> usize {
        match self {
            Self::NoCandidates { .. } => 0,
            Self::Started { total_batches, .. } => *total_batches,
        }
    }
}

pub struct RunInitiator {
    config: MatchingConfig,
    ctx: MatchingContext,
}

impl RunInitiator {
    pub fn new(config: MatchingConfig, ctx: MatchingContext) -> Self {
        Self { config, ctx }
    }

    /// Plans a run for `profile_id` and schedules its first batch without waiting for it.
    #[instrument(skip(self), fields(profile_id = %profile_id))]
    pub async fn start(&self, profile_id: Uuid) -> Result<RunSummary, MatchingError> {
        let profile = self
            .ctx
            .profiles
            .fetch_profile(profile_id)
            .await?
            .ok_or(MatchingError::ProfileNotFound(profile_id))?;

        let now = Utc::now();
        let pool = self
            .ctx
            .opportunities
            .candidate_pool(profile.hidden_orgs(), now, self.config.candidate_limit)
            .await?;
        let run_seq = self.ctx.matches.begin_run(profile_id).await?;

        if pool.is_empty() {
            let outcome = self.ctx.matches.clear_all_for_profile(profile_id, run_seq).await?;
            let cleared = match outcome {
                WriteOutcome::Applied { removed, .. } => removed,
                WriteOutcome::Superseded { latest_run_seq } => {
                    warn!(run_seq, latest_run_seq, "clear skipped, newer run exists");
                    0
                }
            };
            info!(run_seq, cleared, "no candidate opportunities, matches cleared");
            return Ok(RunSummary::NoCandidates { run_seq, cleared });
        }

        let previous_opp_ids = self
            .ctx
            .matches
            .list_matches(profile_id)
            .await?
            .into_iter()
            .map(|m| m.opportunity_id)
            .collect::<Vec<_>>();

        let pool_size = pool.len();
        let total_batches = total_batches(pool_size, self.config.batch_size);
        let candidate_ids = match self.config.pool_strategy {
            PoolStrategy::Snapshot => Some(pool.iter().map(|o| o.id).collect()),
            PoolStrategy::Rederive => None,
        };

        let state = RunState::first_batch(
            profile_id,
            run_seq,
            total_batches,
            previous_opp_ids,
            now,
            candidate_ids,
        );
        self.ctx.scheduler.schedule_after(Duration::ZERO, state).await?;

        info!(run_seq, pool_size, total_batches, "match run started");
        Ok(RunSummary::Started {
            run_seq,
            pool_size,
            total_batches,
        })
    }

    /// Starts a run for every known profile. Failures are logged per profile.
    pub async fn start_all(&self) -> Result<usize, MatchingError> {
        let mut started = 0;
        for profile_id in self.ctx.profiles.list_profile_ids().await? {
            match self.start(profile_id).await {
                Ok(RunSummary::Started { .. }) => started += 1,
                Ok(RunSummary::NoCandidates { .. }) => {}
                Err(err) => warn!(%profile_id, error = %err, "could not start match run"),
            }
        }
        Ok(started)
    }
}
