//! Chained batch matching: run initiation, the self-rescheduling batch processor and its schedulers.

use std::sync::Arc;

use anyhow::Context;
use astn_storage::{MatchStore, OpportunityReader, ProfileReader, StoreError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

mod config;
mod initiator;
mod processor;
mod scheduler;

pub use config::{BackoffPolicy, MatchingConfig, PoolStrategy};
pub use initiator::{RunInitiator, RunSummary};
pub use processor::{BatchOutcome, BatchProcessor, BatchReport, ChainStep, DeadEnd, Scoring};
pub use scheduler::{
    run_dispatch_loop, run_queue_worker, BatchScheduler, ClaimedTask, PgTaskQueue, ScheduledBatch,
    TaskQueue, TokioScheduler, DEFAULT_CLAIM_TIMEOUT,
};

pub const CRATE_NAME: &str = "astn-matching";

#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("profile {0} not found")]
    ProfileNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task queue error: {0}")]
    Queue(#[from] sqlx::Error),
    #[error("run state payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("could not schedule batch: {0}")]
    Schedule(String),
}

/// Collaborators shared by the initiator and the processor.
#[derive(Clone)]
pub struct MatchingContext {
    pub profiles: Arc<dyn ProfileReader>,
    pub opportunities: Arc<dyn OpportunityReader>,
    pub matches: Arc<dyn MatchStore>,
    pub scheduler: Arc<dyn BatchScheduler>,
}

impl MatchingContext {
    /// Uses one store for profiles, opportunities and matches.
    pub fn from_store<S>(store: Arc<S>, scheduler: Arc<dyn BatchScheduler>) -> Self
    where
        S: ProfileReader + OpportunityReader + MatchStore + 'static,
    {
        Self {
            profiles: store.clone(),
            opportunities: store.clone(),
            matches: store,
            scheduler,
        }
    }
}

/// Cron job that starts a run for every profile, when enabled.
pub async fn maybe_build_scheduler(
    config: &MatchingConfig,
    initiator: Arc<RunInitiator>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.recompute_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let initiator = initiator.clone();
        Box::pin(async move {
            match initiator.start_all().await {
                Ok(started) => info!(started, "scheduled match recompute triggered"),
                Err(err) => error!(error = %err, "scheduled match recompute failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_not_found_names_the_profile() {
        let err = MatchingError::ProfileNotFound(Uuid::nil());
        assert_eq!(
            err.to_string(),
            "profile 00000000-0000-0000-0000-000000000000 not found"
        );
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let store = Arc::new(astn_storage::InMemoryStore::new());
        let (scheduler, _rx) = TokioScheduler::channel();
        let ctx = MatchingContext::from_store(store, Arc::new(scheduler));
        let initiator = Arc::new(RunInitiator::new(MatchingConfig::default(), ctx));
        let built = maybe_build_scheduler(&MatchingConfig::default(), initiator)
            .await
            .unwrap();
        assert!(built.is_none());
    }
}
