use std::sync::Arc;
use std::time::Duration;

use astn_core::RunState;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{BatchProcessor, MatchingError};

/// Delayed, at-least-once delivery of a run state to the batch processor.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    async fn schedule_after(&self, delay: Duration, state: RunState) -> Result<(), MatchingError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBatch {
    pub delay: Duration,
    pub state: RunState,
}

/// In-process scheduler: tasks go over a channel to [`run_dispatch_loop`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<ScheduledBatch>,
}

impl TokioScheduler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScheduledBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BatchScheduler for TokioScheduler {
    async fn schedule_after(&self, delay: Duration, state: RunState) -> Result<(), MatchingError> {
        self.tx
            .send(ScheduledBatch { delay, state })
            .map_err(|_| MatchingError::Schedule("dispatch loop has shut down".to_string()))
    }
}

/// Sleeps out each task's delay on its own tokio task, then runs it. Returns once every
/// scheduler handle is dropped.
pub async fn run_dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<ScheduledBatch>,
    processor: Arc<BatchProcessor>,
) {
    while let Some(task) = rx.recv().await {
        let processor = processor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(task.delay).await;
            if let Err(err) = processor.process(task.state).await {
                error!(error = %err, "batch processing failed");
            }
        });
    }
    debug!("dispatch loop stopped");
}

/// A due task claimed by this worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub state: RunState,
    /// Claims made on this task so far, this one included.
    pub attempts: u32,
}

/// Source of due tasks for [`run_queue_worker`].
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn claim_due(&self) -> Result<Option<ClaimedTask>, MatchingError>;

    async fn mark_done(&self, id: Uuid) -> Result<(), MatchingError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), MatchingError>;
}

pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Durable scheduler backed by the `match_batch_tasks` table.
///
/// A claim is a lease: a `running` row not finished within `claim_timeout` of its
/// `claimed_at` is handed out again, so a worker that dies mid-batch does not end the run.
#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    claim_timeout: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    /// Claims the oldest due task, or a running one whose lease expired. Concurrent
    /// workers never claim the same row at once.
    async fn claim_due(&self) -> Result<Option<ClaimedTask>, MatchingError> {
        let row = sqlx::query(
            r#"
            UPDATE match_batch_tasks
               SET status = 'running',
                   claimed_at = NOW(),
                   attempts = attempts + 1,
                   updated_at = NOW()
             WHERE id = (
                 SELECT id
                   FROM match_batch_tasks
                  WHERE (status = 'pending' AND run_at <= NOW())
                     OR (status = 'running' AND claimed_at <= NOW() - make_interval(secs => $1))
                  ORDER BY run_at, created_at
                  LIMIT 1
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(self.claim_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let id: Uuid = row.try_get("id")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let attempts: i32 = row.try_get("attempts")?;
        if attempts > 1 {
            warn!(task_id = %id, attempts, "reclaimed task whose lease expired");
        }
        match serde_json::from_value::<RunState>(payload) {
            Ok(state) => Ok(Some(ClaimedTask {
                id,
                state,
                attempts: attempts.max(0) as u32,
            })),
            Err(err) => {
                self.mark_failed(id, &err.to_string()).await?;
                Err(err.into())
            }
        }
    }

    async fn mark_done(&self, id: Uuid) -> Result<(), MatchingError> {
        sqlx::query("UPDATE match_batch_tasks SET status = 'done', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), MatchingError> {
        sqlx::query(
            "UPDATE match_batch_tasks SET status = 'failed', last_error = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchScheduler for PgTaskQueue {
    async fn schedule_after(&self, delay: Duration, state: RunState) -> Result<(), MatchingError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|err| MatchingError::Schedule(format!("delay out of range: {err}")))?;
        sqlx::query(
            r#"
            INSERT INTO match_batch_tasks (id, profile_id, run_at, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(state.profile_id)
        .bind(Utc::now() + delay)
        .bind(serde_json::to_value(&state)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Polls the queue and hands each due task to the processor. Queue errors are logged and
/// the loop carries on; an unmarked task is picked up again once its lease expires.
/// Runs until the caller drops it.
pub async fn run_queue_worker(
    queue: Arc<dyn TaskQueue>,
    processor: Arc<BatchProcessor>,
    poll_interval: Duration,
) {
    info!(poll_ms = poll_interval.as_millis() as u64, "match queue worker started");
    loop {
        let claimed = match queue.claim_due().await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(error = %err, "claiming due task failed");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let Some(task) = claimed else {
            tokio::time::sleep(poll_interval).await;
            continue;
        };

        let marked = match processor.process(task.state).await {
            Ok(outcome) => {
                debug!(task_id = %task.id, attempts = task.attempts, ?outcome, "task processed");
                queue.mark_done(task.id).await
            }
            Err(err) => {
                warn!(task_id = %task.id, attempts = task.attempts, error = %err, "task failed");
                queue.mark_failed(task.id, &err.to_string()).await
            }
        };
        if let Err(err) = marked {
            error!(task_id = %task.id, error = %err, "recording task result failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_scheduler_forwards_tasks_in_order() {
        let (scheduler, mut rx) = TokioScheduler::channel();
        let state = RunState::first_batch(Uuid::new_v4(), 1, 2, vec![], Utc::now(), None);
        scheduler.schedule_after(Duration::ZERO, state.clone()).await.unwrap();
        scheduler
            .schedule_after(Duration::from_secs(1), state.advanced(vec![]))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.delay, Duration::ZERO);
        assert_eq!(first.state, state);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.state.batch_index, 1);
    }

    #[tokio::test]
    async fn tokio_scheduler_reports_closed_loop() {
        let (scheduler, rx) = TokioScheduler::channel();
        drop(rx);
        let state = RunState::first_batch(Uuid::new_v4(), 1, 1, vec![], Utc::now(), None);
        let err = scheduler.schedule_after(Duration::ZERO, state).await.unwrap_err();
        assert!(matches!(err, MatchingError::Schedule(_)));
    }
}
