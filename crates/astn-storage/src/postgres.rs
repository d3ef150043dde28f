use anyhow::Context;
use astn_core::{
    GrowthArea, MatchRecord, MatchStatus, MatchTier, Opportunity, OpportunityStatus, Profile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{
    MatchStore, OpportunityReader, ProfileReader, SaveBatch, StoreError, StoreResult, WriteOutcome,
};

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .with_context(|| "connecting to postgres".to_string())
}

/// Postgres-backed readers and match store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fence(
        tx: &mut Transaction<'_, Postgres>,
        profile_id: Uuid,
        run_seq: u64,
    ) -> StoreResult<Option<WriteOutcome>> {
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT latest_run_seq
              FROM match_runs
             WHERE profile_id = $1
               FOR UPDATE
            "#,
        )
        .bind(profile_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(match latest {
            Some(latest) if (run_seq as i64) < latest => Some(WriteOutcome::Superseded {
                latest_run_seq: latest as u64,
            }),
            _ => None,
        })
    }
}

fn opportunity_from_row(row: &PgRow) -> StoreResult<Opportunity> {
    let data_json: serde_json::Value = row.try_get("data_json")?;
    let mut opportunity: Opportunity = serde_json::from_value(data_json)?;
    let status: String = row.try_get("status")?;
    opportunity.id = row.try_get("id")?;
    opportunity.organization = row.try_get("organization")?;
    opportunity.deadline = row.try_get("deadline")?;
    opportunity.status = OpportunityStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("opportunity status {status:?}")))?;
    Ok(opportunity)
}

fn match_from_row(row: &PgRow) -> StoreResult<MatchRecord> {
    let tier: String = row.try_get("tier")?;
    let status: String = row.try_get("status")?;
    let run_seq: i64 = row.try_get("run_seq")?;
    Ok(MatchRecord {
        profile_id: row.try_get("profile_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        tier: MatchTier::parse(&tier)
            .ok_or_else(|| StoreError::Corrupt(format!("match tier {tier:?}")))?,
        score: row.try_get("score")?,
        explanation: serde_json::from_value(row.try_get("explanation")?)?,
        probability: serde_json::from_value(row.try_get("probability")?)?,
        recommendations: serde_json::from_value(row.try_get("recommendations")?)?,
        is_new: row.try_get("is_new")?,
        computed_at: row.try_get("computed_at")?,
        model_version: row.try_get("model_version")?,
        status: MatchStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("match status {status:?}")))?,
        run_seq: run_seq as u64,
    })
}

#[async_trait]
impl ProfileReader for PgStore {
    async fn fetch_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>> {
        let row = sqlx::query("SELECT data_json FROM profiles WHERE id = $1")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let data_json: serde_json::Value = row.try_get("data_json")?;
        let mut profile: Profile = serde_json::from_value(data_json)?;
        profile.id = profile_id;
        Ok(Some(profile))
    }

    async fn list_profile_ids(&self) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar("SELECT id FROM profiles ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl OpportunityReader for PgStore {
    async fn candidate_pool(
        &self,
        hidden_orgs: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization, status, deadline, data_json
              FROM opportunities
             WHERE status = 'active'
               AND (deadline IS NULL OR deadline >= $1)
               AND NOT (organization = ANY($2))
             ORDER BY created_at, id
             LIMIT $3
            "#,
        )
        .bind(now)
        .bind(hidden_orgs.to_vec())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(opportunity_from_row).collect()
    }

    async fn fetch_opportunities(&self, ids: &[Uuid]) -> StoreResult<Vec<Opportunity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization, status, deadline, data_json
              FROM opportunities
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        let fetched = rows
            .iter()
            .map(opportunity_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(ids
            .iter()
            .filter_map(|id| fetched.iter().find(|o| &o.id == id).cloned())
            .collect())
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn begin_run(&self, profile_id: Uuid) -> StoreResult<u64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO match_runs (profile_id, latest_run_seq, started_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (profile_id) DO UPDATE
               SET latest_run_seq = match_runs.latest_run_seq + 1,
                   started_at = NOW()
            RETURNING latest_run_seq
            "#,
        )
        .bind(profile_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }

    async fn latest_run_seq(&self, profile_id: Uuid) -> StoreResult<u64> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT latest_run_seq FROM match_runs WHERE profile_id = $1")
                .bind(profile_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(seq.unwrap_or(0) as u64)
    }

    async fn clear_all_for_profile(&self, profile_id: Uuid, run_seq: u64) -> StoreResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(superseded) = Self::fence(&mut tx, profile_id, run_seq).await? {
            tx.rollback().await?;
            return Ok(superseded);
        }
        let removed = sqlx::query("DELETE FROM matches WHERE profile_id = $1")
            .bind(profile_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM profile_growth_areas WHERE profile_id = $1")
            .bind(profile_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(WriteOutcome::Applied {
            saved: 0,
            removed: removed as usize,
        })
    }

    async fn save_batch_results(&self, batch: SaveBatch) -> StoreResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(superseded) = Self::fence(&mut tx, batch.profile_id, batch.run_seq).await? {
            tx.rollback().await?;
            return Ok(superseded);
        }

        for record in &batch.records {
            sqlx::query(
                r#"
                INSERT INTO matches (
                    profile_id, opportunity_id, tier, score, explanation, probability,
                    recommendations, is_new, computed_at, model_version, status, run_seq
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (profile_id, opportunity_id) DO UPDATE
                   SET tier = EXCLUDED.tier,
                       score = EXCLUDED.score,
                       explanation = EXCLUDED.explanation,
                       probability = EXCLUDED.probability,
                       recommendations = EXCLUDED.recommendations,
                       is_new = EXCLUDED.is_new,
                       computed_at = EXCLUDED.computed_at,
                       model_version = EXCLUDED.model_version,
                       run_seq = EXCLUDED.run_seq
                "#,
            )
            .bind(record.profile_id)
            .bind(record.opportunity_id)
            .bind(record.tier.as_str())
            .bind(record.score)
            .bind(serde_json::to_value(&record.explanation)?)
            .bind(serde_json::to_value(&record.probability)?)
            .bind(serde_json::to_value(&record.recommendations)?)
            .bind(record.is_new)
            .bind(record.computed_at)
            .bind(&record.model_version)
            .bind(record.status.as_str())
            .bind(record.run_seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        let mut removed = 0u64;
        if batch.is_last_batch {
            removed = sqlx::query("DELETE FROM matches WHERE profile_id = $1 AND run_seq <> $2")
                .bind(batch.profile_id)
                .bind(batch.run_seq as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            sqlx::query(
                r#"
                INSERT INTO profile_growth_areas (profile_id, growth_areas, run_seq, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (profile_id) DO UPDATE
                   SET growth_areas = EXCLUDED.growth_areas,
                       run_seq = EXCLUDED.run_seq,
                       updated_at = NOW()
                "#,
            )
            .bind(batch.profile_id)
            .bind(serde_json::to_value(&batch.accumulated_growth_areas)?)
            .bind(batch.run_seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            profile_id = %batch.profile_id,
            batch_index = batch.batch_index,
            saved = batch.records.len(),
            removed,
            "saved match batch"
        );
        Ok(WriteOutcome::Applied {
            saved: batch.records.len(),
            removed: removed as usize,
        })
    }

    async fn list_matches(&self, profile_id: Uuid) -> StoreResult<Vec<MatchRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT profile_id, opportunity_id, tier, score, explanation, probability,
                   recommendations, is_new, computed_at, model_version, status, run_seq
              FROM matches
             WHERE profile_id = $1
             ORDER BY opportunity_id
            "#,
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn growth_areas(&self, profile_id: Uuid) -> StoreResult<Vec<GrowthArea>> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT growth_areas FROM profile_growth_areas WHERE profile_id = $1",
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?;
        match value {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn mark_matches_viewed(&self, profile_id: Uuid) -> StoreResult<usize> {
        let marked = sqlx::query(
            "UPDATE matches SET is_new = FALSE WHERE profile_id = $1 AND is_new = TRUE",
        )
        .bind(profile_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(marked as usize)
    }

    async fn set_match_status(
        &self,
        profile_id: Uuid,
        opportunity_id: Uuid,
        status: MatchStatus,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            "UPDATE matches SET status = $3 WHERE profile_id = $1 AND opportunity_id = $2",
        )
        .bind(profile_id)
        .bind(opportunity_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}
