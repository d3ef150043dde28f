//! JSON API over the matching pipeline: trigger runs and read a profile's matches.

use std::sync::Arc;

use astn_core::MatchStatus;
use astn_matching::{MatchingConfig, MatchingContext, MatchingError, PgTaskQueue, RunInitiator};
use astn_storage::{connect_pool, MatchOverview, MatchStore, PgStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "astn-web";

#[derive(Clone)]
pub struct AppState {
    pub initiator: Arc<RunInitiator>,
    pub matches: Arc<dyn MatchStore>,
}

impl AppState {
    pub fn new(initiator: Arc<RunInitiator>, matches: Arc<dyn MatchStore>) -> Self {
        Self { initiator, matches }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: MatchStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/profiles/{profile_id}/matches", get(matches_handler))
        .route("/profiles/{profile_id}/matches/compute", post(compute_handler))
        .route("/profiles/{profile_id}/matches/new-count", get(new_count_handler))
        .route("/profiles/{profile_id}/matches/viewed", post(viewed_handler))
        .route(
            "/profiles/{profile_id}/matches/{opportunity_id}/status",
            post(status_handler),
        )
        .with_state(Arc::new(state))
}

/// Serves against Postgres, scheduling batches on the durable task queue.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = MatchingConfig::from_env();
    let port: u16 = std::env::var("ASTN_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let pool = connect_pool(&config.database_url).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgTaskQueue::new(pool));
    let ctx = MatchingContext::from_store(store.clone(), queue);
    let initiator = Arc::new(RunInitiator::new(config, ctx));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "astn web listening");
    axum::serve(listener, app(AppState::new(initiator, store))).await?;
    Ok(())
}

async fn compute_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
) -> Response {
    match state.initiator.start(profile_id).await {
        Ok(summary) => (StatusCode::ACCEPTED, Json(summary)).into_response(),
        Err(MatchingError::ProfileNotFound(_)) => not_found("profile not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn matches_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
) -> Response {
    let records = match state.matches.list_matches(profile_id).await {
        Ok(records) => records,
        Err(err) => return server_error(err.into()),
    };
    match state.matches.growth_areas(profile_id).await {
        Ok(growth) => Json(MatchOverview::from_records(profile_id, records, growth)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn new_count_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
) -> Response {
    match state.matches.list_matches(profile_id).await {
        Ok(records) => {
            let count = records.iter().filter(|r| r.is_new).count();
            Json(json!({ "new_match_count": count })).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn viewed_handler(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
) -> Response {
    match state.matches.mark_matches_viewed(profile_id).await {
        Ok(marked) => Json(json!({ "marked": marked })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path((profile_id, opportunity_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<StatusBody>,
) -> Response {
    match state
        .matches
        .set_match_status(profile_id, opportunity_id, body.status)
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("match not found"),
        Err(err) => server_error(err.into()),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("server error: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use astn_core::{MatchExplanation, MatchProbability, MatchRecord, MatchTier, Opportunity, Profile, ScoredMatch};
    use astn_matching::TokioScheduler;
    use astn_storage::InMemoryStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        store: Arc<InMemoryStore>,
        app: Router,
        _rx: tokio::sync::mpsc::UnboundedReceiver<astn_matching::ScheduledBatch>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let (scheduler, rx) = TokioScheduler::channel();
        let ctx = MatchingContext::from_store(store.clone(), Arc::new(scheduler));
        let initiator = Arc::new(RunInitiator::new(MatchingConfig::default(), ctx));
        Fixture {
            app: app(AppState::new(initiator, store.clone())),
            store,
            _rx: rx,
        }
    }

    fn record(profile_id: Uuid, tier: MatchTier, score: f64, is_new: bool) -> MatchRecord {
        MatchRecord::from_scored(
            profile_id,
            ScoredMatch {
                opportunity_id: Uuid::new_v4(),
                tier,
                score,
                explanation: MatchExplanation::default(),
                probability: MatchProbability::default(),
                recommendations: vec![],
            },
            is_new,
            Utc::now(),
            "test-model",
            1,
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn compute_acknowledges_with_batch_count() {
        let fx = fixture();
        let profile = Profile {
            id: Uuid::new_v4(),
            ..Profile::default()
        };
        fx.store.insert_profile(profile.clone()).await;
        for i in 0..16 {
            fx.store
                .upsert_opportunity(Opportunity::active(Uuid::new_v4(), format!("Role {i}"), "Open Lab"))
                .await;
        }

        let resp = fx
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/profiles/{}/matches/compute", profile.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "started");
        assert_eq!(body["total_batches"], 2);
    }

    #[tokio::test]
    async fn compute_for_unknown_profile_is_404() {
        let fx = fixture();
        let resp = fx
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/profiles/{}/matches/compute", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn matches_are_grouped_and_viewing_clears_the_badge() {
        let fx = fixture();
        let profile_id = Uuid::new_v4();
        fx.store.insert_match(record(profile_id, MatchTier::Good, 70.0, true)).await;
        fx.store.insert_match(record(profile_id, MatchTier::Great, 90.0, true)).await;
        fx.store.insert_match(record(profile_id, MatchTier::Good, 80.0, false)).await;

        let resp = fx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/profiles/{profile_id}/matches"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = body_json(resp).await;
        assert_eq!(body["tiers"]["great"].as_array().unwrap().len(), 1);
        assert_eq!(body["tiers"]["good"][0]["score"], 80.0);
        assert_eq!(body["new_match_count"], 2);
        assert_eq!(body["needs_computation"], false);

        let resp = fx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/profiles/{profile_id}/matches/viewed"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["marked"], 2);

        let resp = fx
            .app
            .oneshot(
                Request::builder()
                    .uri(format!("/profiles/{profile_id}/matches/new-count"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["new_match_count"], 0);
    }

    #[tokio::test]
    async fn status_update_hits_existing_match_only() {
        let fx = fixture();
        let profile_id = Uuid::new_v4();
        let existing = record(profile_id, MatchTier::Exploring, 55.0, false);
        let opportunity_id = existing.opportunity_id;
        fx.store.insert_match(existing).await;

        let request = |opp: Uuid| {
            Request::builder()
                .method("POST")
                .uri(format!("/profiles/{profile_id}/matches/{opp}/status"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"status":"saved"}"#))
                .unwrap()
        };

        let resp = fx.app.clone().oneshot(request(opportunity_id)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let stored = fx.store.list_matches(profile_id).await.unwrap();
        assert_eq!(stored[0].status, MatchStatus::Saved);

        let resp = fx.app.oneshot(request(Uuid::new_v4())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
