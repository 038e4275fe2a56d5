//! Axum JSON surface for the sync trigger and status operations.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use exsync_sync::{CronTriggers, SyncScheduler, TriggerOutcome, TriggerResponse};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "exsync-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SyncScheduler,
    pub triggers: Option<Arc<CronTriggers>>,
}

impl AppState {
    pub fn new(scheduler: SyncScheduler) -> Self {
        Self {
            scheduler,
            triggers: None,
        }
    }

    pub fn with_triggers(mut self, triggers: Arc<CronTriggers>) -> Self {
        self.triggers = Some(triggers);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TriggerQuery {
    reason: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/full", post(full_sync_handler))
        .route("/sync/incremental", post(incremental_sync_handler))
        .route("/sync/cases/{id}", post(case_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.scheduler.sync_status(state.triggers.as_deref()).await;
    Json(status).into_response()
}

async fn full_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    trigger_response(state.scheduler.trigger_full_sync(query.reason.as_deref()).await)
}

async fn incremental_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    trigger_response(
        state
            .scheduler
            .trigger_incremental_sync(query.reason.as_deref())
            .await,
    )
}

async fn case_sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(case_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(TriggerResponse {
                success: false,
                skipped: false,
                results: None,
                error: Some(format!("invalid case id '{id}'")),
            }),
        )
            .into_response();
    };
    trigger_response(state.scheduler.trigger_single_case_sync(case_id).await)
}

fn trigger_response(outcome: TriggerOutcome) -> Response {
    let status = match &outcome {
        TriggerOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TriggerOutcome::Completed(_) | TriggerOutcome::AlreadyRunning => StatusCode::OK,
    };
    (status, Json(TriggerResponse::from(outcome))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use exsync_core::{Case, RawCaseRecord};
    use exsync_storage::MemoryStore;
    use exsync_sync::SyncConfig;
    use http_body_util::BodyExt;
    use serde_json::{json, Value as JsonValue};
    use tower::ServiceExt;

    async fn state_with_case() -> (AppState, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let raw = RawCaseRecord::from_json(&json!({
            "id": "m-1",
            "account_ref": {"id": "acct-1", "display_name": "Priya Patel"},
            "assigned_to_users": [{"id": "u-1", "display_name": "Maria Garcia"}]
        }));
        let case = Case::new(raw, Utc::now());
        let case_id = case.id;
        store.insert_case(case).await;

        let mut config = SyncConfig::default();
        config.batch_pause = std::time::Duration::ZERO;
        let scheduler = SyncScheduler::from_config(store, &config);
        (AppState::new(scheduler), case_id)
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let (state, _) = state_with_case().await;
        let resp = app(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
    }

    #[tokio::test]
    async fn full_sync_returns_aggregate() {
        let (state, _) = state_with_case().await;
        let resp = app(state).oneshot(post("/sync/full?reason=manual-check")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["skipped"], false);
        assert_eq!(body["results"]["total"], 1);
        assert_eq!(body["results"]["successful"], 1);
        assert_eq!(body["results"]["reason"], "manual-check");
        assert_eq!(body["results"]["users_created"], 1);
    }

    #[tokio::test]
    async fn incremental_sync_route() {
        let (state, _) = state_with_case().await;
        let resp = app(state).oneshot(post("/sync/incremental")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["results"]["mode"], "incremental");
    }

    #[tokio::test]
    async fn single_case_route_validates_id() {
        let (state, case_id) = state_with_case().await;
        let router = app(state);

        let bad = router.clone().oneshot(post("/sync/cases/not-a-uuid")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = router.oneshot(post(&format!("/sync/cases/{case_id}"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["results"]["mode"], "single_case");
        assert_eq!(body["results"]["successful"], 1);
    }

    #[tokio::test]
    async fn status_route_reports_idle() {
        let (state, _) = state_with_case().await;
        let resp = app(state)
            .oneshot(Request::builder().uri("/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["is_running"], false);
        assert_eq!(body["scheduled_triggers_active"], json!([]));
    }

    #[test]
    fn crashed_runs_map_to_server_error() {
        let resp = trigger_response(TriggerOutcome::Failed {
            error: "database error".into(),
        });
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let skipped = trigger_response(TriggerOutcome::AlreadyRunning);
        assert_eq!(skipped.status(), StatusCode::OK);
    }
}
