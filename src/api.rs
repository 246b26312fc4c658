//! HTTP surface: health, metrics exposition and the admin action routes.

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::admin::{ActionOutcome, AdminActions};
use crate::feeds::scheduler::FeedScheduler;
use crate::metrics::Metrics;
use crate::models::now_ts;
use crate::store::Store;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub admin: Arc<AdminActions>,
    pub scheduler: Arc<FeedScheduler>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/admin/feeds/:id/enable", post(enable_feed))
        .route("/admin/feeds/:id/pause", post(pause_feed))
        .route("/admin/feeds/:id/reenable", post(reenable_feed))
        .route("/admin/feeds/:id/run", post(trigger_manual_run))
        .route("/admin/feeds/:id/reset", post(reset_feed_state))
        .route("/admin/feeds/:id/reprocess", post(force_reprocess))
        .route("/admin/feeds/:id/next-run-at", put(update_next_run_at))
        .route("/admin/runs/:run_id/approve", post(approve_activation))
        .route("/admin/runs/:run_id/ignore", post(ignore_run))
        .route("/admin/runs/:run_id/unignore", post(unignore_run))
        .route("/admin/sources/:source_id/trust", put(update_trust))
        .route("/admin/caches/trust/clear", post(clear_trust_cache))
        .route(
            "/admin/caches/brand-aliases/invalidate",
            post(invalidate_brand_aliases),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    now: i64,
    scheduler_last_tick_at: i64,
}

async fn healthz(State(state): State<ApiState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        now: now_ts(),
        scheduler_last_tick_at: state.scheduler.last_tick_at(),
    })
}

async fn metrics_text(State(state): State<ApiState>) -> String {
    state.metrics.to_prometheus()
}

fn outcome(result: anyhow::Result<ActionOutcome>, op: &str) -> Json<ActionOutcome> {
    match result {
        Ok(outcome) => Json(outcome),
        Err(e) => {
            error!(op, error = %e, "admin action failed");
            Json(ActionOutcome {
                success: false,
                message: "internal error".to_string(),
            })
        }
    }
}

async fn enable_feed(State(state): State<ApiState>, Path(id): Path<i64>) -> Json<ActionOutcome> {
    outcome(state.admin.enable_feed(id), "enable")
}

async fn pause_feed(State(state): State<ApiState>, Path(id): Path<i64>) -> Json<ActionOutcome> {
    outcome(state.admin.pause_feed(id), "pause")
}

async fn reenable_feed(State(state): State<ApiState>, Path(id): Path<i64>) -> Json<ActionOutcome> {
    outcome(state.admin.reenable_feed(id), "reenable")
}

async fn trigger_manual_run(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Json<ActionOutcome> {
    outcome(state.admin.trigger_manual_run(id), "manual_run")
}

async fn reset_feed_state(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Json<ActionOutcome> {
    outcome(state.admin.reset_feed_state(id), "reset")
}

async fn force_reprocess(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Json<ActionOutcome> {
    outcome(state.admin.force_reprocess(id), "reprocess")
}

#[derive(Deserialize)]
struct NextRunAtBody {
    next_run_at: i64,
}

async fn update_next_run_at(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<NextRunAtBody>,
) -> Json<ActionOutcome> {
    outcome(
        state.admin.update_next_run_at(id, body.next_run_at),
        "next_run_at",
    )
}

#[derive(Deserialize)]
struct ApproveBody {
    actor: String,
}

async fn approve_activation(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Json<ActionOutcome> {
    outcome(state.admin.approve_activation(&run_id, &body.actor), "approve")
}

#[derive(Deserialize)]
struct IgnoreBody {
    actor: String,
    reason: String,
}

async fn ignore_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    Json(body): Json<IgnoreBody>,
) -> Json<ActionOutcome> {
    outcome(
        state.admin.ignore_run(&run_id, &body.actor, &body.reason),
        "ignore",
    )
}

async fn unignore_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Json<ActionOutcome> {
    outcome(state.admin.unignore_run(&run_id), "unignore")
}

async fn clear_trust_cache(State(state): State<ApiState>) -> Json<ActionOutcome> {
    Json(state.admin.clear_trust_cache())
}

async fn invalidate_brand_aliases(State(state): State<ApiState>) -> Json<ActionOutcome> {
    Json(state.admin.invalidate_brand_aliases())
}

#[derive(Deserialize)]
struct TrustBody {
    upc_trusted: bool,
}

async fn update_trust(
    State(state): State<ApiState>,
    Path(source_id): Path<i64>,
    Json(body): Json<TrustBody>,
) -> Json<ActionOutcome> {
    outcome(
        state.admin.update_source_trust_config(source_id, body.upc_trusted),
        "trust",
    )
}
