use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::storage::TierInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub storage_tiers: Vec<TierInfo>,
    pub catalog_persistent: bool,
    pub active_jobs: usize,
    pub tracked_jobs: usize,
    pub provider_configured: bool,
    pub data_dir: Option<String>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let (active_jobs, tracked_jobs) = {
        let jobs = state.jobs.read().await;
        let active = jobs
            .values()
            .filter(|c| !c.status().is_terminal())
            .count();
        (active, jobs.len())
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage_tiers: state.migrator.storage().describe(),
        catalog_persistent: state.catalog.is_persistent(),
        active_jobs,
        tracked_jobs,
        provider_configured: state.config.provider.api_key.is_some(),
        data_dir: state
            .config
            .data_dir
            .as_ref()
            .map(|d| d.display().to_string()),
    };

    (StatusCode::OK, Json(response))
}
