use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::controller::{GenerationController, PollSettings};
use crate::errors::VaultError;
use crate::migrate::content_type_for;
use crate::models::{GenerationJob, GenerationRequest, JobOutcome};
use crate::provider::is_provider_handle;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// HTTP status and error code for a domain error.
fn classify_error(err: &VaultError) -> (StatusCode, &'static str) {
    match err {
        VaultError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        VaultError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        VaultError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        VaultError::Submission(_) => (StatusCode::BAD_GATEWAY, "submission_error"),
        VaultError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport_error"),
        VaultError::Download(_) => (StatusCode::BAD_GATEWAY, "download_error"),
        VaultError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        VaultError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        VaultError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        VaultError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn vault_error_response(err: &VaultError) -> Response {
    let (status, code) = classify_error(err);
    error_response(status, code, &err.to_string())
}

/// Store errors arrive as anyhow; recover the domain error when there is one.
fn store_error_response(err: anyhow::Error) -> Response {
    match err.downcast::<VaultError>() {
        Ok(vault) => vault_error_response(&vault),
        Err(other) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            &format!("{:#}", other),
        ),
    }
}

fn parse_job_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            &format!("'{}' is not a valid job id", id),
        )
    })
}

// ---------------------------------------------------------------------------
// POST /api/save-image
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveImageRequest {
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveImageResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn save_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveImageRequest>,
) -> impl IntoResponse {
    match state
        .migrator
        .migrate(&req.image_url, req.filename.as_deref())
        .await
    {
        Ok(record) => {
            if !record.is_durable() {
                tracing::warn!(
                    "Image {} saved to degraded tier '{}'",
                    record.canonical_uri,
                    record.tier
                );
            }
            let filename = record
                .canonical_uri
                .rsplit('/')
                .next()
                .map(|s| s.to_string());
            let response = SaveImageResponse {
                success: true,
                storage_type: record.tier.storage_type(),
                key: Some(record.key.clone()),
                filename,
                durable: Some(record.is_durable()),
                original_url: Some(req.image_url),
                local_url: Some(record.canonical_uri),
                error: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            tracing::warn!("Save image failed for '{}': {}", req.image_url, e);
            let (status, _) = classify_error(&e);
            let response = SaveImageResponse {
                success: false,
                original_url: Some(req.image_url),
                error: Some(e.to_string()),
                ..Default::default()
            };
            (status, Json(response)).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/check-status?url=
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CheckStatusParams {
    pub url: Option<String>,
}

pub async fn check_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckStatusParams>,
) -> impl IntoResponse {
    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Polling URL parameter is required",
        );
    };
    if !is_provider_handle(&state.config.provider, &url) {
        tracing::warn!("Refusing status check for non-provider URL {}", url);
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Polling URL does not belong to the generation provider",
        );
    }

    match state.provider.fetch_status(&url).await {
        Ok(doc) => (StatusCode::OK, Json(doc)).into_response(),
        Err(e) => {
            tracing::warn!("Status check for {} failed: {}", url, e);
            vault_error_response(&e)
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/check-url?imageUrl=
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUrlParams {
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUrlResponse {
    pub image_url: String,
    pub is_ephemeral: bool,
    /// None for relative references, which are served by this process.
    pub accessible: Option<bool>,
    pub needs_migration: bool,
}

pub async fn check_url(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckUrlParams>,
) -> impl IntoResponse {
    let Some(image_url) = params.image_url.filter(|u| !u.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "imageUrl parameter is required",
        );
    };

    let reference = state.migrator.classify(&image_url);
    let accessible = match state.migrator.check_accessible(&image_url).await {
        Ok(ok) => Some(ok),
        Err(VaultError::Validation(_)) => None,
        Err(e) => {
            tracing::debug!("Accessibility check for {} failed: {}", image_url, e);
            Some(false)
        }
    };

    (
        StatusCode::OK,
        Json(CheckUrlResponse {
            image_url,
            is_ephemeral: reference.is_ephemeral,
            accessible,
            needs_migration: reference.is_ephemeral,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Generation jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub polling_url: String,
}

/// POST /api/generate
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> impl IntoResponse {
    let settings = PollSettings {
        interval: Duration::from_millis(state.config.poll_interval_ms),
        max_attempts: state.config.max_poll_attempts,
    };
    let controller = Arc::new(GenerationController::new(
        state.provider.clone(),
        state.migrator.clone(),
        state.clock.clone(),
        settings,
    ));
    let job_id = controller.snapshot().id;

    let observer = move |outcome: JobOutcome| match outcome {
        JobOutcome::Completed {
            record,
            migration_error: None,
        } => tracing::info!("Job {} stored at {} ({})", job_id, record.canonical_uri, record.tier),
        JobOutcome::Completed {
            migration_error: Some(err),
            ..
        } => tracing::warn!("Job {} completed but was not migrated: {}", job_id, err),
        JobOutcome::Failed { error_detail } => {
            tracing::warn!("Job {} failed: {}", job_id, error_detail)
        }
    };

    match controller.submit(request, observer).await {
        Ok(polling_url) => {
            state.track_job(job_id, controller).await;
            tracing::info!("Job {} submitted", job_id);
            (
                StatusCode::ACCEPTED,
                Json(GenerateResponse {
                    job_id,
                    polling_url,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!("Generation submit failed: {}", e);
            vault_error_response(&e)
        }
    }
}

async fn job_snapshot(state: &AppState, id: &str) -> Result<(Arc<GenerationController>, GenerationJob), Response> {
    let job_id = parse_job_id(id)?;
    let jobs = state.jobs.read().await;
    match jobs.get(&job_id) {
        Some(controller) => Ok((controller.clone(), controller.snapshot())),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("Job with id '{}' not found", id),
        )),
    }
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match job_snapshot(&state, &id).await {
        Ok((_, job)) => (StatusCode::OK, Json(job)).into_response(),
        Err(resp) => resp,
    }
}

/// DELETE /api/jobs/{id}
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match job_snapshot(&state, &id).await {
        Ok((controller, _)) => {
            controller.cancel();
            (StatusCode::OK, Json(controller.snapshot())).into_response()
        }
        Err(resp) => resp,
    }
}

// ---------------------------------------------------------------------------
// GET /api/artifacts/memory/{name}
// ---------------------------------------------------------------------------

pub async fn get_memory_artifact(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.migrator.storage().read(&name).await {
        Ok(Some((_, bytes))) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&name))],
            bytes,
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("Artifact '{}' not found", name),
        ),
        Err(e) => vault_error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Catalog maintenance
// ---------------------------------------------------------------------------

/// GET /api/catalog
pub async fn list_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.catalog.list().await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub ephemeral_images: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAnalysis {
    pub total_projects: usize,
    pub temporary_projects: usize,
    pub projects_to_update: Vec<PendingEntry>,
}

/// GET /api/catalog/analysis
pub async fn analyze_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = match state.catalog.list().await {
        Ok(entries) => entries,
        Err(e) => return store_error_response(e),
    };

    let total_projects = entries.len();
    let projects_to_update: Vec<PendingEntry> = entries
        .into_iter()
        .filter_map(|entry| {
            let ephemeral_images = state.migrator.ephemeral_images(&entry);
            if ephemeral_images.is_empty() {
                return None;
            }
            Some(PendingEntry {
                id: entry.id,
                name: entry.name,
                image_url: entry.image_url,
                ephemeral_images,
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(CatalogAnalysis {
            total_projects,
            temporary_projects: projects_to_update.len(),
            projects_to_update,
        }),
    )
        .into_response()
}

/// POST /api/catalog/migrate-all
pub async fn migrate_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.migrator.migrate_catalog(state.catalog.as_ref()).await {
        Ok(summary) => {
            let mut body = serde_json::to_value(&summary).unwrap_or_default();
            body["success"] = serde_json::Value::Bool(true);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => vault_error_response(&e),
    }
}

/// POST /api/catalog/{id}/migrate
pub async fn migrate_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.migrator.migrate_entry(state.catalog.as_ref(), &id).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => vault_error_response(&e),
    }
}

/// GET /api/catalog/export
pub async fn export_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.catalog.export_json().await {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => store_error_response(e),
    }
}

/// POST /api/catalog/import. Body is a previous export.
pub async fn import_catalog(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    match state.catalog.import_json(&body).await {
        Ok(imported) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "imported": imported })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Catalog import rejected: {:#}", e);
            match e.downcast::<VaultError>() {
                Ok(vault) => vault_error_response(&vault),
                Err(other) => error_response(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    &format!("{:#}", other),
                ),
            }
        }
    }
}

/// POST /api/catalog/restore
pub async fn restore_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.catalog.restore_latest_backup().await {
        Ok(Some(backup)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "restoredFrom": backup })),
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "No catalog backup available to restore",
        ),
        Err(e) => store_error_response(e),
    }
}
