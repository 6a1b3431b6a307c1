pub mod health;
pub mod routes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::clock::Clock;
use crate::controller::GenerationController;
use crate::migrate::ArtifactMigrator;
use crate::models::VaultConfig;
use crate::provider::GenerationProvider;
use crate::storage::local::GENERATED_DIR;
use crate::storage::CatalogStore;

/// Shared application state for the Axum server.
pub struct AppState {
    pub config: Arc<VaultConfig>,
    pub provider: Arc<dyn GenerationProvider>,
    pub migrator: Arc<ArtifactMigrator>,
    pub catalog: Arc<dyn CatalogStore>,
    pub clock: Arc<dyn Clock>,
    /// Root of statically served files; the local tier writes below it.
    pub public_dir: PathBuf,
    pub start_time: Instant,
    pub jobs: RwLock<HashMap<Uuid, Arc<GenerationController>>>,
}

impl AppState {
    /// Track a new job. Finished jobs beyond `max_finished_jobs` are dropped,
    /// oldest first. Returns how many were dropped.
    pub async fn track_job(&self, id: Uuid, controller: Arc<GenerationController>) -> usize {
        let mut jobs = self.jobs.write().await;
        let evicted = evict_finished_jobs(&mut jobs, self.config.max_finished_jobs);
        jobs.insert(id, controller);
        evicted
    }
}

/// Drop the oldest terminal jobs so at most `keep` remain. Running jobs are
/// never touched.
pub fn evict_finished_jobs(
    jobs: &mut HashMap<Uuid, Arc<GenerationController>>,
    keep: usize,
) -> usize {
    let mut finished: Vec<_> = jobs
        .iter()
        .filter_map(|(id, controller)| {
            let job = controller.snapshot();
            job.status.is_terminal().then_some((job.finished_at, *id))
        })
        .collect();
    if finished.len() <= keep {
        return 0;
    }

    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    tracing::debug!("Evicted {} finished jobs", excess);
    excess
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let generated = ServeDir::new(state.public_dir.join(GENERATED_DIR));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/save-image", post(routes::save_image))
        .route("/api/check-status", get(routes::check_status))
        .route("/api/check-url", get(routes::check_url))
        .route("/api/generate", post(routes::generate))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::cancel_job),
        )
        .route("/api/artifacts/memory/{name}", get(routes::get_memory_artifact))
        .route("/api/catalog", get(routes::list_catalog))
        .route("/api/catalog/analysis", get(routes::analyze_catalog))
        .route("/api/catalog/migrate-all", post(routes::migrate_all))
        .route("/api/catalog/export", get(routes::export_catalog))
        .route("/api/catalog/import", post(routes::import_catalog))
        .route("/api/catalog/restore", post(routes::restore_catalog))
        .route("/api/catalog/{id}/migrate", post(routes::migrate_entry))
        .nest_service(&format!("/{}", GENERATED_DIR), generated)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::UrlClassifier;
    use crate::clock::FakeClock;
    use crate::errors::VaultError;
    use crate::migrate::{ArtifactFetcher, FetchedArtifact};
    use crate::models::{CatalogEntry, GenerationRequest};
    use crate::storage::{
        LocalFileBackend, MemoryBackend, MemoryCatalogStore, StorageBackend, TieredStorage,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const EPHEMERAL: &str = "https://delivery-eu1.bfl.ai/results/x/sample.png?se=2025-01-01";

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    struct StubProvider {
        status: Mutex<Value>,
    }

    #[async_trait]
    impl GenerationProvider for StubProvider {
        async fn submit(&self, request: &GenerationRequest) -> Result<String, VaultError> {
            if request.0.get("prompt").is_none() {
                return Err(VaultError::Submission("Prompt is required".to_string()));
            }
            Ok("https://api.example/poll?id=42".to_string())
        }

        async fn fetch_status(&self, handle: &str) -> Result<Value, VaultError> {
            if handle.contains("broken") {
                return Err(VaultError::Transport("connection reset".to_string()));
            }
            Ok(self.status.lock().unwrap().clone())
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl ArtifactFetcher for StubFetcher {
        async fn fetch(&self, uri: &str) -> Result<FetchedArtifact, VaultError> {
            if uri.contains("expired") {
                return Err(VaultError::Download(format!("HTTP 403 fetching {}", uri)));
            }
            Ok(FetchedArtifact {
                bytes: b"png-bytes".to_vec(),
                content_type: Some("image/png".to_string()),
            })
        }

        async fn head(&self, uri: &str) -> Result<bool, VaultError> {
            Ok(!uri.contains("expired"))
        }
    }

    fn make_test_state(tmp: &TempDir, tiers: Vec<Arc<dyn StorageBackend>>) -> Arc<AppState> {
        let clock: Arc<dyn Clock> =
            Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap()));
        let storage = Arc::new(TieredStorage::new(tiers, clock.clone()));
        let migrator = Arc::new(ArtifactMigrator::new(
            UrlClassifier::default(),
            Arc::new(StubFetcher),
            storage,
            clock.clone(),
        ));
        Arc::new(AppState {
            config: Arc::new(VaultConfig::default()),
            provider: Arc::new(StubProvider {
                status: Mutex::new(json!({"status": "Processing"})),
            }),
            migrator,
            catalog: Arc::new(MemoryCatalogStore::new()),
            clock,
            public_dir: tmp.path().to_path_buf(),
            start_time: Instant::now(),
            jobs: RwLock::new(HashMap::new()),
        })
    }

    fn local_state(tmp: &TempDir) -> Arc<AppState> {
        make_test_state(tmp, vec![Arc::new(LocalFileBackend::new(tmp.path()))])
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn entry(id: &str, image: &str) -> CatalogEntry {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        CatalogEntry {
            id: id.to_string(),
            user_id: None,
            name: format!("Room {}", id),
            image_url: Some(image.to_string()),
            generated_images: vec![image.to_string()],
            storage_tier: None,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    // =======================================================================
    // Health
    // =======================================================================
    #[tokio::test]
    async fn test_health_reports_tiers_and_catalog() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_seconds"].is_number());
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["storage_tiers"][0]["tier"], "local-file");
        assert_eq!(json["storage_tiers"][1]["tier"], "memory");
        assert_eq!(json["storage_tiers"][1]["durable"], false);
        assert_eq!(json["catalog_persistent"], false);
    }

    // =======================================================================
    // Save image
    // =======================================================================
    #[tokio::test]
    async fn test_save_image_migrates_ephemeral_url() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));

        let response = app
            .oneshot(post_json("/api/save-image", json!({ "imageUrl": EPHEMERAL })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["storageType"], "local");
        assert_eq!(json["durable"], true);
        assert_eq!(json["originalUrl"], EPHEMERAL);
        let local_url = json["localUrl"].as_str().unwrap();
        assert!(local_url.starts_with("/generated-images/"));
        assert!(local_url.ends_with(".png"));
        assert_eq!(json["filename"], local_url.rsplit('/').next().unwrap());
    }

    #[tokio::test]
    async fn test_save_image_already_durable_passthrough() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));

        let response = app
            .oneshot(post_json(
                "/api/save-image",
                json!({ "imageUrl": "/generated-images/existing.png" }),
            ))
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["localUrl"], "/generated-images/existing.png");
        assert!(json.get("storageType").is_none());
    }

    #[tokio::test]
    async fn test_save_image_memory_fallback_is_flagged() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(make_test_state(&tmp, vec![Arc::new(MemoryBackend::new())]));

        let response = app
            .oneshot(post_json("/api/save-image", json!({ "imageUrl": EPHEMERAL, "filename": "kitchen.png" })))
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["storageType"], "memory");
        assert_eq!(json["durable"], false);
        assert_eq!(json["localUrl"], "/api/artifacts/memory/kitchen.png");
    }

    #[tokio::test]
    async fn test_save_image_missing_url_is_400() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(post_json("/api/save-image", json!({ "imageUrl": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_save_image_download_failure_is_502() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(post_json(
                "/api/save-image",
                json!({ "imageUrl": "https://delivery-eu1.bfl.ai/expired.png" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["originalUrl"], "https://delivery-eu1.bfl.ai/expired.png");
    }

    // =======================================================================
    // Static serving of stored artifacts
    // =======================================================================
    #[tokio::test]
    async fn test_saved_image_is_served_statically() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);

        let response = create_router(state.clone())
            .oneshot(post_json("/api/save-image", json!({ "imageUrl": EPHEMERAL, "filename": "hall.png" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = create_router(state)
            .oneshot(get("/generated-images/hall.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"png-bytes");
    }

    #[tokio::test]
    async fn test_memory_artifact_route() {
        let tmp = TempDir::new().unwrap();
        let state = make_test_state(&tmp, vec![Arc::new(MemoryBackend::new())]);
        create_router(state.clone())
            .oneshot(post_json("/api/save-image", json!({ "imageUrl": EPHEMERAL, "filename": "m.png" })))
            .await
            .unwrap();

        let response = create_router(state.clone())
            .oneshot(get("/api/artifacts/memory/m.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/png");

        let response = create_router(state)
            .oneshot(get("/api/artifacts/memory/none.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // =======================================================================
    // Status proxy and URL check
    // =======================================================================
    #[tokio::test]
    async fn test_check_status_forwards_provider_document() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(get(
                "/api/check-status?url=https%3A%2F%2Fapi.us1.bfl.ai%2Fv1%2Fget_result%3Fid%3D1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "Processing");
    }

    #[tokio::test]
    async fn test_check_status_requires_url() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app.oneshot(get("/api/check-status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_check_status_transport_error_is_502() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(get("/api/check-status?url=https://api.bfl.ai/broken"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_check_status_rejects_foreign_host() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(get("/api/check-status?url=https://collector.example/poll?id=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_check_url_reports_classification_and_access() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);

        let response = create_router(state.clone())
            .oneshot(get("/api/check-url?imageUrl=https://delivery-us1.bfl.ai/expired.png"))
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["isEphemeral"], true);
        assert_eq!(json["accessible"], false);
        assert_eq!(json["needsMigration"], true);

        let response = create_router(state)
            .oneshot(get("/api/check-url?imageUrl=/generated-images/a.png"))
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["isEphemeral"], false);
        assert!(json["accessible"].is_null());
        assert_eq!(json["needsMigration"], false);
    }

    // =======================================================================
    // Generation jobs
    // =======================================================================
    #[tokio::test]
    async fn test_generate_creates_job_then_cancel() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);

        let response = create_router(state.clone())
            .oneshot(post_json("/api/generate", json!({ "prompt": "scandinavian bedroom" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["pollingUrl"], "https://api.example/poll?id=42");
        let job_id = json["jobId"].as_str().unwrap().to_string();

        let response = create_router(state.clone())
            .oneshot(get(&format!("/api/jobs/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "Polling");

        let response = create_router(state.clone())
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/jobs/{}", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "Cancelled");
    }

    #[tokio::test]
    async fn test_generate_submission_failure_is_502() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(post_json("/api/generate", json!({ "input_image": "abc" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "submission_error");
    }

    async fn tracked(state: &AppState, request: GenerationRequest) -> Uuid {
        let controller = Arc::new(GenerationController::new(
            state.provider.clone(),
            state.migrator.clone(),
            state.clock.clone(),
            Default::default(),
        ));
        // A request without a prompt is rejected, leaving the job Failed
        let _ = controller.submit(request, |_| {}).await;
        let id = controller.snapshot().id;
        state.track_job(id, controller).await;
        id
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_running_kept() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);
        let running = tracked(&state, GenerationRequest(json!({"prompt": "attic"}))).await;
        let mut failed = Vec::new();
        for _ in 0..4 {
            failed.push(tracked(&state, GenerationRequest::default()).await);
        }
        assert_eq!(state.jobs.read().await.len(), 5);

        let mut jobs = state.jobs.write().await;
        assert_eq!(evict_finished_jobs(&mut jobs, 2), 2);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.contains_key(&running));
        assert_eq!(failed.iter().filter(|id| jobs.contains_key(id)).count(), 2);
        assert_eq!(evict_finished_jobs(&mut jobs, 2), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(get(&format!("/api/jobs/{}", Uuid::now_v7())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_job_invalid_id_is_400() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app.oneshot(get("/api/jobs/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // =======================================================================
    // Catalog maintenance
    // =======================================================================
    #[tokio::test]
    async fn test_catalog_analysis_and_migrate_all() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);
        state.catalog.upsert(entry("a", EPHEMERAL)).await.unwrap();
        state.catalog.upsert(entry("b", "/uploads/b.png")).await.unwrap();

        let response = create_router(state.clone())
            .oneshot(get("/api/catalog/analysis"))
            .await
            .unwrap();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["totalProjects"], 2);
        assert_eq!(json["temporaryProjects"], 1);
        assert_eq!(json["projectsToUpdate"][0]["id"], "a");

        let response = create_router(state.clone())
            .oneshot(post_json("/api/catalog/migrate-all", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["updated"], 1);
        assert_eq!(json["failed"], 0);

        let a = state.catalog.get("a").await.unwrap().unwrap();
        assert!(a.image_url.unwrap().starts_with("/generated-images/"));
    }

    #[tokio::test]
    async fn test_migrate_single_entry() {
        let tmp = TempDir::new().unwrap();
        let state = local_state(&tmp);
        state.catalog.upsert(entry("a", EPHEMERAL)).await.unwrap();

        let response = create_router(state.clone())
            .oneshot(post_json("/api/catalog/a/migrate", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["migrated"].as_array().unwrap().len(), 1);

        let response = create_router(state)
            .oneshot(post_json("/api/catalog/missing/migrate", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_catalog_export_import_round_trip() {
        let tmp = TempDir::new().unwrap();
        let source = local_state(&tmp);
        source.catalog.upsert(entry("a", "/uploads/a.png")).await.unwrap();

        let response = create_router(source)
            .oneshot(get("/api/catalog/export"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let exported = response.into_body().collect().await.unwrap().to_bytes();

        let target = local_state(&tmp);
        let response = create_router(target.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/catalog/import")
                    .header("content-type", "application/json")
                    .body(Body::from(exported.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["imported"], 1);

        // Importing again adds nothing
        let response = create_router(target.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/catalog/import")
                    .body(Body::from(exported))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response.into_body()).await["imported"], 0);
        assert_eq!(target.catalog.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_import_garbage_is_400() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/catalog/import")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_restore_without_backups_is_404() {
        let tmp = TempDir::new().unwrap();
        let app = create_router(local_state(&tmp));
        let response = app
            .oneshot(post_json("/api/catalog/restore", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
