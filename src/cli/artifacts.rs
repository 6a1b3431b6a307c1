// CLI artifact commands: classify, migrate, generate

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::controller::GenerationController;
use crate::daemon::{build_classifier, build_services, effective_data_dir, load_config};
use crate::models::{ArtifactReference, GenerationRequest, JobOutcome};
use crate::poller::PollTick;

/// avault classify
pub fn cmd_classify(config_path: Option<&Path>, urls: &[String], json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let classifier = build_classifier(&config);

    let references: Vec<ArtifactReference> = urls
        .iter()
        .map(|uri| ArtifactReference {
            uri: uri.clone(),
            is_ephemeral: classifier.is_ephemeral(uri),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&references)?);
        return Ok(());
    }

    for reference in &references {
        let label = if reference.is_ephemeral {
            "ephemeral"
        } else {
            "durable"
        };
        println!("{:<11}{}", label, reference.uri);
    }
    Ok(())
}

/// avault migrate
pub async fn cmd_migrate(
    config_path: Option<&Path>,
    data_dir: Option<&Path>,
    url: &str,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let data_dir = effective_data_dir(&config, data_dir);
    let services = build_services(config, data_dir).await?;

    let record = services
        .migrator
        .migrate(url, name)
        .await
        .with_context(|| format!("Failed to migrate {}", url))?;

    if !record.is_durable() {
        eprintln!(
            "Warning: stored in the '{}' tier only; the artifact will not survive this process",
            record.tier
        );
    }
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Request body from either a JSON file or the prompt flags.
pub fn build_request(
    prompt: Option<&str>,
    input_image: Option<&str>,
    request_file: Option<&Path>,
) -> anyhow::Result<GenerationRequest> {
    if let Some(path) = request_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?;
        let body: Value = serde_json::from_str(&content)
            .with_context(|| format!("Request file {} is not valid JSON", path.display()))?;
        if !body.is_object() {
            anyhow::bail!("Request file {} must contain a JSON object", path.display());
        }
        return Ok(GenerationRequest(body));
    }

    let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) else {
        anyhow::bail!("Either --prompt or --request is required");
    };
    let mut body = json!({ "prompt": prompt });
    if let Some(image) = input_image {
        body["input_image"] = Value::String(image.to_string());
    }
    Ok(GenerationRequest(body))
}

fn describe_tick(tick: &PollTick) -> String {
    format!("[{}] {:?}", tick.attempt, tick.status)
}

/// avault generate
///
/// Runs one job in-process and prints its outcome. Ctrl+C cancels the job.
pub async fn cmd_generate(
    config_path: Option<&Path>,
    data_dir: Option<&Path>,
    request: GenerationRequest,
    progress: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let data_dir = effective_data_dir(&config, data_dir);
    let services = build_services(config, data_dir).await?;

    let mut controller = GenerationController::new(
        services.provider.clone(),
        services.migrator.clone(),
        services.clock.clone(),
        services.poll_settings(),
    );
    if progress {
        controller = controller.with_progress(|tick| eprintln!("{}", describe_tick(tick)));
    }
    let controller = Arc::new(controller);

    let (tx, rx) = oneshot::channel::<JobOutcome>();
    let handle = controller
        .submit(request, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await
        .context("Generation request was not accepted")?;
    eprintln!("Submitted; polling {}", handle);

    let outcome = tokio::select! {
        outcome = rx => outcome.context("Job ended without an outcome")?,
        _ = tokio::signal::ctrl_c() => {
            controller.cancel();
            anyhow::bail!("Cancelled");
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome {
        JobOutcome::Completed {
            migration_error: Some(err),
            ..
        } => {
            eprintln!("Warning: result was not migrated: {}", err);
            Ok(())
        }
        JobOutcome::Completed { .. } => Ok(()),
        JobOutcome::Failed { error_detail } => anyhow::bail!("Generation failed: {}", error_detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_request_from_prompt() {
        let req = build_request(Some("warm loft"), Some("aGVsbG8="), None).unwrap();
        assert_eq!(req.0["prompt"], "warm loft");
        assert_eq!(req.0["input_image"], "aGVsbG8=");
    }

    #[test]
    fn test_build_request_requires_prompt() {
        let err = build_request(None, None, None).unwrap_err();
        assert!(err.to_string().contains("--prompt"));
        assert!(build_request(Some("   "), None, None).is_err());
    }

    #[test]
    fn test_build_request_from_file_passes_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("req.json");
        std::fs::write(&path, r#"{"prompt": "attic", "aspect_ratio": "16:9", "seed": 7}"#).unwrap();

        let req = build_request(None, None, Some(&path)).unwrap();
        assert_eq!(req.0["aspect_ratio"], "16:9");
        assert_eq!(req.0["seed"], 7);
    }

    #[test]
    fn test_build_request_file_must_be_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("req.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(build_request(None, None, Some(&path)).is_err());
    }

    #[tokio::test]
    async fn test_migrate_already_durable_reference_needs_no_network() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("config.json");
        std::fs::write(&cfg, "{}").unwrap();

        cmd_migrate(
            Some(&cfg),
            Some(tmp.path()),
            "/generated-images/existing.png",
            None,
        )
        .await
        .expect("durable reference passes through");
    }

    #[tokio::test]
    async fn test_migrate_rejects_empty_reference() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("config.json");
        std::fs::write(&cfg, "{}").unwrap();

        let err = cmd_migrate(Some(&cfg), Some(tmp.path()), "  ", None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("empty"));
    }

    #[tokio::test]
    async fn test_generate_without_api_key_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("config.json");
        std::fs::write(&cfg, r#"{"provider": {"api_key": ""}}"#).unwrap();

        let request = build_request(Some("hall"), None, None).unwrap();
        let err = cmd_generate(Some(&cfg), Some(tmp.path()), request, false)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("API key"), "got: {:#}", err);
    }
}
