// CLI catalog commands: list, analyze, migrate-all, export, import, restore

use std::path::Path;

use anyhow::Context;

use super::CatalogAction;
use crate::daemon::{build_services, effective_data_dir, load_config, Services};
use crate::models::CatalogEntry;

pub async fn cmd_catalog(
    config_path: Option<&Path>,
    data_dir: Option<&Path>,
    action: &CatalogAction,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let data_dir = effective_data_dir(&config, data_dir);
    let services = build_services(config, data_dir).await?;
    if !services.catalog.is_persistent() {
        eprintln!("Warning: catalog directory is not writable; working on an empty in-memory catalog");
    }
    run_action(&services, action).await
}

async fn run_action(services: &Services, action: &CatalogAction) -> anyhow::Result<()> {
    let catalog = services.catalog.as_ref();
    match action {
        CatalogAction::List { json } => {
            let entries = catalog.list().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", format_entries(&entries));
            }
        }
        CatalogAction::Analyze => {
            let entries = catalog.list().await?;
            let mut pending = 0;
            for entry in &entries {
                let images = services.migrator.ephemeral_images(entry);
                if images.is_empty() {
                    continue;
                }
                pending += 1;
                println!("{} ({})", entry.id, entry.name);
                for image in images {
                    println!("  {}", image);
                }
            }
            println!(
                "{} of {} entries reference ephemeral images",
                pending,
                entries.len()
            );
        }
        CatalogAction::MigrateAll => {
            let summary = services.migrator.migrate_catalog(catalog).await?;
            for result in &summary.results {
                for err in &result.errors {
                    eprintln!("{}: {}", result.id, err);
                }
            }
            println!(
                "Updated: {}  Failed: {}  Skipped: {}",
                summary.updated, summary.failed, summary.skipped
            );
        }
        CatalogAction::Export { output } => {
            let json = catalog.export_json().await?;
            match output {
                Some(path) => {
                    tokio::fs::write(path, json)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Catalog exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        CatalogAction::Import { file } => {
            let json = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let imported = catalog.import_json(&json).await?;
            println!("Imported {} new entries", imported);
        }
        CatalogAction::Restore => match catalog.restore_latest_backup().await? {
            Some(backup) => println!("Catalog restored from {}", backup),
            None => anyhow::bail!("No catalog backup available to restore"),
        },
    }
    Ok(())
}

fn format_entries(entries: &[CatalogEntry]) -> String {
    if entries.is_empty() {
        return "No catalog entries found.\n".to_string();
    }

    let mut out = format!("{:<24}{:<28}{:<16}{}\n", "ID", "NAME", "TIER", "IMAGE");
    for entry in entries {
        let name = if entry.name.chars().count() > 27 {
            format!("{}...", entry.name.chars().take(24).collect::<String>())
        } else {
            entry.name.clone()
        };
        let tier = entry
            .storage_tier
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<24}{:<28}{:<16}{}\n",
            entry.id,
            name,
            tier,
            entry.image_url.as_deref().unwrap_or("-")
        ));
    }
    out
}
