// CLI server commands: status

use reqwest::Client;
use serde_json::Value;

use super::{base_url, connection_error_message};

fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// avault status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Server returned an error");
        anyhow::bail!("{}", message);
    }

    println!("{}", format_status(&body, host, port));

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

fn format_status(body: &Value, host: &str, port: u16) -> String {
    let server_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
    let active_jobs = body["active_jobs"].as_u64().unwrap_or(0);
    let tracked_jobs = body["tracked_jobs"].as_u64().unwrap_or(0);
    let data_dir = body["data_dir"].as_str().unwrap_or("unknown");
    let catalog = if body["catalog_persistent"].as_bool().unwrap_or(false) {
        "persistent"
    } else {
        "in-memory (degraded)"
    };

    let tiers: Vec<String> = body["storage_tiers"]
        .as_array()
        .map(|tiers| {
            tiers
                .iter()
                .map(|t| {
                    let name = t["tier"].as_str().unwrap_or("?");
                    if t["durable"].as_bool().unwrap_or(false) {
                        name.to_string()
                    } else {
                        format!("{} (volatile)", name)
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let mut out = String::new();
    out.push_str(&format!("Server Status: {}\n", server_status));
    out.push_str(&format!("  Data Dir:    {}\n", data_dir));
    out.push_str(&format!("  API:         http://{}:{}\n", host, port));
    out.push_str(&format!("  Storage:     {}\n", tiers.join(" -> ")));
    out.push_str(&format!("  Catalog:     {}\n", catalog));
    out.push_str(&format!(
        "  Jobs:        {} active / {} tracked\n",
        active_jobs, tracked_jobs
    ));
    out.push_str(&format!("  Uptime:      {}\n", format_uptime(uptime)));
    out.push_str(&format!("  Version:     {}", version));
    out
}

/// Format uptime seconds into a human-readable string.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
