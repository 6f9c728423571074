//! Status command implementation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    #[serde(default)]
    components: BTreeMap<String, ComponentStatus>,
    #[serde(default)]
    sources: Vec<SourceStatus>,
    #[serde(default)]
    subscribers: usize,
    last_sync: Option<String>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// One source as reported by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceStatus {
    id: String,
    kind: String,
    location: String,
    enabled: bool,
    state: String,
    last_update: Option<String>,
    last_record_count: usize,
    error_count: u64,
    last_error_message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let base = url.trim_end_matches('/').trim_end_matches("/health");
    let health_url = format!("{}/health", base);
    let client = reqwest::Client::new();

    let response = client
        .get(&health_url)
        .send()
        .await
        .with_context(|| format!("Health endpoint unreachable at {}", health_url))?;
    let status_code = response.status();
    let health: HealthResponse = response
        .json()
        .await
        .with_context(|| format!("Invalid health response (HTTP {})", status_code))?;

    print_health_status(&health, status_code.as_u16());
    print_sources(&health.sources);

    // Metrics live on their own port; the default layout is health 8080, metrics 9090
    let metrics_url = format!("{}/metrics", base.replace(":8080", ":9090"));
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    if health.status == "unhealthy" {
        bail!("Health check failed: service reports unhealthy");
    }
    Ok(())
}

fn marker(status: &str) -> &'static str {
    match status {
        "healthy" | "watching" => "[OK]",
        "degraded" | "registered" | "ingesting" => "[WARN]",
        "unhealthy" | "error" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        marker(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Subscribers: {}   Last sync: {}",
        health.subscribers,
        health.last_sync.as_deref().unwrap_or("never")
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            if let Some(reason) = &status.reason {
                println!("  {} {}: {} ({})", marker(&status.status), name, status.status, reason);
            } else {
                println!("  {} {}: {}", marker(&status.status), name, status.status);
            }
        }
    }
}

fn print_sources(sources: &[SourceStatus]) {
    if sources.is_empty() {
        println!("\nNo sources registered.");
        return;
    }

    println!("\nSources:");
    for source in sources {
        let state = if source.enabled {
            source.state.as_str()
        } else {
            "disabled"
        };
        println!(
            "  {} {} [{}] {}",
            marker(state),
            source.id,
            source.kind,
            source.location
        );
        println!(
            "      state: {}, records: {}, last update: {}, errors: {}",
            state,
            source.last_record_count,
            source.last_update.as_deref().unwrap_or("never"),
            source.error_count
        );
        if let Some(message) = &source.last_error_message {
            println!("      last error: {}", message);
        }
    }
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);

    if let Some(v) = values.get("tankfeed_records_total") {
        println!("Records Ingested:  {}", format_number(*v));
    }
    if let Some(v) = values.get("tankfeed_cycles_total") {
        println!("Ingestion Cycles:  {}", v);
    }
    if let Some(v) = values.get("tankfeed_broadcasts_total") {
        println!("Broadcasts:        {}", v);
    }
    if let Some(v) = values.get("tankfeed_deliveries_total") {
        println!("Deliveries:        {}", format_number(*v));
    }
    if let Some(v) = values.get("tankfeed_errors_total") {
        println!("Errors:            {}", v);
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

/// Collect integer samples from the Prometheus text format, keyed by series.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, u64> {
    let mut values = HashMap::new();
    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            if let Ok(value) = parts[1].parse::<u64>() {
                values.insert(parts[0], value);
            }
        }
    }
    values
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_response() {
        let body = r#"{
            "status": "degraded",
            "components": {
                "registry": {"status": "healthy", "updatedAt": "2024-01-01T00:00:00Z"},
                "source:yard": {"status": "unhealthy", "reason": "parse error", "updatedAt": "2024-01-01T00:00:00Z"}
            },
            "sources": [{
                "id": "yard", "kind": "file", "location": "/data/yard.csv", "format": "auto",
                "enabled": true, "state": "error", "lastUpdate": null, "lastRecordCount": 0,
                "errorCount": 2, "lastErrorMessage": "parse error"
            }],
            "subscribers": 3,
            "lastSync": null
        }"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.status, "degraded");
        assert_eq!(health.components["source:yard"].reason.as_deref(), Some("parse error"));
        assert_eq!(health.sources[0].error_count, 2);
        assert_eq!(health.subscribers, 3);
    }

    #[test]
    fn test_parse_metrics_keeps_integer_samples() {
        let text = "# HELP tankfeed_records_total x\ntankfeed_records_total 42\ntankfeed_errors{type=\"io\"} 1\ntankfeed_ingestion_duration_seconds_sum 0.5\n";
        let values = parse_metrics(text);
        assert_eq!(values.get("tankfeed_records_total"), Some(&42));
        assert_eq!(values.get("tankfeed_errors{type=\"io\"}"), Some(&1));
        assert!(!values.contains_key("tankfeed_ingestion_duration_seconds_sum"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }
}
