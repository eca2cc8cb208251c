//! Approval commands against a running API server.

use anyhow::{Context, Result};
use serde_json::{Value, json};

pub async fn approve(api_url: &str, lane: &str, by: Option<String>) -> Result<()> {
    let summary = post_decision(api_url, lane, "approve", json!({ "by": by })).await?;
    println!("Approved lane {}: {}", lane, summary["state"]["state"]);
    Ok(())
}

pub async fn reject(
    api_url: &str,
    lane: &str,
    by: Option<String>,
    reason: Option<String>,
) -> Result<()> {
    let summary = post_decision(
        api_url,
        lane,
        "reject",
        json!({ "by": by, "reason": reason }),
    )
    .await?;
    println!("Rejected lane {}: {}", lane, summary["state"]["state"]);
    Ok(())
}

async fn post_decision(api_url: &str, lane: &str, action: &str, body: Value) -> Result<Value> {
    let url = format!(
        "{}/api/v1/lanes/{}/{}",
        api_url.trim_end_matches('/'),
        lane,
        action
    );
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    let body: Value = response.json().await.context("Invalid response body")?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{} ({})", message, status);
    }
    Ok(body)
}
