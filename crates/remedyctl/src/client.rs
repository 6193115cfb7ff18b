//! HTTP client for the remedyd API.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one remedyd instance
pub struct RemedydClient {
    base: String,
    http: reqwest::Client,
}

impl RemedydClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn unreachable(&self, e: reqwest::Error) -> anyhow::Error {
        anyhow!(
            "Cannot reach remedyd at {}: {}\n\n\
             Is the daemon running? Check with:\n\
             systemctl status remedyd",
            self.base,
            e
        )
    }

    /// GET /health; a 503 still carries the report
    pub async fn health(&self) -> Result<Value> {
        let response = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(response.json().await?)
    }

    pub async fn metrics(&self) -> Result<Value> {
        self.get_json("/v1/metrics").await
    }

    pub async fn metrics_text(&self) -> Result<String> {
        let response = self
            .http
            .get(self.url("/metrics"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(response.error_for_status()?.text().await?)
    }

    pub async fn funnel(&self, days: i64) -> Result<Value> {
        self.get_json(&format!("/v1/metrics/funnel?days={}", days)).await
    }

    pub async fn decide(
        &self,
        ticket_id: &str,
        request_id: &str,
        approved: bool,
        decided_by: Option<&str>,
    ) -> Result<Value> {
        let body = serde_json::json!({
            "ticket_id": ticket_id,
            "request_id": request_id,
            "approved": approved,
            "decided_by": decided_by,
        });
        let response = self
            .http
            .post(self.url("/v1/approvals"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Approval rejected ({}): {}", status, text));
        }
        Ok(response.json().await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed ({}): {}", path, status, text));
        }
        Ok(response.json().await?)
    }
}
