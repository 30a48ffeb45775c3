//! End-of-batch webhook notification.
//!
//! One message per batch: counts plus per-target detail for failures only.
//! Notification failures are logged, never fatal.

use serde_json::json;
use tracing::{info, warn};

use crate::runner::RunReport;

pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn send_batch_summary(&self, reports: &[RunReport], execution_type: &str) {
        let message = format_summary(reports, execution_type);
        let Some(url) = &self.webhook_url else {
            info!("no webhook configured, skipping notification\n{message}");
            return;
        };
        let result = self
            .client
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!("batch summary notification sent");
            }
            Ok(response) => warn!(status = %response.status(), "notification rejected"),
            Err(e) => warn!("notification failed: {e}"),
        }
    }
}

fn format_summary(reports: &[RunReport], execution_type: &str) -> String {
    let successful = reports.iter().filter(|r| r.success).count();
    let total = reports.len();
    let mut message = format!(
        "ASP harvest ({execution_type}): {successful}/{total} succeeded, {} records saved",
        reports.iter().map(|r| r.records_saved).sum::<u32>()
    );
    for report in reports.iter().filter(|r| !r.success) {
        message.push_str(&format!(
            "\n- {}: {}",
            report.asp,
            report.error.as_deref().unwrap_or("unknown error")
        ));
    }
    message
}
