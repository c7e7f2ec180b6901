// backuptool/src/notify/mod.rs
use std::env;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::orchestrator::job::{JobOutcome, JobRecord, PhaseOutcome};

/// Gotify push notifications for finished jobs. Optional: missing env
/// configuration disables it, and a failed send is only ever a warning.
pub struct GotifyNotifier {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl GotifyNotifier {
    /// Reads `GOTIFY_URL` and `GOTIFY_TOKEN`; returns `None` (notifications
    /// disabled) when either is missing.
    pub fn from_env() -> Option<Self> {
        let url = env::var("GOTIFY_URL").ok().filter(|s| !s.is_empty())?;
        let token = env::var("GOTIFY_TOKEN").ok().filter(|s| !s.is_empty())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self { url, token, client })
    }

    pub async fn send(&self, title: &str, message: &str, priority: u8) {
        let result = self
            .client
            .post(&self.url)
            .query(&[("token", self.token.as_str())])
            .json(&json!({ "title": title, "message": message, "priority": priority }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        match result {
            Ok(_) => debug!(title, "notification sent"),
            Err(err) => warn!(%err, "could not send notification"),
        }
    }

    pub async fn notify_job(&self, record: &JobRecord) {
        let Some(outcome) = record.outcome else {
            return;
        };
        let (title, priority) = match outcome {
            JobOutcome::Success => (format!("✅ Backup {} succeeded", record.target), 3),
            JobOutcome::Partial => (format!("⚠️ Backup {} partially succeeded", record.target), 5),
            JobOutcome::Failed => (format!("❌ Backup {} FAILED", record.target), 8),
        };
        self.send(&title, &describe(record), priority).await;
    }
}

fn describe(record: &JobRecord) -> String {
    let failed: Vec<String> = record
        .phases
        .iter()
        .filter(|p| p.outcome == PhaseOutcome::Failed)
        .map(|p| match &p.error_class {
            Some(class) => format!("{} ({})", p.phase, class),
            None => p.phase.to_string(),
        })
        .collect();
    if failed.is_empty() {
        "All phases completed successfully.".to_string()
    } else {
        format!("Failed phases: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::job::{JobPhase, PhaseReport};
    use uuid::Uuid;

    #[test]
    fn test_describe_lists_failed_phases_with_their_class() {
        let mut record = JobRecord::new(Uuid::new_v4(), "tank-data");
        let mut report = PhaseReport::skipped(JobPhase::RemoteSyncing);
        report.outcome = PhaseOutcome::Failed;
        report.error_class = Some("network".to_string());
        record.record_phase(report);

        assert_eq!(describe(&record), "Failed phases: remote_syncing (network)");
    }

    #[test]
    fn test_describe_of_clean_record() {
        let record = JobRecord::new(Uuid::new_v4(), "tank-data");
        assert_eq!(describe(&record), "All phases completed successfully.");
    }
}
