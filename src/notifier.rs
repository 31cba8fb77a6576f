//! Slack notifier (C7): best-effort incoming-webhook alerts.
//!
//! A failed or slow notification must never affect the pipeline it's
//! reporting on, so every send is bounded and swallows its own errors after
//! logging them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

/// Bounded timeout for a webhook POST; an alert that can't be delivered
/// this quickly is dropped rather than held up.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Good,
    Warning,
    Danger,
}

impl Severity {
    fn color(self) -> &'static str {
        match self {
            Severity::Good => "good",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

/// Fire-and-forget Slack incoming-webhook client. Disabled entirely when no
/// webhook URL is configured.
pub struct Notifier {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Post an alert to the configured webhook. Any failure is logged and
    /// swallowed; callers never see a notification error.
    pub async fn send_alert(&self, title: &str, message: &str, severity: Severity) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let payload = json!({
            "attachments": [{
                "color": severity.color(),
                "title": title,
                "text": message,
                "ts": ts,
            }]
        });

        let result = self
            .http
            .post(url)
            .timeout(SEND_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(title, "sent Slack notification");
            }
            Ok(response) => {
                tracing::warn!(title, status = %response.status(), "Slack webhook returned non-success");
            }
            Err(e) => {
                tracing::warn!(title, error = %e, "failed to send Slack notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notifier_reports_not_enabled() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
    }

    #[test]
    fn configured_notifier_reports_enabled() {
        let notifier = Notifier::new(Some("https://hooks.slack.com/services/x".to_string()));
        assert!(notifier.is_enabled());
    }

    #[tokio::test]
    async fn send_alert_on_disabled_notifier_is_a_no_op() {
        let notifier = Notifier::disabled();
        // Must return promptly without attempting any network I/O.
        notifier.send_alert("title", "message", Severity::Danger).await;
    }
}
