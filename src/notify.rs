//! Chat notifications for finished runs.
//!
//! After a trigger settles, the project's chat space receives one card with the
//! app, project, status, commit and duration of the run. Delivery failures are
//! logged and never change the outcome of the run.

use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::error::{PilotError, Result};
use crate::reconciler::{Outcome, RunStatus};
use crate::trigger::RunSummary;

/// Default delivery timeout in seconds.
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

/// Posts run summaries to chat webhooks.
#[derive(Debug, Clone)]
pub struct ChatNotifier {
    client: Client,
}

impl ChatNotifier {
    /// Creates a notifier with the given delivery timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PilotError::Internal(format!("Failed to create chat client: {e}")))?;
        Ok(Self { client })
    }

    /// Sends `summary` to the channel if its status is one the channel wants.
    ///
    /// Returns true when the webhook accepted the message.
    pub async fn notify(&self, channel: &NotificationConfig, app: &str, summary: &RunSummary) -> bool {
        if !channel.wants(summary.status) {
            debug!("Chat channel ignores {:?} runs of {}", summary.status, summary.project_id);
            return false;
        }

        let thread_key = format!("provision_pilot_{}_{}", summary.project_id, summary.commit_sha);
        let result = self
            .client
            .post(&channel.webhook_url)
            .query(&[("threadKey", thread_key.as_str())])
            .json(&card(app, summary))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => {
                debug!("Notified chat about {} at {}", summary.project_id, summary.commit_sha);
                true
            }
            Err(e) => {
                warn!("Failed to notify chat about {}: {e}", summary.project_id);
                false
            }
        }
    }
}

/// Headline verb for a status, e.g. `HAS BEEN DEPLOYED TO`.
const fn headline(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Succeeded => "HAS BEEN DEPLOYED TO",
        RunStatus::PartiallyFailed => "WAS PARTIALLY DEPLOYED TO",
        RunStatus::Failed => "FAILED TO DEPLOY TO",
        RunStatus::Rejected => "WAS NOT DEPLOYED TO",
    }
}

fn card(app: &str, summary: &RunSummary) -> Value {
    let subtitle = format!("{} {}", headline(summary.status), summary.project_id.to_uppercase());

    let mut widgets = vec![text_widget("Commit", &summary.commit_sha)];
    if let Some(ms) = summary.duration_ms {
        widgets.push(text_widget("Duration", &format_duration(ms)));
    }
    if let Some(reason) = &summary.reason {
        widgets.push(text_widget("Reason", reason));
    }
    let failed: Vec<String> = summary
        .operations
        .iter()
        .filter_map(|op| match &op.outcome {
            Outcome::Failed { message, .. } => Some(format!("{}/{}: {message}", op.kind, op.identity)),
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        widgets.push(text_widget("Failed", &failed.join("\n")));
    }

    json!({
        "text": format!("{app} {subtitle}"),
        "cardsV2": [{
            "cardId": format!("run-{}", summary.project_id),
            "card": {
                "header": { "title": app, "subtitle": subtitle },
                "sections": [{ "widgets": widgets }],
            },
        }],
    })
}

fn text_widget(label: &str, text: &str) -> Value {
    json!({ "decoratedText": { "topLabel": label, "text": text } })
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::planner::Action;
    use crate::resource::ResourceKind;
    use crate::trigger::OperationSummary;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(server: &MockServer, notify_on: Vec<RunStatus>) -> NotificationConfig {
        NotificationConfig {
            webhook_url: format!("{}/v1/spaces/AAA/messages", server.uri()),
            notify_on,
        }
    }

    fn failed_summary() -> RunSummary {
        RunSummary {
            project_id: String::from("shop"),
            plan_id: None,
            commit_sha: String::from("abc123"),
            status: RunStatus::PartiallyFailed,
            reason: None,
            duration_ms: Some(83_000),
            operations: vec![OperationSummary {
                kind: ResourceKind::ServiceDeployment,
                identity: String::from("api"),
                action: Action::Update,
                outcome: Outcome::Failed {
                    class: FailureClass::Permanent,
                    message: String::from("quota exceeded"),
                    attempts: 1,
                },
            }],
        }
    }

    #[test]
    fn test_card_names_app_project_and_failures() {
        let card = card("api", &failed_summary());

        assert_eq!(card["text"], "api WAS PARTIALLY DEPLOYED TO SHOP");
        let widgets = &card["cardsV2"][0]["card"]["sections"][0]["widgets"];
        assert_eq!(widgets[0]["decoratedText"]["text"], "abc123");
        assert_eq!(widgets[1]["decoratedText"]["text"], "1m 23s");
        assert_eq!(
            widgets[2]["decoratedText"]["text"],
            "service_deployment/api: quota exceeded"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1_250), "1.2s");
        assert_eq!(format_duration(3_600_000), "60m 0s");
    }

    #[tokio::test]
    async fn test_posts_card_to_webhook_in_commit_thread() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/spaces/AAA/messages"))
            .and(query_param("threadKey", "provision_pilot_shop_abc123"))
            .and(body_partial_json(json!({ "cardsV2": [{ "card": { "header": { "title": "api" } } }] })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = ChatNotifier::new(Duration::from_secs(5)).expect("notifier");
        let sent = notifier
            .notify(&channel(&server, vec![RunStatus::PartiallyFailed]), "api", &failed_summary())
            .await;
        assert!(sent);
    }

    #[tokio::test]
    async fn test_unwanted_status_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let notifier = ChatNotifier::new(Duration::from_secs(5)).expect("notifier");
        let sent = notifier
            .notify(&channel(&server, vec![RunStatus::Failed]), "api", &failed_summary())
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_webhook_error_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = ChatNotifier::new(Duration::from_secs(5)).expect("notifier");
        let sent = notifier
            .notify(&channel(&server, vec![RunStatus::PartiallyFailed]), "api", &failed_summary())
            .await;
        assert!(!sent);
    }
}
