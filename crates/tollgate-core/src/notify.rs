use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

/// Operational alert for the ops channel
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Short machine-friendly category, e.g. `settlement.failed_reset`
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Sink for operational alerts
///
/// Delivery is fire-and-forget: implementations must not block and must never
/// surface failures to the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: Alert) {
        tracing::warn!(kind = alert.kind, detail = %alert.message, "operational alert");
    }
}

/// Posts alerts as JSON to a webhook from a background task
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl WebhookNotifier {
    /// Build the HTTP client and spawn the delivery task
    ///
    /// The task runs until every handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(deliver(rx, http, url));

        Ok(Self { tx })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, alert: Alert) {
        if let Err(e) = self.tx.send(alert) {
            tracing::warn!(error = %e, "failed to enqueue alert, channel closed");
        }
    }
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier").finish_non_exhaustive()
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Alert>, http: reqwest::Client, url: Url) {
    while let Some(alert) = rx.recv().await {
        let result = http
            .post(url.clone())
            .json(&alert)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => tracing::debug!(kind = alert.kind, "alert delivered"),
            Err(e) => tracing::warn!(error = %e, kind = alert.kind, "alert delivery failed"),
        }
    }

    tracing::debug!("alert notifier shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_receives_alert() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ops"))
            .and(body_partial_json(serde_json::json!({ "kind": "test.alert", "message": "hello" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/ops", server.uri())).unwrap();
        let notifier = WebhookNotifier::new(url, Duration::from_secs(2)).unwrap();
        notifier.notify(Alert::new("test.alert", "hello"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn webhook_failure_does_not_panic() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let notifier = WebhookNotifier::new(url, Duration::from_secs(2)).unwrap();
        notifier.notify(Alert::new("test.alert", "first"));
        notifier.notify(Alert::new("test.alert", "second"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
