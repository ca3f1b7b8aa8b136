//! Out-of-band push notifications for offline recipients.
//!
//! Notifications are best effort: a failure is observed only in the logs and
//! never reaches the sender or affects delivery.

use std::time::Duration;

use serde_json::json;

/// Sends a notification to a stored push endpoint.
///
/// Implementations must not block the caller and must swallow their own
/// errors.
pub trait PushNotifier: Send + Sync {
    fn notify(&self, endpoint: &str, title: &str, body: &str);
}

/// Notifier used when push is disabled.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl PushNotifier for NoopNotifier {
    fn notify(&self, _endpoint: &str, _title: &str, _body: &str) {}
}

/// POSTs `{"title", "body"}` as JSON to the subscriber's endpoint.
#[derive(Debug, Clone)]
pub struct HttpPushNotifier {
    client: reqwest::Client,
}

impl HttpPushNotifier {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build push HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl PushNotifier for HttpPushNotifier {
    fn notify(&self, endpoint: &str, title: &str, body: &str) {
        let client = self.client.clone();
        let endpoint = endpoint.to_string();
        let payload = json!({ "title": title, "body": body });

        tokio::spawn(async move {
            match client.post(&endpoint).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(endpoint = endpoint.as_str(), "Push notification sent");
                }
                Ok(resp) => {
                    tracing::warn!(
                        endpoint = endpoint.as_str(),
                        status = resp.status().as_u16(),
                        "Push endpoint rejected notification"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = endpoint.as_str(),
                        error = %e,
                        "Push notification failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::PushNotifier;

    /// Records every notification instead of sending it.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String, String)>>,
    }

    impl PushNotifier for RecordingNotifier {
        fn notify(&self, endpoint: &str, title: &str, body: &str) {
            self.sent
                .lock()
                .push((endpoint.to_string(), title.to_string(), body.to_string()));
        }
    }
}
