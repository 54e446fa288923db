//! Webhook push transport.
//!
//! Posts the payload as JSON to the subscription's endpoint URL. The
//! endpoint's auth secret travels in a header so gateways can verify the
//! sender without parsing the body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use nudge_core::traits::{PushTransport, TransportReply};
use nudge_core::types::{PushPayload, PushSubscription};

pub struct WebhookTransport {
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
}

impl WebhookTransport {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl PushTransport for WebhookTransport {
    async fn send(&self, sub: &PushSubscription, payload: &PushPayload) -> TransportReply {
        let wire = WirePayload {
            title: &payload.title,
            body: &payload.body,
            icon: payload.icon.as_deref(),
            action_url: payload.action_url.as_deref(),
            tag: payload.tag.as_deref(),
        };

        let resp = self
            .client
            .post(&sub.endpoint)
            .header("X-Push-Auth", &sub.auth)
            .header("X-Push-Key", &sub.p256dh)
            .json(&wire)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("⚠️ Push to {} failed: {e}", sub.endpoint);
                return TransportReply::transient(&format!("request failed: {e}"));
            }
        };

        let status = resp.status();
        match status {
            s if s.is_success() => {
                let delivery_id = resp
                    .headers()
                    .get("x-delivery-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                TransportReply::ok(delivery_id)
            }
            // The endpoint no longer exists; the subscription is dead.
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                TransportReply::gone(&format!("endpoint gone ({status})"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                TransportReply {
                    retry_after_secs: retry_after,
                    ..TransportReply::transient("rate limited by endpoint")
                }
            }
            s if s.is_client_error() => {
                // Our payload or keys are wrong for this endpoint; retrying
                // the same bytes cannot help.
                TransportReply::gone(&format!("endpoint rejected push ({status})"))
            }
            s => TransportReply::transient(&format!("endpoint error ({s})")),
        }
    }
}
