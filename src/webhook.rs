//! Inbound webhook transport — signature-verified LINE callback endpoint.
//!
//! The provider signs each delivery with base64(HMAC-SHA256(channel secret,
//! body)); anything unsigned or mis-signed is rejected with 400 before the
//! payload is even parsed. Once dispatched, the endpoint always answers 200
//! so the provider does not re-deliver.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::WebhookError;
use crate::handler::{InboundEvent, InboundHandler};
use crate::store::{JobStatus, Store};

/// Signature header set by the messaging provider.
const SIGNATURE_HEADER: &str = "x-line-signature";

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub handler: Arc<InboundHandler>,
    pub store: Arc<dyn Store>,
    pub channel_secret: SecretString,
}

/// Build the webhook + ops router.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/callback", post(callback))
        .route("/healthz", get(healthz))
        .route("/api/jobs/failed", get(failed_jobs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /callback — the provider's webhook delivery.
async fn callback(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = verify_signature(state.channel_secret.expose_secret(), &body, signature) {
        warn!("Rejected webhook delivery: {e}");
        return (StatusCode::BAD_REQUEST, "bad signature").into_response();
    }

    let events = match parse_events(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!("Rejected webhook delivery: {e}");
            return (StatusCode::BAD_REQUEST, "bad payload").into_response();
        }
    };

    for event in &events {
        // Store failures are logged, not surfaced: the handshake completes
        // either way and the fire loop / next event picks up from durable
        // state.
        if let Err(e) = state.handler.handle_event(event).await {
            error!(user_id = %event.user_id, "Inbound event handling failed: {e}");
        }
    }

    (StatusCode::OK, "OK").into_response()
}

/// GET /healthz — liveness probe.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /api/jobs/failed — terminal-failed jobs for operator visibility.
async fn failed_jobs(State(state): State<WebhookState>) -> impl IntoResponse {
    match state.store.jobs_by_status(JobStatus::Failed, 100).await {
        Ok(jobs) => axum::Json(jobs).into_response(),
        Err(e) => {
            error!("Failed-job listing unavailable: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

/// Verify the provider signature over the raw body.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), WebhookError> {
    let signature = signature.ok_or(WebhookError::MissingSignature)?;
    let expected = BASE64
        .decode(signature)
        .map_err(|_| WebhookError::BadSignature)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::BadSignature)
}

// ── Payload parsing ─────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct Envelope {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(serde::Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "replyToken")]
    reply_token: Option<String>,
    source: Option<RawSource>,
    message: Option<RawMessage>,
}

#[derive(serde::Deserialize)]
struct RawSource {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(serde::Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    message_type: String,
    text: Option<String>,
}

/// Extract the text-message events from a webhook envelope. Other event
/// types (follows, stickers, images) are skipped, not errors.
pub fn parse_events(body: &[u8]) -> Result<Vec<InboundEvent>, WebhookError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| WebhookError::BadPayload(e.to_string()))?;

    let events = envelope
        .events
        .into_iter()
        .filter_map(|raw| {
            if raw.event_type != "message" {
                return None;
            }
            let message = raw.message?;
            if message.message_type != "text" {
                return None;
            }
            Some(InboundEvent {
                user_id: raw.source?.user_id?,
                text: message.text?,
                reply_token: raw.reply_token?,
            })
        })
        .collect();

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_accepted() {
        let body = br#"{"events":[]}"#;
        let sig = sign("secret", body);
        assert!(verify_signature("secret", body, Some(&sig)).is_ok());
    }

    #[test]
    fn missing_signature_rejected() {
        assert!(matches!(
            verify_signature("secret", b"{}", None),
            Err(WebhookError::MissingSignature)
        ));
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = br#"{"events":[]}"#;
        let sig = sign("other-secret", body);
        assert!(matches!(
            verify_signature("secret", body, Some(&sig)),
            Err(WebhookError::BadSignature)
        ));
    }

    #[test]
    fn tampered_body_rejected() {
        let sig = sign("secret", br#"{"events":[]}"#);
        assert!(verify_signature("secret", br#"{"events":[{}]}"#, Some(&sig)).is_err());
    }

    #[test]
    fn parse_text_message_event() {
        let body = br#"{
            "destination": "xyz",
            "events": [{
                "type": "message",
                "replyToken": "rt-123",
                "source": {"type": "user", "userId": "U1"},
                "message": {"type": "text", "id": "m1", "text": "hello"}
            }]
        }"#;

        let events = parse_events(body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "U1");
        assert_eq!(events[0].text, "hello");
        assert_eq!(events[0].reply_token, "rt-123");
    }

    #[test]
    fn non_text_events_are_skipped() {
        let body = br#"{
            "events": [
                {"type": "follow", "source": {"userId": "U1"}},
                {"type": "message", "replyToken": "rt",
                 "source": {"userId": "U1"},
                 "message": {"type": "sticker"}}
            ]
        }"#;

        let events = parse_events(body).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(matches!(
            parse_events(b"not json"),
            Err(WebhookError::BadPayload(_))
        ));
    }
}
