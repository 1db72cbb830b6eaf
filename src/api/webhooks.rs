//! Webhook ingress: Slack Events API (HMAC-SHA256) and Discord's signed
//! webhook events (Ed25519). Both verify the signature before the payload
//! ever reaches a `ChatAdapter`.

use super::AppState;
use crate::crypto;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub(super) enum WebhookError {
    SignatureInvalid,
    NotConfigured,
    Malformed,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::SignatureInvalid => StatusCode::UNAUTHORIZED,
            Self::NotConfigured => StatusCode::NOT_FOUND,
            Self::Malformed => StatusCode::BAD_REQUEST,
        };
        status.into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

pub(super) async fn handle_slack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, WebhookError> {
    let secret = state.slack_signing_secret.as_deref().ok_or(WebhookError::NotConfigured)?;
    let slack = state.slack.as_ref().ok_or(WebhookError::NotConfigured)?;

    let signature = header_str(&headers, "X-Slack-Signature").ok_or(WebhookError::SignatureInvalid)?;
    let signature = signature.strip_prefix("v0=").unwrap_or(signature);

    if !crypto::verify_hmac_signature(secret.as_bytes(), &body, signature) {
        return Err(WebhookError::SignatureInvalid);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| WebhookError::Malformed)?;

    // Slack's one-time URL verification handshake: echo the challenge back
    // as plain text, no event to ingest.
    if payload.get("type").and_then(|v| v.as_str()) == Some("url_verification") {
        let challenge = payload
            .get("challenge")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::Malformed)?;
        return Ok(challenge.to_string());
    }

    let event: slack_morphism::prelude::SlackPushEvent =
        serde_json::from_value(payload).map_err(|_| WebhookError::Malformed)?;

    if let slack_morphism::prelude::SlackPushEvent::EventCallback(callback) = event {
        slack.ingest(callback.event).await;
    }

    Ok("ok".to_string())
}

pub(super) async fn handle_discord(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, WebhookError> {
    let public_key = state.discord_public_key.as_deref().ok_or(WebhookError::NotConfigured)?;
    let discord = state.discord.as_ref().ok_or(WebhookError::NotConfigured)?;

    let signature = header_str(&headers, "X-Signature-Ed25519").ok_or(WebhookError::SignatureInvalid)?;
    let timestamp = header_str(&headers, "X-Signature-Timestamp").ok_or(WebhookError::SignatureInvalid)?;

    if !crypto::verify_ed25519_signature(public_key, timestamp, &body, signature) {
        return Err(WebhookError::SignatureInvalid);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| WebhookError::Malformed)?;

    // type 0 is Discord's PING used to confirm endpoint ownership; no event
    // body accompanies it.
    if payload.get("type").and_then(|v| v.as_i64()) == Some(0) {
        return Ok("{\"type\":0}".to_string());
    }

    discord.ingest(&payload).await;

    Ok("ok".to_string())
}
