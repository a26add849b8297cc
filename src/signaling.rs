//! Credential fetch and SDP offer/answer exchange
//!
//! Two plain HTTP calls precede every session: a `GET` against the local
//! token endpoint for a short-lived secret, then a `POST` of the offer SDP to
//! the realtime endpoint, authorized with that secret. The response body of
//! the second call is the answer SDP.

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{RelayError, Result};

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// A short-lived bearer secret authorizing one negotiation.
#[derive(Clone, Deserialize)]
pub struct EphemeralCredential {
    pub value: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl EphemeralCredential {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }
}

// Never print the secret itself.
impl std::fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    client_secret: EphemeralCredential,
}

/// Fetches an ephemeral credential from the local token endpoint.
pub async fn fetch_credential(
    client: &reqwest::Client,
    token_url: &str,
) -> Result<EphemeralCredential> {
    let response = client
        .get(token_url)
        .send()
        .await
        .map_err(|e| RelayError::Credential(format!("request to {token_url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Credential(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| RelayError::Credential(format!("unexpected token response: {e}")))?;

    if token.client_secret.value.is_empty() {
        return Err(RelayError::Credential(
            "token response carried an empty client secret".to_string(),
        ));
    }

    match token.client_secret.expires_at() {
        Some(at) => info!("🔑 Ephemeral credential acquired, expires at {}", at),
        None => info!("🔑 Ephemeral credential acquired"),
    }

    Ok(token.client_secret)
}

/// Posts the local offer and returns the remote answer SDP.
pub async fn exchange_sdp(
    client: &reqwest::Client,
    realtime_url: &str,
    model: &str,
    credential: &EphemeralCredential,
    offer_sdp: String,
) -> Result<String> {
    debug!("Offer SDP:\n{}", offer_sdp);

    let response = client
        .post(realtime_url)
        .query(&[("model", model)])
        .bearer_auth(&credential.value)
        .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
        .body(offer_sdp)
        .send()
        .await
        .map_err(|e| RelayError::Negotiation(format!("request to {realtime_url} failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| {
            RelayError::Negotiation(format!("reading answer from {realtime_url}: {e}"))
        })?;
    if !status.is_success() {
        return Err(RelayError::Negotiation(format!(
            "negotiation endpoint returned {status}: {body}"
        )));
    }
    if body.trim().is_empty() {
        return Err(RelayError::Negotiation(
            "negotiation endpoint returned an empty answer".to_string(),
        ));
    }

    info!("📥 Answer SDP received ({} bytes)", body.len());
    debug!("Answer SDP:\n{}", body);

    Ok(body)
}
