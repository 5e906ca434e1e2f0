//! Apple Push Notification service delivery.
//!
//! Sends alert notifications over the APNs HTTP/2 provider API using
//! token-based authentication: a short JWT signed with ES256 by the
//! provider's P-256 key (`.p8` file from the developer portal).
//!
//! The JWT is cached and re-signed every [`APNS_TOKEN_REFRESH`]; APNs
//! rejects tokens older than one hour.

// Rust guideline compliant 2026-02

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use reqwest::Url;
use serde::Deserialize;

use super::{DeliveryError, Notification, PushOutcome, PushSender};
use crate::config::ApnsConfig;
use crate::constants::{
    APNS_PRODUCTION_URL, APNS_SANDBOX_URL, APNS_TOKEN_REFRESH, HTTP_REQUEST_TIMEOUT,
};
use crate::vault::Token;

/// Provider signing identity.
pub struct ProviderKey {
    signing_key: SigningKey,
    key_id: String,
    team_id: String,
}

impl std::fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKey")
            .field("key_id", &self.key_id)
            .field("team_id", &self.team_id)
            .finish_non_exhaustive()
    }
}

impl ProviderKey {
    /// Wrap an in-memory signing key.
    pub fn new(signing_key: SigningKey, key_id: String, team_id: String) -> Self {
        Self {
            signing_key,
            key_id,
            team_id,
        }
    }

    /// Load the signing key from a PKCS#8 PEM (`.p8`) file.
    pub fn from_pem_file(path: &Path, key_id: String, team_id: String) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read APNs key {}", path.display()))?;
        let signing_key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| anyhow::anyhow!("Invalid APNs key {}: {e}", path.display()))?;
        Ok(Self::new(signing_key, key_id, team_id))
    }

    /// Produce a signed provider token issued at `issued_at` (unix seconds).
    pub fn sign_jwt(&self, issued_at: i64) -> Result<String, DeliveryError> {
        let header = serde_json::json!({ "alg": "ES256", "kid": self.key_id });
        let claims = serde_json::json!({ "iss": self.team_id, "iat": issued_at });

        let encode = |value: &serde_json::Value| {
            serde_json::to_vec(value)
                .map(|bytes| BASE64URL.encode(bytes))
                .map_err(|e| DeliveryError::Auth(e.to_string()))
        };
        let signing_input = format!("{}.{}", encode(&header)?, encode(&claims)?);

        let signature: Signature = self
            .signing_key
            .try_sign(signing_input.as_bytes())
            .map_err(|e| DeliveryError::Auth(e.to_string()))?;

        Ok(format!(
            "{signing_input}.{}",
            BASE64URL.encode(signature.to_bytes())
        ))
    }
}

#[derive(Debug)]
struct CachedToken {
    jwt: String,
    signed_at: Instant,
}

/// Error body returned by APNs on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: String,
}

/// [`PushSender`] backed by the APNs provider API.
///
/// Reuse one client for all deliveries; the inner `reqwest::Client` pools
/// the HTTP/2 connection.
#[derive(Debug)]
pub struct ApnsClient {
    http: reqwest::Client,
    base_url: Url,
    topic: String,
    key: ProviderKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ApnsClient {
    /// Create a client posting to `base_url` (e.g. [`APNS_PRODUCTION_URL`]).
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        topic: String,
        key: ProviderKey,
    ) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid APNs URL: {base_url}"))?;
        anyhow::ensure!(!base_url.cannot_be_a_base(), "APNs URL cannot be a base: {base_url}");

        Ok(Self {
            http,
            base_url,
            topic,
            key,
            cached: Mutex::new(None),
        })
    }

    /// Build a client from configuration, loading the `.p8` key from disk.
    pub fn from_config(config: &ApnsConfig) -> Result<Self> {
        let key = ProviderKey::from_pem_file(
            &config.key_path,
            config.key_id.clone(),
            config.team_id.clone(),
        )?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let base_url = if config.sandbox {
            APNS_SANDBOX_URL
        } else {
            APNS_PRODUCTION_URL
        };

        log::info!(
            "[APNs] Using {} gateway for topic {}",
            if config.sandbox { "sandbox" } else { "production" },
            config.topic
        );
        Self::new(http, base_url, config.topic.clone(), key)
    }

    /// Current provider token, re-signed when older than the refresh age.
    fn provider_token(&self) -> Result<String, DeliveryError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = cached.as_ref() {
            if token.signed_at.elapsed() < APNS_TOKEN_REFRESH {
                return Ok(token.jwt.clone());
            }
        }

        let jwt = self.key.sign_jwt(chrono::Utc::now().timestamp())?;
        log::debug!("[APNs] Signed new provider token");
        *cached = Some(CachedToken {
            jwt: jwt.clone(),
            signed_at: Instant::now(),
        });
        Ok(jwt)
    }

    fn invalidate_token(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn device_url(&self, destination: &Token) -> Result<Url, DeliveryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DeliveryError::Transport(format!("bad APNs URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(["3", "device", destination.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl PushSender for ApnsClient {
    async fn send(
        &self,
        destination: &Token,
        notification: &Notification,
    ) -> Result<PushOutcome, DeliveryError> {
        let url = self.device_url(destination)?;
        let jwt = self.provider_token()?;

        let response = self
            .http
            .post(url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", &self.topic)
            .header("apns-push-type", "alert")
            .header("apns-priority", "10")
            .json(&notification.to_apns_payload())
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match status {
            200..=299 => Ok(PushOutcome::Delivered { id: apns_id }),
            410 => {
                log::info!("[APNs] Device token {destination} is no longer active (410)");
                Ok(PushOutcome::Unregistered)
            }
            _ => {
                let reason = response
                    .json::<ApnsErrorBody>()
                    .await
                    .map_or_else(|_| "Unknown".to_string(), |body| body.reason);

                if reason == "ExpiredProviderToken" || reason == "InvalidProviderToken" {
                    log::warn!("[APNs] Provider token rejected ({reason}), re-signing on next send");
                    self.invalidate_token();
                }

                Err(DeliveryError::Rejected { status, reason })
            }
        }
    }
}
