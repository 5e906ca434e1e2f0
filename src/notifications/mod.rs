//! Air quality alert fan-out.
//!
//! Turns one alert reported by the sensor into one notification and
//! delivers it to every registered device.
//!
//! # Architecture
//!
//! ```text
//! POST /notify (sensor)
//!     ↓
//! RateLimiter::try_admit        (denied → 429, nothing sent)
//!     ↓
//! Dispatcher::dispatch
//!     ├─ TokenVault::all()      snapshot of recipients
//!     └─ PushSender::send × N   concurrent, each failure isolated
//! ```
//!
//! Delivery outcomes are logged and counted in a [`DispatchReport`]; they are
//! never propagated to the sensor.

// Rust guideline compliant 2026-02

pub mod apns;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::ALERT_TITLE;
use crate::vault::{Token, TokenVault};

/// A measurement that exceeded air quality guidelines.
///
/// Ephemeral: exists for the duration of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// When the measurement was taken, as formatted by the sensor.
    pub time: String,
    /// Pollutant name (e.g. "PM2.5").
    pub pollutant: String,
    /// Measured concentration, as formatted by the sensor.
    pub value: String,
}

/// The user-visible content of one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Fixed alert title.
    pub title: String,
    /// `"<pollutant> of <value> measured <time>"`.
    pub subtitle: String,
}

impl Notification {
    /// Build the notification for an alert.
    pub fn from_alert(alert: &AlertEvent) -> Self {
        Self {
            title: ALERT_TITLE.to_string(),
            subtitle: format!(
                "{} of {} measured {}",
                alert.pollutant, alert.value, alert.time
            ),
        }
    }

    /// APNs JSON payload (`aps.alert` dictionary).
    pub fn to_apns_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "aps": {
                "alert": {
                    "title": self.title,
                    "subtitle": self.subtitle,
                }
            }
        })
    }
}

/// Successful outcome of a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The push service accepted the notification.
    Delivered {
        /// Provider-assigned notification id, if returned.
        id: Option<String>,
    },
    /// The destination is no longer valid (device uninstalled the app).
    Unregistered,
}

/// Errors delivering to a single recipient.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The request never got a response.
    #[error("push request failed: {0}")]
    Transport(String),
    /// The push service answered with an error status.
    #[error("push rejected (HTTP {status}): {reason}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Provider's reason string.
        reason: String,
    },
    /// Provider authentication could not be produced.
    #[error("push authentication failed: {0}")]
    Auth(String),
}

/// Delivers one notification to one destination.
///
/// Implementors own the transport; the dispatcher only sees this seam.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Send `notification` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] when this one delivery fails. Callers
    /// continue with other recipients.
    async fn send(
        &self,
        destination: &Token,
        notification: &Notification,
    ) -> Result<PushOutcome, DeliveryError>;
}

/// Per-dispatch delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients a delivery was attempted for.
    pub attempted: usize,
    /// Accepted by the push service.
    pub delivered: usize,
    /// Reported as no longer registered.
    pub unregistered: usize,
    /// Failed with a [`DeliveryError`].
    pub failed: usize,
}

/// Fans an alert out to every token in the vault.
pub struct Dispatcher {
    vault: Arc<TokenVault>,
    sender: Arc<dyn PushSender>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("vault", &self.vault.path())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher over `vault` delivering through `sender`.
    pub fn new(vault: Arc<TokenVault>, sender: Arc<dyn PushSender>) -> Self {
        Self { vault, sender }
    }

    /// Deliver `alert` to every registered token.
    ///
    /// Must only be called after rate limiter admission. Every recipient gets
    /// exactly one attempt; failures are logged and counted, never returned.
    pub async fn dispatch(&self, alert: &AlertEvent) -> DispatchReport {
        let notification = Notification::from_alert(alert);
        let recipients = self.vault.all();

        log::info!(
            "[Dispatch] Sending \"{}\" to {} device(s)",
            notification.subtitle,
            recipients.len()
        );

        let deliveries = recipients.iter().map(|token| {
            let sender = Arc::clone(&self.sender);
            let notification = &notification;
            async move { (token, sender.send(token, notification).await) }
        });

        let mut report = DispatchReport {
            attempted: recipients.len(),
            ..DispatchReport::default()
        };

        for (token, result) in join_all(deliveries).await {
            match result {
                Ok(PushOutcome::Delivered { id }) => {
                    log::info!(
                        "[Dispatch] Delivered to {token} (id: {})",
                        id.as_deref().unwrap_or("-")
                    );
                    report.delivered += 1;
                }
                Ok(PushOutcome::Unregistered) => {
                    log::warn!("[Dispatch] {token} is no longer registered with the push service");
                    report.unregistered += 1;
                }
                Err(e) => {
                    log::warn!("[Dispatch] Delivery to {token} failed: {e}");
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "[Dispatch] Done: {} delivered, {} unregistered, {} failed",
            report.delivered,
            report.unregistered,
            report.failed
        );
        report
    }
}
