//! Application-wide constants for airquality-hub.
//!
//! Centralizes file names, intervals and fixed strings so they are
//! discoverable in one place. Constants are grouped by domain.

use std::time::Duration;

// ============================================================================
// Storage
// ============================================================================

/// Append-only log of encrypted device tokens, one hex record per line.
pub const TOKEN_LOG_FILE: &str = "tokens.data";

/// Raw 32-byte AES-256 key.
pub const KEY_FILE: &str = "key.key";

/// Raw 12-byte AES-GCM nonce.
pub const NONCE_FILE: &str = "nonce.key";

/// Default name of the APNs provider signing key (PKCS#8 PEM).
pub const APNS_KEY_FILE: &str = "apnkey.p8";

/// Configuration file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

// ============================================================================
// Rate limiting
// ============================================================================

/// Minimum spacing between admitted alert dispatches.
///
/// One admission per 20 minutes, bucket capacity of one.
pub const NOTIFY_INTERVAL: Duration = Duration::from_secs(20 * 60);

// ============================================================================
// Push delivery
// ============================================================================

/// Title shown on every air quality alert.
pub const ALERT_TITLE: &str = "Air Quality Alert";

/// Bundle identifier of the iOS app, sent as `apns-topic`.
pub const DEFAULT_APNS_TOPIC: &str = "com.harr1424.AirQuality";

/// APNs production gateway.
pub const APNS_PRODUCTION_URL: &str = "https://api.push.apple.com";

/// APNs development gateway.
pub const APNS_SANDBOX_URL: &str = "https://api.sandbox.push.apple.com";

/// Age after which a cached provider token is re-signed.
///
/// APNs rejects tokens older than one hour and throttles tokens refreshed
/// more often than every 20 minutes.
pub const APNS_TOKEN_REFRESH: Duration = Duration::from_secs(50 * 60);

/// HTTP client request timeout for a single push delivery.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Server
// ============================================================================

/// Default listen address for the HTTP service.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5050";
