//! AirQuality Hub - device token vault and air quality alert fan-out.
//!
//! Registers iOS device tokens sent by the app, stores them encrypted at
//! rest, and pushes an alert to every registered device when the sensor
//! reports a measurement over the guideline limit.
//!
//! # Architecture
//!
//! ```text
//! app ── POST / ──────► server ─► vault ─► crypto ─► tokens.data
//!                                   ▲
//! sensor ─ POST /notify ► server ─► rate_limit ─► notifications ─► APNs
//! ```
//!
//! # Modules
//!
//! - [`keys`] - Key and nonce loading / first-run generation
//! - [`crypto`] - AES-256-GCM token codec
//! - [`vault`] - Deduplicated encrypted token log
//! - [`rate_limit`] - Dispatch admission control
//! - [`notifications`] - Alert fan-out and APNs delivery
//! - [`server`] - HTTP routes
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod crypto;
pub mod keys;
pub mod notifications;
pub mod rate_limit;
pub mod server;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use keys::{ensure_key_material, KeyMaterial};
pub use notifications::{AlertEvent, Dispatcher, Notification, PushSender};
pub use rate_limit::RateLimiter;
pub use vault::{Token, TokenVault};
