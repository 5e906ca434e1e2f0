//! HTTP boundary for device registration and sensor alerts.
//!
//! # Routes
//!
//! | Route                        | Body                               | Success |
//! |------------------------------|------------------------------------|---------|
//! | `POST /`, `POST /register`   | `{"id": "<token>"}`                | 201     |
//! | `POST /notify`               | `{"time","pollutant","value"}`     | 201     |
//!
//! `/notify` answers 429 when the rate limiter denies admission. Malformed
//! bodies get an empty 400. Error detail is only ever logged.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::keys::ensure_key_material;
use crate::notifications::apns::ApnsClient;
use crate::notifications::{AlertEvent, Dispatcher, PushSender};
use crate::rate_limit::RateLimiter;
use crate::vault::{TokenVault, VaultError};

/// Registration request from the iOS app.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Device token. The app sends it as `"ID"`.
    #[serde(alias = "ID")]
    pub id: String,
}

/// A measurement value, sent as either a string or a bare number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Measurement {
    Text(String),
    Number(serde_json::Number),
}

impl Measurement {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

/// Alert report from the sensor.
#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    time: String,
    pollutant: String,
    value: Measurement,
}

impl NotifyRequest {
    fn into_alert(self) -> AlertEvent {
        AlertEvent {
            time: self.time,
            pollutant: self.pollutant,
            value: self.value.into_string(),
        }
    }
}

/// Shared state for Axum handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Registered device tokens.
    pub vault: Arc<TokenVault>,
    /// Admission gate for `/notify`.
    pub limiter: Arc<RateLimiter>,
    /// Alert fan-out.
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Wire the vault to a push sender with the given limiter.
    pub fn new(vault: Arc<TokenVault>, sender: Arc<dyn PushSender>, limiter: RateLimiter) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&vault), sender);
        Self {
            vault,
            limiter: Arc::new(limiter),
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(register_token))
        .route("/register", post(register_token))
        .route("/notify", post(notify))
        .with_state(state)
}

async fn register_token(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let request: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[Server] Could not read registration body: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    if request.id.trim().is_empty() {
        log::warn!("[Server] Rejected registration with empty token");
        return StatusCode::BAD_REQUEST;
    }

    let vault = Arc::clone(&state.vault);
    let result = tokio::task::spawn_blocking(move || vault.register(&request.id)).await;

    match result {
        Ok(Ok(_outcome)) => StatusCode::CREATED,
        Ok(Err(e @ VaultError::Persistence { .. })) => {
            // Token stays registered in memory; durability is best effort
            log::error!("[Server] {e}");
            StatusCode::CREATED
        }
        Ok(Err(e)) => {
            log::error!("[Server] Registration failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            log::error!("[Server] Registration task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn notify(State(state): State<AppState>, body: Bytes) -> StatusCode {
    if !state.limiter.try_admit() {
        log::info!("[Server] Alert rejected by rate limiter");
        return StatusCode::TOO_MANY_REQUESTS;
    }

    let alert = match serde_json::from_slice::<NotifyRequest>(&body) {
        Ok(request) => request.into_alert(),
        Err(e) => {
            log::warn!("[Server] Could not read alert body: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    state.dispatcher.dispatch(&alert).await;
    StatusCode::CREATED
}

/// Serve `router(state)` on `listener` until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

/// Start the service described by `config` and run until Ctrl-C.
///
/// Key material failure is fatal. A missing APNs key is fatal as well,
/// since alerts could never be delivered.
pub async fn run(config: Config) -> Result<()> {
    let keys = ensure_key_material(&config.data_dir).context("Failed to initialize key material")?;

    let log_path = config.token_log_path();
    let vault = tokio::task::spawn_blocking(move || TokenVault::open(log_path, keys))
        .await
        .context("Vault load task failed")?
        .context("Failed to load token vault")?;

    let sender = ApnsClient::from_config(&config.apns)?;
    let state = AppState::new(Arc::new(vault), Arc::new(sender), RateLimiter::default());

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    log::info!(
        "[Server] Listening on {} with {} registered device(s)",
        addr,
        state.vault.len()
    );

    serve_with_shutdown(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[Server] Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        log::info!("[Server] Shutting down");
    })
    .await
}
