//! WebSocket endpoint that upgrades connections into terminal sessions.
//!
//! The server accepts TCP connections, upgrades `GET <path>` requests with
//! tokio-tungstenite, and hands each upgraded socket to a [`Session`]. Other
//! paths are answered with `404`, and a full registry answers `503` before
//! the upgrade so a rejected client never sees a half-open terminal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::session::{Session, SessionRegistry, SessionSettings, TerminationReason};

/// Upper bound on the HTTP upgrade exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for live sessions after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection state shared by every handler task.
struct Endpoint {
    path: String,
    registry: Arc<SessionRegistry>,
    settings: SessionSettings,
    ws_config: WebSocketConfig,
}

/// A bound terminal server.
pub struct TerminalServer {
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
}

impl TerminalServer {
    /// Binds the listener described by `config`.
    pub async fn bind(config: &Config) -> Result<Self> {
        let addr = config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.session.max_frame_size);
        ws_config.max_frame_size = Some(config.session.max_frame_size);

        let endpoint = Endpoint {
            path: config.server.path.clone(),
            registry: Arc::new(SessionRegistry::new(config.server.max_sessions)),
            settings: SessionSettings::from_config(&config.session),
            ws_config,
        };

        Ok(Self {
            listener,
            endpoint: Arc::new(endpoint),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Registry of live sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.endpoint.registry)
    }

    /// Serves connections until `shutdown` is cancelled, then stops every
    /// live session and waits for them to drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, path = %self.endpoint.path, "Terminal server listening");
        }

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Terminal server received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let endpoint = Arc::clone(&self.endpoint);
                        let shutdown = shutdown.clone();
                        tasks.spawn(handle_connection(stream, peer, endpoint, shutdown));
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(self.listener);

        let registry = &self.endpoint.registry;
        registry.shutdown_all();
        if !registry.wait_idle(DRAIN_TIMEOUT).await {
            warn!(remaining = registry.count(), "Sessions did not drain before timeout");
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tasks.shutdown().await;
        }

        info!("Terminal server stopped");
        Ok(())
    }
}

/// Upgrades one connection and runs its session.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<Endpoint>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    // Reserved only once a request for the terminal path has arrived, so
    // connections stalled before or during the request line hold no slot.
    let mut slot = None;
    let path = endpoint.path.as_str();
    let registry = &endpoint.registry;
    let reserved = &mut slot;

    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let requested = request.uri().path();
        if requested != path {
            debug!(peer = %peer, path = %requested, "Rejecting request for unknown path");
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        match registry.try_reserve() {
            Some(granted) => {
                *reserved = Some(granted);
                Ok(response)
            }
            None => Err(reject(StatusCode::SERVICE_UNAVAILABLE, "too many sessions")),
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(endpoint.ws_config),
    );
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    // The callback only admits the upgrade after reserving a slot.
    let Some(mut slot) = slot else {
        return;
    };

    let session = Session::new();
    slot.register(&session, Some(peer));
    info!(session_id = %session.id(), peer = %peer, "Terminal connection accepted");

    if shutdown.is_cancelled() {
        session
            .lifecycle()
            .begin_teardown(TerminationReason::Shutdown);
    }

    session.run(ws, &endpoint.settings).await;
    drop(slot);
}

/// Builds an HTTP error response for a refused upgrade.
fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_reject_response() {
        let response = reject(StatusCode::SERVICE_UNAVAILABLE, "too many sessions");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body().as_deref(), Some("too many sessions"));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = TerminalServer::bind(&test_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.registry().count(), 0);
        assert_eq!(server.registry().capacity(), 16);
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let mut config = test_config();
        config.server.bind_addr = "not-an-address".to_string();
        assert!(TerminalServer::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = TerminalServer::bind(&test_config()).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
