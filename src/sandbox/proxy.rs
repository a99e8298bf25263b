//! Forwarding proxy for the container sandbox backend: a loopback HTTP
//! server on an ephemeral host port that forwards the two hook paths to the
//! real router address and returns its response verbatim. Exists because a
//! container's child interpreter cannot reach the driver's loopback router
//! directly.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{Result, RlmError};

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    target: Arc<RwLock<SocketAddr>>,
}

/// Owns the bound listener and background serve task for the lifetime of one
/// container sandbox session.
pub struct ForwardingProxy {
    target: Arc<RwLock<SocketAddr>>,
    port: u16,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ForwardingProxy {
    pub fn new(router_addr: SocketAddr) -> Self {
        Self {
            target: Arc::new(RwLock::new(router_addr)),
            port: 0,
            handle: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Rebind the proxy's forwarding target, used when a persistent sandbox
    /// is reattached to a fresh per-completion router.
    pub fn retarget(&self, addr: SocketAddr) {
        let target = self.target.clone();
        tokio::spawn(async move {
            *target.write().await = addr;
        });
    }

    pub async fn start(&mut self) -> Result<()> {
        let state = ProxyState {
            client: reqwest::Client::new(),
            target: self.target.clone(),
        };

        let app = Router::new()
            .route("/llm_query", post(forward))
            .route("/llm_query_batched", post(forward))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(RlmError::Io)?;
        self.port = listener
            .local_addr()
            .map_err(RlmError::Io)?
            .port();

        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "forwarding proxy server exited");
            }
        }));

        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Forward the request body and path verbatim to the current router target,
/// returning its response verbatim.
async fn forward(
    State(state): State<ProxyState>,
    uri: axum::http::Uri,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let target = *state.target.read().await;
    let url = format!("http://{target}{}", uri.path());

    match state
        .client
        .post(&url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes)
        }
        Err(e) => {
            let body = serde_json::json!({"error": format!("proxy forwarding error: {e}")});
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from(body.to_string()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_binds_an_ephemeral_port() {
        let mut proxy = ForwardingProxy::new("127.0.0.1:9000".parse().unwrap());
        proxy.start().await.unwrap();
        assert!(proxy.port() > 0);
        proxy.stop().await;
    }
}
