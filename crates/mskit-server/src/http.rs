//! HTTP routes served on every address.

use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use mskit_grace::{Connection, ConnectionHandler, ProcessRole};
use serde::Serialize;
use tracing::debug;

/// Response of `GET /`: which process answered, for which address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub pid: u32,
    pub role: String,
    pub address: String,
}

#[derive(Debug)]
struct AppState {
    address: String,
    role: ProcessRole,
}

pub fn router(address: String, role: ProcessRole) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/health", get(health))
        .with_state(Arc::new(AppState { address, role }))
}

async fn identity(State(state): State<Arc<AppState>>) -> Json<Identity> {
    Json(Identity {
        pid: std::process::id(),
        role: state.role.to_string(),
        address: state.address.clone(),
    })
}

async fn health() -> &'static str {
    "ok"
}

/// Serve each connection with HTTP/1 or HTTP/2 over the router.
pub fn handler(address: String, role: ProcessRole) -> impl ConnectionHandler {
    let router = router(address, role);
    move |conn: Connection| {
        let service = TowerToHyperService::new(router.clone());
        async move {
            let peer = conn.peer_addr();
            let builder = Builder::new(TokioExecutor::new());
            builder
                .serve_connection(TokioIo::new(conn), service)
                .await
                .map_err(io::Error::other)?;
            debug!(%peer, "HTTP connection closed");
            Ok(())
        }
    }
}
