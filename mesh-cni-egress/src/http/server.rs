use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::{StatusCode, header};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::readiness::Readiness;
use crate::{Result, http::shutdown};

#[derive(Clone)]
pub struct State {
    readiness: Arc<Readiness>,
}

impl State {
    pub fn new(readiness: Arc<Readiness>) -> Self {
        Self { readiness }
    }

    fn ready(&self) -> ReadyResponse {
        let summary = self.readiness.summary();
        if summary.iter().all(|(_, ready)| *ready) {
            ReadyResponse::Ready
        } else {
            let not_ready = summary
                .into_iter()
                .filter(|(_, ready)| !ready)
                .map(|(name, _)| name)
                .collect();
            ReadyResponse::NotReady(not_ready)
        }
    }

    fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*crate::metrics::REGISTRY.read().unwrap();
        match prometheus_client::encoding::text::encode(&mut buffer, registry) {
            Ok(_) => buffer,
            Err(_) => "".into(),
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("egress readiness listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> ReadyResponse {
    handler.ready()
}

enum ReadyResponse {
    Ready,
    NotReady(Vec<String>),
}

impl IntoResponse for ReadyResponse {
    fn into_response(self) -> Response {
        let text = [(header::CONTENT_TYPE, "text/plain")];
        match self {
            ReadyResponse::Ready => (StatusCode::OK, text, "Ok".to_string()).into_response(),
            ReadyResponse::NotReady(reporters) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                text,
                format!("NotReady: {}", reporters.join(", ")),
            )
                .into_response(),
        }
    }
}
