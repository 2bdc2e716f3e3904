mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::readiness::Readiness;

pub use server::{State, router};

/// Serves `/readyz` and `/metrics` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    readiness: Arc<Readiness>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(server::State::new(readiness));
    server::serve(addr, state, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
