//! HTTP control surface for wash.
//!
//! Exposes the same capability calls the FUSE adapter makes as HTTP
//! endpoints keyed by path and action, plus the activity history and cache
//! clearing. Everything is thin over the registry: the cache and journal
//! behave identically whichever surface a request arrives on.
//!
//! | Endpoint | Capability |
//! |---|---|
//! | `GET /fs/list?path=` | `list` |
//! | `GET /fs/read?path=` | `read` |
//! | `GET /fs/metadata?path=` | `metadata` |
//! | `GET /fs/stream?path=` | `stream` (chunked) |
//! | `POST /fs/exec?path=` | `exec` |
//! | `POST /fs/write?path=` | `write` |
//! | `POST /fs/delete?path=` | `delete` |
//! | `POST /fs/signal?path=&signal=` | `signal` |
//! | `GET /find?path=&...` | traversal with predicates |
//! | `GET /tail?path=&path=...` | multiplexed `stream` following |
//! | `GET /history`, `GET /history/{id}` | journal enumeration |
//! | `POST /cache/clear?path=` | hierarchical invalidation |
//!
//! Requests carry a `Wash-Journal-Id` header to name their journal; absent
//! that, activity is journaled under the peer address.

pub mod find;
mod handlers;
pub mod tail;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use wash_kernel::Registry;

/// A running control server.
pub struct WashServer {
    /// The actual bound address (useful with port 0).
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl WashServer {
    /// Bind and start serving in a background task.
    pub async fn start(
        registry: Arc<Registry>,
        addr: SocketAddr,
        call_deadline: Duration,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("wash control server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(serve(listener, registry, call_deadline, shutdown_rx));

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    call_deadline: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("control server shutting down");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                handlers::handle(registry.clone(), peer, call_deadline, req)
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}
