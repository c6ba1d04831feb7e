//! Serving side of the socket control channel.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port) unless told otherwise, and
//! hands each received path to a [`ControlBackend`]. Each connection runs in
//! its own task; requests on one connection are answered in order.

use super::protocol::{read_frame, write_frame, OpenReply, OpenRequest};
use crate::config::ChannelConfig;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Resolves an encoded path into an open outcome.
///
/// Return 0 for a successful open, otherwise a positive error number. This is
/// where a real backend plugs in.
#[async_trait::async_trait]
pub trait ControlBackend: Send + Sync + 'static {
    async fn open(&self, path: &str) -> i32;
}

/// Handle to a running server. Dropping shuts it down.
pub struct ControlServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ControlServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and signal every connection handler to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ControlServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct ControlServer;

impl ControlServer {
    /// Start on a random local port.
    pub async fn start<B: ControlBackend>(backend: Arc<B>) -> Result<ControlServerHandle> {
        Self::bind("127.0.0.1:0", backend).await
    }

    /// Start on an explicit address.
    pub async fn bind<B: ControlBackend>(addr: &str, backend: Arc<B>) -> Result<ControlServerHandle> {
        Self::bind_with_limit(addr, backend, ChannelConfig::MAX_CONNECTIONS).await
    }

    /// Start on an explicit address, serving at most `max_connections` at once.
    pub async fn bind_with_limit<B: ControlBackend>(
        addr: &str,
        backend: Arc<B>,
        max_connections: usize,
    ) -> Result<ControlServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(target: "klnk::channel", "control server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            backend,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
            max_connections,
        ));

        Ok(ControlServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<B: ControlBackend>(
        listener: TcpListener,
        backend: Arc<B>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
        max_connections: usize,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!(target: "klnk::channel", "control server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    target: "klnk::channel",
                                    "rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let backend = backend.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                debug!(target: "klnk::channel", "connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*backend, &mut conn_shutdown).await {
                                    debug!(target: "klnk::channel", "connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!(target: "klnk::channel", "accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<B: ControlBackend>(
        mut stream: TcpStream,
        backend: &B,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let reply = Self::process_request(&frame, backend).await;
            let reply_bytes = serde_json::to_vec(&reply)?;
            write_frame(&mut writer, &reply_bytes).await?;
        }
    }

    async fn process_request<B: ControlBackend>(frame: &[u8], backend: &B) -> OpenReply {
        let request: OpenRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                warn!(target: "klnk::channel", "unparseable request: {}", e);
                return OpenReply::new(0, libc::EPROTO);
            }
        };

        if request.version != ChannelConfig::PROTOCOL_VERSION {
            warn!(
                target: "klnk::channel",
                "request version {} unsupported",
                request.version
            );
            return OpenReply::new(request.seq, libc::EPROTO);
        }

        let code = backend.open(&request.path).await;
        debug!(target: "klnk::channel", path = %request.path, code, "answered");
        OpenReply::new(request.seq, code)
    }
}
