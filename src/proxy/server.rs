//! The intercepting proxy server.
//!
//! Listens on a loopback TCP port, speaks HTTP/1.1, and turns every client
//! exchange into a store-and-forward flow through the rendezvous directory.
//! `CONNECT` requests are upgraded into TLS-intercepted sessions; everything
//! else must arrive in absolute-form as proxy clients do.
//!
//! Each accepted connection is served in its own Tokio task; shutdown is
//! signaled through a `watch` channel, after which the accept loop stops and
//! in-flight flows finish or are dropped with their client sockets.
//!
//! # Example
//!
//! ```ignore
//! use della_wonders::proxy::{ProxyConfig, ProxyServer};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(config, shutdown_rx).await?;
//! println!("listening on {}", server.local_addr());
//! server.run().await?;
//! ```

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ca::ProxyCa;
use super::connect::handle_connect;
use super::error::{ProxyError, ProxyResult};
use super::flow::FlowHandler;
use super::tls::CertificateCache;
use crate::store::RendezvousStore;

/// Configuration for the intercepting proxy.
pub struct ProxyConfig {
    /// Loopback address to listen on.
    pub listen_addr: SocketAddr,
    /// Interception CA used to mint leaf certificates.
    pub ca: Arc<ProxyCa>,
    /// Rendezvous store shared with the forwarder through the filesystem.
    pub store: Arc<RendezvousStore>,
    /// How long each flow waits for its response envelope.
    pub response_timeout: Duration,
    /// Response-size ceiling advertised in request envelopes.
    pub max_response_size: u64,
    /// Process name recorded in request envelopes.
    pub source_process: String,
}

/// The intercepting proxy, bound and ready to serve.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    cert_cache: Arc<CertificateCache>,
    flow: Arc<FlowHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Separated from [`run`] so callers can fail fast
    /// (and report the bound port) before any client is launched.
    ///
    /// [`run`]: ProxyServer::run
    pub async fn bind(
        config: ProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let cert_cache = Arc::new(CertificateCache::new(config.ca.clone()));
        let flow = Arc::new(FlowHandler::new(
            config.store.clone(),
            config.response_timeout,
            config.max_response_size,
            config.source_process.clone(),
        ));

        info!(addr = %local_addr, "proxy listening");

        Ok(Self {
            listener,
            local_addr,
            cert_cache,
            flow,
            shutdown_rx,
        })
    }

    /// The bound address (useful with port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until the shutdown signal fires.
    pub async fn run(self) -> ProxyResult<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted client connection");
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => warn!("failed to accept connection: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_connection_handler(&self, stream: TcpStream) {
        let cert_cache = self.cert_cache.clone();
        let flow = self.flow.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, cert_cache, flow).await {
                let text = e.to_string();
                // resets and broken pipes are everyday client behavior
                if text.contains("connection reset") || text.contains("broken pipe") {
                    debug!("connection ended: {text}");
                } else {
                    warn!("connection error: {text}");
                }
            }
        });
    }
}

/// Serve one client connection, dispatching CONNECT vs plain flows.
async fn serve_client(
    stream: TcpStream,
    cert_cache: Arc<CertificateCache>,
    flow: Arc<FlowHandler>,
) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let cert_cache = cert_cache.clone();
        let flow = flow.clone();

        async move {
            if req.method() == Method::CONNECT {
                handle_connect(req, cert_cache, flow).await
            } else {
                Ok(flow.handle(req, None).await)
            }
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}
