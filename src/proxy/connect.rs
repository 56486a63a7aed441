//! HTTP CONNECT handling with TLS interception.
//!
//! The flow for an HTTPS client:
//!
//! 1. Client sends `CONNECT api.example.com:443 HTTP/1.1`.
//! 2. Proxy answers `200 Connection Established` and upgrades the stream.
//! 3. Proxy TLS-accepts the raw stream, presenting a leaf certificate for
//!    the target hostname minted under the interception CA.
//! 4. The decrypted stream is served as plain HTTP/1.1; every request on it
//!    becomes an ordinary store-and-forward flow with its URL rebuilt to
//!    absolute `https://` form.
//!
//! Unlike a tunneling proxy there is no upstream socket here at all: the
//! "other side" of the tunnel is the rendezvous directory.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::ProxyError;
use super::flow::{empty_body, text_response, FlowHandler, ProxyBody};
use super::tls::{create_tls_acceptor, CertificateCache};

/// Handle a CONNECT request by upgrading into an intercepted TLS session.
pub async fn handle_connect(
    req: Request<Incoming>,
    cert_cache: Arc<CertificateCache>,
    flow: Arc<FlowHandler>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT request is missing its authority",
            ))
        }
    };
    let (host, _port) = parse_host_port(&authority)?;

    debug!(%authority, "CONNECT accepted, intercepting");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) =
                    serve_intercepted(upgraded, &host, &authority, cert_cache, flow).await
                {
                    // connection resets at tunnel teardown are routine
                    debug!(%authority, "intercepted session ended: {e}");
                }
            }
            Err(e) => warn!(%authority, "HTTP upgrade failed: {e}"),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static response construction cannot fail"))
}

/// TLS-accept the upgraded stream and serve flows inside it.
async fn serve_intercepted(
    upgraded: hyper::upgrade::Upgraded,
    host: &str,
    authority: &str,
    cert_cache: Arc<CertificateCache>,
    flow: Arc<FlowHandler>,
) -> Result<(), ProxyError> {
    let acceptor = create_tls_acceptor(cert_cache, host.to_string());
    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("client TLS handshake failed: {e}")))?;

    debug!(host, "TLS established with client");

    let authority = authority.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let flow = flow.clone();
        let authority = authority.clone();
        async move { Ok::<_, ProxyError>(flow.handle(req, Some(&authority)).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(ProxyError::from)
}

/// Parse `host[:port]` from a CONNECT authority; the port defaults to 443.
pub fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        // IPv6 authorities look like [::1]:443
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConnect(format!("invalid port: {port_str}")))?;
            return Ok((host[1..host.len() - 1].to_string(), port));
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidConnect(format!("invalid port: {port_str}")))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}
