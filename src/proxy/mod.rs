//! The intercepting proxy for the air-gapped side.
//!
//! Terminates HTTP/1.1 and HTTPS (via CONNECT interception with a local CA)
//! on a loopback port, serializes each flow into the rendezvous directory,
//! and blocks the client connection until the matching response envelope is
//! committed by the forwarder on the other side of the gap.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── air-gapped host ────────────────────────────┐
//! │  ┌──────────┐   HTTP(S)    ┌──────────────┐   publish    requests/      │
//! │  │  client  │─────────────►│    proxy     │─────────────►<id>.json      │
//! │  │ program  │◄─────────────│ 127.0.0.1:p  │◄─────────────responses/     │
//! │  └──────────┘   response   └──────────────┘    await     <id>.json      │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                  shared filesystem = the only transport
//! ```
//!
//! There is no upstream networking in this module at all; the forwarder on
//! the Internet-connected host performs the real HTTP call.

pub mod ca;
pub mod connect;
pub mod error;
pub mod flow;
pub mod server;
pub mod tls;

pub use ca::{LeafCertificate, ProxyCa};
pub use error::{CaError, ProxyError};
pub use flow::{FlowFailure, FlowHandler, DEFAULT_SOURCE_PROCESS, PROXY_VERSION};
pub use server::{ProxyConfig, ProxyServer};
pub use tls::{create_tls_acceptor, CertificateCache};
